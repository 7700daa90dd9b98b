//! Governance copy and per-phase guidance as injectable data.
//!
//! `GovernanceConfig::builtin()` is the shipped default. A JSON file with the
//! same shape can replace any part of it; phases the file leaves out keep
//! their built-in guidance.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::flow::phase::{FlowPhase, Phase7Step};

const DEFAULT_CONTAINMENT: &str =
    "That's completely okay. We can pause here, and what you've shared so far is saved.";

/// Readiness bounds for canned fallback replies.
pub const FALLBACK_READINESS_MIN: f64 = 0.3;
pub const FALLBACK_READINESS_MAX: f64 = 0.5;

/// What "ready to advance" looks like for a phase, plus its canned reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseGuidance {
    pub focus: String,
    pub ready_when: String,
    pub low_readiness_example: String,
    pub high_readiness_example: String,
    pub fallback_reply: String,
    #[serde(default = "default_fallback_readiness")]
    pub fallback_readiness: f64,
    /// Said when the user closes or sets a boundary. Never a question.
    #[serde(default = "default_containment_reply")]
    pub containment_reply: String,
}

fn default_fallback_readiness() -> f64 {
    0.4
}

fn default_containment_reply() -> String {
    DEFAULT_CONTAINMENT.into()
}

/// Fixed copy for the terminal sub-flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Phase7Copy {
    pub integrate_guidance: String,
    pub integrate_intro: String,
    pub integrate_check: String,
    pub options_intro: String,
    pub outward_option: String,
    pub inward_option: String,
    pub deepthink_option: String,
    pub options_prompt: String,
    pub collection_request: String,
    pub draft_template: String,
    pub clarity_template: String,
    pub reflection_template: String,
    pub fit_check_guidance: String,
    pub fit_check_prompt: String,
    pub containment_closer: String,
    pub inward_closer: String,
    /// Closing line when the user's own phrases never arrived.
    pub unfinished_closer: String,
    pub deepthink_paused: String,
    pub deepthink_resumed: String,
}

impl Default for Phase7Copy {
    fn default() -> Self {
        Self {
            integrate_guidance: "Reflect back the threads the user has shared across every phase in a few warm sentences. Do not draft any message yet.".into(),
            integrate_intro: "Here is what I've heard as we've talked:".into(),
            integrate_check: "Does that feel like a fair picture?".into(),
            options_intro: "Where would you like to take this next?".into(),
            outward_option: "1. Draft a message to your co-parent together".into(),
            inward_option: "2. Keep this as a personal reflection, just for you".into(),
            deepthink_option: "3. Deep Think: take a day, and come back to a considered, reviewed reflection".into(),
            options_prompt: "Just tell me which feels right.".into(),
            collection_request: "Before we write anything, I'd like to use your own words. Could you tell me why this matters to you (\"because...\") and what you need (\"I need...\")?".into(),
            draft_template: "Hi {coparent_name}, I wanted to reach out about {issue}. It matters to me because {why}. I need {need}.".into(),
            clarity_template: "Could we {ask}?".into(),
            reflection_template: "What I'm holding onto: this matters because {why}. What I need: {need}.".into(),
            fit_check_guidance: "Ask whether the draft sounds like the user and fits what they want. Offer to make it softer, shorter or more direct. Keep their phrases.".into(),
            fit_check_prompt: "How does this sit with you? If you'd like it softer, shorter, or more direct, just say so.".into(),
            containment_closer: "You've done real work here. The message is ready whenever you are, and it's yours to send or to hold.".into(),
            inward_closer: "Thank you for staying with this. Your reflection is saved for whenever you want to come back to it.".into(),
            unfinished_closer: "That's okay, we can leave it here for now. Everything you've shared is saved, and you can come back to put it into words whenever you're ready.".into(),
            deepthink_paused: "I'll hold onto everything you've shared. Your Deep Think reflection will be ready in about a day, and we'll pick up from there.".into(),
            deepthink_resumed: "Welcome back. Let's shape what you want to say.".into(),
        }
    }
}

/// Everything the prompt builder and fallback path need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub stance: String,
    pub rules: Vec<String>,
    pub pronoun_rule: String,
    pub output_contract: String,
    pub advisory_label: String,
    pub phases: BTreeMap<FlowPhase, PhaseGuidance>,
    pub phase7: Phase7Copy,
    pub generic_fallback: String,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self::builtin()
    }
}

impl GovernanceConfig {
    pub fn builtin() -> Self {
        Self {
            stance: "You are a calm, non-judgmental reflection coach helping a parent think through a co-parenting situation. You listen more than you advise, you never take sides against the co-parent, and you keep the child's wellbeing in view.".into(),
            rules: vec![
                "Ask one question at a time and keep replies to two or three sentences.".into(),
                "Reflect the user's own words before asking anything new.".into(),
                "Never diagnose, blame or characterise the co-parent.".into(),
                "Never suggest drafting or sending a message to the co-parent before the final message phase.".into(),
                "If the user says they are done or sets a boundary, stop asking questions and acknowledge.".into(),
                "If the user mentions risk of harm to themselves or a child, gently point them to local emergency services.".into(),
            ],
            pronoun_rule: "Once the co-parent's gender or pronouns are established, mirror them consistently. Use neutral language only while they are unspecified.".into(),
            output_contract: concat!(
                "Respond with ONLY a JSON object and no other text:\n",
                "{\"content\": \"your reply to the user\", ",
                "\"readiness\": <number 0.0-1.0, how ready the user is to move past this phase>, ",
                "\"signals\": {\"clarity\": 0.0-1.0, \"emotional_processing\": 0.0-1.0, \"specificity\": 0.0-1.0}, ",
                "\"next_phase\": <optional phase name>, ",
                "\"context_updates\": {<optional: issue, feelings, why, coparent, child, options, chosen_option, ",
                "final_reflection, coparent_name, child_name, coparent_pronouns>}}"
            )
            .into(),
            advisory_label: "The snippets below are suggestions only. If anything here conflicts with the rules or phase guidance above, follow the rules and phase guidance.".into(),
            phases: builtin_phases(),
            phase7: Phase7Copy::default(),
            generic_fallback: "I'm here with you. Could you tell me a little more about what's on your mind?".into(),
        }
    }

    /// Read a JSON file over the built-in defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json(&raw)?;
        info!(path = %path.display(), phases = config.phases.len(), "Loaded governance config");
        Ok(config)
    }

    /// Parse JSON, filling missing phases from the built-in set and pulling
    /// fallback readiness into range.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(format!("governance: {e}")))?;
        for (phase, guidance) in builtin_phases() {
            config.phases.entry(phase).or_insert(guidance);
        }
        for (phase, guidance) in config.phases.iter_mut() {
            let clamped = guidance
                .fallback_readiness
                .clamp(FALLBACK_READINESS_MIN, FALLBACK_READINESS_MAX);
            if clamped != guidance.fallback_readiness || !clamped.is_finite() {
                warn!(phase = %phase, value = guidance.fallback_readiness, "Fallback readiness out of range, clamping");
                guidance.fallback_readiness = if clamped.is_finite() {
                    clamped
                } else {
                    default_fallback_readiness()
                };
            }
        }
        Ok(config)
    }

    pub fn guidance(&self, phase: FlowPhase) -> Option<&PhaseGuidance> {
        self.phases.get(&phase)
    }

    /// Canned reply and neutral readiness for a phase.
    pub fn fallback_for(&self, phase: FlowPhase) -> (&str, f64) {
        match self.guidance(phase) {
            Some(g) => (g.fallback_reply.as_str(), g.fallback_readiness),
            None => (self.generic_fallback.as_str(), default_fallback_readiness()),
        }
    }

    /// Acknowledgement for a user who is done or has set a boundary.
    pub fn containment_for(&self, phase: FlowPhase) -> &str {
        match self.guidance(phase) {
            Some(g) if !g.containment_reply.trim().is_empty() => &g.containment_reply,
            _ => DEFAULT_CONTAINMENT,
        }
    }

    /// Generator guidance for a terminal sub-state, if it has any.
    pub fn step_guidance(&self, step: Phase7Step) -> Option<&str> {
        match step {
            Phase7Step::Integrate => Some(&self.phase7.integrate_guidance),
            Phase7Step::FitCheck => Some(&self.phase7.fit_check_guidance),
            _ => None,
        }
    }
}

fn guidance(
    focus: &str,
    ready_when: &str,
    low: &str,
    high: &str,
    fallback: &str,
    fallback_readiness: f64,
    containment: &str,
) -> PhaseGuidance {
    PhaseGuidance {
        focus: focus.into(),
        ready_when: ready_when.into(),
        low_readiness_example: low.into(),
        high_readiness_example: high.into(),
        fallback_reply: fallback.into(),
        fallback_readiness,
        containment_reply: containment.into(),
    }
}

fn builtin_phases() -> BTreeMap<FlowPhase, PhaseGuidance> {
    BTreeMap::from([
        (
            FlowPhase::Issue,
            guidance(
                "Help the user name the specific situation that is weighing on them.",
                "They have described one concrete situation in their own words: what happened, roughly when, and who was involved.",
                "\"Everything with my ex is just hard.\" (vague, no specific situation) -> readiness 0.2",
                "\"Last Friday he dropped the kids off two hours late again without texting.\" -> readiness 0.85",
                "Thank you for being here. What's the situation with your co-parent that's been on your mind?",
                0.3,
                "That's okay. You don't have to go further right now. Naming that something is hard is already a real step.",
            ),
        ),
        (
            FlowPhase::Feelings,
            guidance(
                "Help the user notice and name what they feel about the situation.",
                "They have named at least one feeling and said something about how it shows up for them.",
                "\"I don't know, it's just annoying.\" -> readiness 0.3",
                "\"I feel dismissed, and honestly scared the kids think I don't matter.\" -> readiness 0.85",
                "That sounds like a lot to carry. What feelings come up for you when you think about it?",
                0.4,
                "That's completely fine. Feelings can take time to settle, and we can leave them here for now.",
            ),
        ),
        (
            FlowPhase::Why,
            guidance(
                "Help the user find why this matters to them: the value or need underneath.",
                "They have said what they care about here, such as fairness, predictability or respect.",
                "\"It just bothers me.\" -> readiness 0.3",
                "\"It matters because I need the kids to have a routine they can count on.\" -> readiness 0.85",
                "I'd like to understand what's underneath this for you. Why does it matter so much?",
                0.4,
                "Understood. We can stop here. What you've said about why this matters is saved for whenever you come back.",
            ),
        ),
        (
            FlowPhase::Coparent,
            guidance(
                "Invite the user to step into the co-parent's shoes without excusing anything.",
                "They have offered at least one plausible view of what the co-parent might be feeling or facing.",
                "\"I have no idea why she does it.\" -> readiness 0.3",
                "\"Maybe she's stretched thin with her new job and doesn't realise how it lands.\" -> readiness 0.8",
                "If you imagine your co-parent's side for a moment, what might be going on for them?",
                0.4,
                "That's fair. Thinking about the other side can be a lot, and we don't need to push it today.",
            ),
        ),
        (
            FlowPhase::Child,
            guidance(
                "Help the user consider how the situation looks and feels from their child's view.",
                "They have described something concrete about the child's experience.",
                "\"The kids are fine.\" -> readiness 0.3",
                "\"Maya gets quiet and keeps checking the window when pickup is late.\" -> readiness 0.85",
                "Let's think about your child for a moment. How do you imagine this feels for them?",
                0.4,
                "Okay. We can set this aside for now. Your care for your child comes through in what you've already shared.",
            ),
        ),
        (
            FlowPhase::Options,
            guidance(
                "Explore a few possible ways forward and help the user choose one.",
                "They have weighed at least two options and said which one feels right.",
                "\"I guess I could do something, not sure what.\" -> readiness 0.3",
                "\"Talking on Sunday evening feels best, when things are calm.\" -> readiness 0.85",
                "There may be a few ways forward here. What are some options you can see?",
                0.4,
                "That's alright. There's no need to pick a path today, and your ideas so far are saved.",
            ),
        ),
        (
            FlowPhase::Message,
            guidance(
                "Bring the reflection together and, if the user wants, shape a message in their own words.",
                "The user has a draft or reflection that sounds like them and feels ready.",
                "\"I don't know how to say it.\" -> readiness 0.3",
                "\"Yes, that's exactly what I want to say.\" -> readiness 0.9",
                "Let's take this one step at a time. What feels most important to say?",
                0.5,
                "That's okay. We can leave the message for now. Everything you've reflected on is saved for when you're ready.",
            ),
        ),
    ])
}
