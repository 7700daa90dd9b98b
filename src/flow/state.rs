//! Per-session flow state with its context and bounded history.

use serde::{Deserialize, Serialize};

use super::phase::{FlowPhase, Phase7Step};
use super::phase7::Phase7Context;

/// Maximum number of turns kept in `conversation_history`.
pub const MAX_HISTORY: usize = 10;

/// Longest summary kept for a single context field.
const MAX_FIELD_CHARS: usize = 1_000;

/// Most options kept in `FlowContext::options`.
const MAX_OPTIONS: usize = 4;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single role-tagged turn in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<FlowPhase>,
}

impl Turn {
    pub fn user(content: impl Into<String>, phase: FlowPhase) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            phase: Some(phase),
        }
    }

    pub fn assistant(content: impl Into<String>, phase: FlowPhase) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            phase: Some(phase),
        }
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    /// Waiting on an out-of-band Deep Think review.
    Paused,
    /// The message sub-flow reached its end.
    Complete,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "complete" => Ok(Self::Complete),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Conversation memory: one summary per phase plus the values that feed
/// snippet templates.
///
/// Fields are only ever set or overwritten, never cleared mid-session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feelings: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub why: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coparent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child: Option<String>,
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_option: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_reflection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coparent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_name: Option<String>,
    /// Once set, the generator mirrors these consistently.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coparent_pronouns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_feeling: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_value: Option<String>,
    pub phase7: Phase7Context,
}

impl FlowContext {
    /// The captured summary for a phase, if any.
    pub fn summary_for(&self, phase: FlowPhase) -> Option<&str> {
        match phase {
            FlowPhase::Issue => self.issue.as_deref(),
            FlowPhase::Feelings => self.feelings.as_deref(),
            FlowPhase::Why => self.why.as_deref(),
            FlowPhase::Coparent => self.coparent.as_deref(),
            FlowPhase::Child => self.child.as_deref(),
            FlowPhase::Options => self.chosen_option.as_deref(),
            FlowPhase::Message => self.final_reflection.as_deref(),
        }
    }

    /// Summaries captured so far, in phase order.
    pub fn captured(&self) -> Vec<(FlowPhase, &str)> {
        FlowPhase::ALL
            .iter()
            .filter_map(|p| self.summary_for(*p).map(|s| (*p, s)))
            .collect()
    }

    /// Merge a delta into the context.
    ///
    /// Blank values are ignored and nothing is ever cleared. Returns the
    /// names of the fields that changed.
    pub fn merge(&mut self, delta: &ContextDelta) -> Vec<&'static str> {
        let mut applied = Vec::new();

        let text_fields: [(&'static str, &Option<String>, &mut Option<String>); 12] = [
            ("issue", &delta.issue, &mut self.issue),
            ("feelings", &delta.feelings, &mut self.feelings),
            ("why", &delta.why, &mut self.why),
            ("coparent", &delta.coparent, &mut self.coparent),
            ("child", &delta.child, &mut self.child),
            ("chosen_option", &delta.chosen_option, &mut self.chosen_option),
            ("final_reflection", &delta.final_reflection, &mut self.final_reflection),
            ("coparent_name", &delta.coparent_name, &mut self.coparent_name),
            ("child_name", &delta.child_name, &mut self.child_name),
            ("coparent_pronouns", &delta.coparent_pronouns, &mut self.coparent_pronouns),
            ("last_feeling", &delta.last_feeling, &mut self.last_feeling),
            ("last_value", &delta.last_value, &mut self.last_value),
        ];

        for (name, incoming, slot) in text_fields {
            if let Some(value) = incoming.as_deref().and_then(clean_text) {
                if slot.as_deref() != Some(value.as_str()) {
                    *slot = Some(value);
                    applied.push(name);
                }
            }
        }

        if let Some(ref options) = delta.options {
            let cleaned: Vec<String> = options
                .iter()
                .filter_map(|o| clean_text(o))
                .take(MAX_OPTIONS)
                .collect();
            if !cleaned.is_empty() && cleaned != self.options {
                self.options = cleaned;
                applied.push("options");
            }
        }

        applied
    }
}

/// Trim and cap a free-text value; `None` if blank.
fn clean_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_FIELD_CHARS).collect())
}

/// Context updates proposed for a turn, validated on merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextDelta {
    pub issue: Option<String>,
    pub feelings: Option<String>,
    pub why: Option<String>,
    pub coparent: Option<String>,
    pub child: Option<String>,
    pub options: Option<Vec<String>>,
    pub chosen_option: Option<String>,
    pub final_reflection: Option<String>,
    pub coparent_name: Option<String>,
    pub child_name: Option<String>,
    pub coparent_pronouns: Option<String>,
    pub last_feeling: Option<String>,
    pub last_value: Option<String>,
}

impl ContextDelta {
    /// A delta that records `summary` as the given phase's entry.
    pub fn for_phase(phase: FlowPhase, summary: impl Into<String>) -> Self {
        let summary = Some(summary.into());
        let mut delta = Self::default();
        match phase {
            FlowPhase::Issue => delta.issue = summary,
            FlowPhase::Feelings => delta.feelings = summary,
            FlowPhase::Why => delta.why = summary,
            FlowPhase::Coparent => delta.coparent = summary,
            FlowPhase::Child => delta.child = summary,
            FlowPhase::Options => delta.chosen_option = summary,
            FlowPhase::Message => delta.final_reflection = summary,
        }
        delta
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Mutable per-session record, received with each request and returned
/// updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    /// Always within 0.0..=1.0.
    pub readiness: f64,
    #[serde(default)]
    pub context: FlowContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<Turn>,
    #[serde(default)]
    pub reprompt_count: u32,
    /// Turns processed so far; feeds the trace turn index.
    #[serde(default)]
    pub turn_count: u64,
    /// Optimistic-concurrency stamp, bumped on every save.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub status: SessionStatus,
    /// Current sub-state while in the terminal phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substate: Option<Phase7Step>,
    /// Phase of the previous turn, used for bridge detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_phase: Option<FlowPhase>,
}

impl Default for FlowState {
    fn default() -> Self {
        Self {
            readiness: 0.0,
            context: FlowContext::default(),
            last_prompt: None,
            last_response: None,
            conversation_history: Vec::new(),
            reprompt_count: 0,
            turn_count: 0,
            version: 0,
            status: SessionStatus::Active,
            substate: None,
            previous_phase: None,
        }
    }
}

impl FlowState {
    /// Set readiness, clamped into 0.0..=1.0. Non-finite values become 0.0.
    pub fn set_readiness(&mut self, readiness: f64) {
        self.readiness = clamp_unit(readiness);
    }

    /// Append a turn, dropping the oldest once the history is full.
    pub fn push_turn(&mut self, turn: Turn) {
        self.conversation_history.push(turn);
        if self.conversation_history.len() > MAX_HISTORY {
            let excess = self.conversation_history.len() - MAX_HISTORY;
            self.conversation_history.drain(..excess);
        }
    }

    /// Record a full user/assistant exchange.
    pub fn record_exchange(&mut self, phase: FlowPhase, user_input: &str, reply: &str) {
        self.last_prompt = Some(user_input.to_string());
        self.last_response = Some(reply.to_string());
        self.push_turn(Turn::user(user_input, phase));
        self.push_turn(Turn::assistant(reply, phase));
        self.turn_count += 1;
    }

    /// Increment the reprompt counter for the current phase.
    pub fn increment_reprompts(&mut self) {
        self.reprompt_count = self.reprompt_count.saturating_add(1);
    }

    /// Reset the reprompt counter after a phase advance.
    pub fn reset_reprompts(&mut self) {
        self.reprompt_count = 0;
    }
}

/// Clamp into the unit interval; NaN and infinities map to 0.0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state() {
        let state = FlowState::default();
        assert_eq!(state.readiness, 0.0);
        assert_eq!(state.reprompt_count, 0);
        assert!(state.conversation_history.is_empty());
        assert_eq!(state.context, FlowContext::default());
        assert_eq!(state.status, SessionStatus::Active);
    }

    #[test]
    fn readiness_is_clamped() {
        let mut state = FlowState::default();
        state.set_readiness(1.7);
        assert_eq!(state.readiness, 1.0);
        state.set_readiness(-0.2);
        assert_eq!(state.readiness, 0.0);
        state.set_readiness(f64::NAN);
        assert_eq!(state.readiness, 0.0);
        state.set_readiness(0.42);
        assert!((state.readiness - 0.42).abs() < f64::EPSILON);
    }

    #[test]
    fn history_is_bounded_oldest_first() {
        let mut state = FlowState::default();
        for i in 0..8 {
            state.record_exchange(FlowPhase::Issue, &format!("u{i}"), &format!("a{i}"));
            assert!(state.conversation_history.len() <= MAX_HISTORY);
        }
        assert_eq!(state.conversation_history.len(), MAX_HISTORY);
        // 16 turns pushed, the first 6 dropped: u3 is now the oldest.
        assert_eq!(state.conversation_history[0].content, "u3");
        assert_eq!(state.conversation_history[9].content, "a7");
        assert_eq!(state.turn_count, 8);
        assert_eq!(state.last_prompt.as_deref(), Some("u7"));
    }

    #[test]
    fn merge_sets_and_overwrites_but_never_clears() {
        let mut ctx = FlowContext::default();
        let applied = ctx.merge(&ContextDelta {
            issue: Some("  pickup times keep changing  ".into()),
            coparent_name: Some("Sam".into()),
            ..Default::default()
        });
        assert_eq!(applied, vec!["issue", "coparent_name"]);
        assert_eq!(ctx.issue.as_deref(), Some("pickup times keep changing"));

        let applied = ctx.merge(&ContextDelta {
            issue: Some("   ".into()),
            feelings: Some("frustrated".into()),
            ..Default::default()
        });
        assert_eq!(applied, vec!["feelings"]);
        assert_eq!(ctx.issue.as_deref(), Some("pickup times keep changing"));

        let applied = ctx.merge(&ContextDelta {
            issue: Some("schedule changes".into()),
            ..Default::default()
        });
        assert_eq!(applied, vec!["issue"]);
        assert_eq!(ctx.issue.as_deref(), Some("schedule changes"));
    }

    #[test]
    fn merge_caps_options_and_drops_blank_entries() {
        let mut ctx = FlowContext::default();
        let applied = ctx.merge(&ContextDelta {
            options: Some(vec![
                "talk on Sunday".into(),
                "".into(),
                "write a note".into(),
                "ask a mediator".into(),
                "wait a week".into(),
                "do nothing".into(),
            ]),
            ..Default::default()
        });
        assert_eq!(applied, vec!["options"]);
        assert_eq!(ctx.options.len(), 4);
        assert_eq!(ctx.options[1], "write a note");
    }

    #[test]
    fn merge_caps_field_length() {
        let mut ctx = FlowContext::default();
        ctx.merge(&ContextDelta {
            why: Some("x".repeat(5_000)),
            ..Default::default()
        });
        assert_eq!(ctx.why.unwrap().chars().count(), 1_000);
    }

    #[test]
    fn delta_for_phase_targets_the_right_field() {
        let mut ctx = FlowContext::default();
        ctx.merge(&ContextDelta::for_phase(FlowPhase::Coparent, "they are stretched thin"));
        assert_eq!(ctx.coparent.as_deref(), Some("they are stretched thin"));
        assert_eq!(
            ctx.summary_for(FlowPhase::Coparent),
            Some("they are stretched thin")
        );
        assert_eq!(ctx.captured().len(), 1);
    }

    #[test]
    fn state_serde_uses_camel_case() {
        let mut state = FlowState::default();
        state.reprompt_count = 2;
        state.context.chosen_option = Some("talk".into());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["repromptCount"], 2);
        assert_eq!(json["context"]["chosenOption"], "talk");
        assert!(json.get("conversationHistory").is_some());

        let parsed: FlowState = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn minimal_state_json_deserializes() {
        let parsed: FlowState = serde_json::from_str(r#"{"readiness": 0.3}"#).unwrap();
        assert_eq!(parsed.readiness, 0.3);
        assert_eq!(parsed.version, 0);
        assert!(parsed.substate.is_none());
    }
}
