//! Terminal-phase ("Phase 7") context and sub-flow planning.
//!
//! Once the flow reaches `Message`, each turn advances one sub-state:
//! integrate → option → co_author → fit_check → contain. The planner here is
//! pure; `FlowEngine` carries out the I/O each plan implies.

use serde::{Deserialize, Serialize};

use super::phase::Phase7Step;
use super::signals;
use super::state::{FlowContext, FlowState, Role};

/// Intensity at or above which Deep Think is offered.
pub const DEEPTHINK_INTENSITY_THRESHOLD: f64 = 0.6;

/// Context complexity at or above which Deep Think is offered.
pub const DEEPTHINK_COMPLEXITY_THRESHOLD: f64 = 0.6;

/// The path a user picks at the option step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChosenPath {
    /// Draft a message to the co-parent.
    Outward,
    /// Keep a personal reflection instead of sending anything.
    Inward,
    /// Pause for asynchronous, human-reviewed guidance.
    DeepThink,
}

impl ChosenPath {
    /// Parse a path choice from free text. Deep Think wins ties since it is
    /// the one that must never be missed.
    pub fn parse(text: &str) -> Option<Self> {
        let lower = signals::normalize(text);
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has = |needle: &str| lower.contains(needle);
        let word = |w: &str| words.contains(&w);
        // "the second one" or a bare "second", never "at first I thought".
        let ordinal = |w: &str| {
            words.iter().enumerate().any(|(i, &x)| {
                x == w
                    && (words.len() <= 3
                        || matches!(words.get(i + 1), Some(&("one" | "option" | "path" | "choice"))))
            })
        };

        if has("deep think") || has("deepthink") || has("think it over") || has("take some time")
            || word("3") || ordinal("third")
        {
            return Some(Self::DeepThink);
        }
        if has("for myself") || has("just for me") || word("inward") || word("reflect")
            || word("reflection") || word("2") || ordinal("second")
        {
            return Some(Self::Inward);
        }
        if word("message") || word("send") || word("outward") || has("write to")
            || word("1") || ordinal("first") || word("draft")
        {
            return Some(Self::Outward);
        }
        None
    }
}

/// Phrases lifted from the user's own words, reused to keep their voice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserLanguage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub why_phrase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub need_phrase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_phrase: Option<String>,
    pub phrases: Vec<String>,
}

impl UserLanguage {
    /// Why and need are required before a message can be co-authored.
    pub fn has_required(&self) -> bool {
        self.why_phrase.is_some() && self.need_phrase.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.why_phrase.is_none()
            && self.need_phrase.is_none()
            && self.ask_phrase.is_none()
            && self.phrases.is_empty()
    }

    /// Names of the required phrases still missing.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.why_phrase.is_none() {
            missing.push("why");
        }
        if self.need_phrase.is_none() {
            missing.push("need");
        }
        missing
    }

    /// Fill gaps from `other`; earlier phrases are kept.
    pub fn absorb(&mut self, other: UserLanguage) {
        if self.why_phrase.is_none() {
            self.why_phrase = other.why_phrase;
        }
        if self.need_phrase.is_none() {
            self.need_phrase = other.need_phrase;
        }
        if self.ask_phrase.is_none() {
            self.ask_phrase = other.ask_phrase;
        }
        for phrase in other.phrases {
            if !self.phrases.contains(&phrase) && self.phrases.len() < 8 {
                self.phrases.push(phrase);
            }
        }
    }
}

/// Terminal-phase specialization of the flow context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Phase7Context {
    pub integrated_insights: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_option: Option<ChosenPath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_message: Option<String>,
    pub user_language: UserLanguage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tone_preference: Option<String>,
    pub ready_to_send: bool,
    pub deepthink_offered: bool,
    /// How many times the co-author step has asked for missing phrases.
    pub collection_requests: u32,
}

/// What the engine should do for the current sub-state.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase7Action {
    /// Synthesize what the user has shared so far.
    Integrate,
    /// Present the available paths.
    PresentOptions { offer_deepthink: bool },
    /// The user picked Deep Think: enqueue and pause.
    PauseForDeepThink,
    /// Collect missing phrases or co-author the draft.
    CoAuthor { path: ChosenPath },
    /// Check the draft's fit and tone.
    FitCheck,
    /// Close the session.
    Contain,
}

/// Decide the action for `step` given the latest input.
pub fn plan(step: Phase7Step, p7: &Phase7Context, input: &str, offer_deepthink: bool) -> Phase7Action {
    match step {
        Phase7Step::Integrate => Phase7Action::Integrate,
        Phase7Step::Option => Phase7Action::PresentOptions { offer_deepthink },
        Phase7Step::CoAuthor => {
            let path = p7
                .chosen_option
                .or_else(|| ChosenPath::parse(input))
                .unwrap_or(ChosenPath::Outward);
            if path == ChosenPath::DeepThink {
                if p7.deepthink_offered {
                    return Phase7Action::PauseForDeepThink;
                }
                return Phase7Action::CoAuthor {
                    path: ChosenPath::Outward,
                };
            }
            Phase7Action::CoAuthor { path }
        }
        Phase7Step::FitCheck => Phase7Action::FitCheck,
        Phase7Step::Contain => Phase7Action::Contain,
    }
}

/// One line per captured phase summary.
pub fn integrate_insights(ctx: &FlowContext) -> Vec<String> {
    ctx.captured()
        .into_iter()
        .map(|(phase, summary)| format!("{}: {}", phase.label(), summary))
        .collect()
}

/// Harvest why/need/ask phrases from the user's earlier turns and summaries.
pub fn harvest_user_language(state: &FlowState) -> UserLanguage {
    let mut language = UserLanguage::default();
    for turn in state
        .conversation_history
        .iter()
        .filter(|t| t.role == Role::User)
    {
        language.absorb(signals::extract_user_language(&turn.content));
    }
    for (_, summary) in state.context.captured() {
        language.absorb(signals::extract_user_language(summary));
    }
    language
}

/// 0.0–1.0 estimate of how much the user has worked through.
///
/// Half comes from how many phases have captured summaries, half from how
/// much the user has written in recent turns.
pub fn complexity_score(state: &FlowState) -> f64 {
    let captured = state.context.captured().len() as f64 / 5.0;
    let user_turns: Vec<usize> = state
        .conversation_history
        .iter()
        .filter(|t| t.role == Role::User)
        .map(|t| t.content.split_whitespace().count())
        .collect();
    let verbosity = if user_turns.is_empty() {
        0.0
    } else {
        let avg = user_turns.iter().sum::<usize>() as f64 / user_turns.len() as f64;
        (avg / 60.0).min(1.0)
    };
    (captured.min(1.0) * 0.5 + verbosity * 0.5).clamp(0.0, 1.0)
}

/// Whether the option step should include the Deep Think path.
pub fn should_offer_deepthink(allow_deepthink: bool, intensity: f64, complexity: f64) -> bool {
    allow_deepthink
        && (intensity >= DEEPTHINK_INTENSITY_THRESHOLD
            || complexity >= DEEPTHINK_COMPLEXITY_THRESHOLD)
}

/// Tone adjustment requested at the fit-check step, if any.
pub fn tone_from_text(text: &str) -> Option<String> {
    let lower = signals::normalize(text);
    let tone = if ["softer", "gentler", "warmer", "kinder"].iter().any(|w| lower.contains(w)) {
        "gentle"
    } else if ["shorter", "brief", "concise", "simpler"].iter().any(|w| lower.contains(w)) {
        "brief"
    } else if ["firmer", "direct", "stronger", "clearer"].iter().any(|w| lower.contains(w)) {
        "direct"
    } else {
        return None;
    };
    Some(tone.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::phase::FlowPhase;
    use crate::flow::state::Turn;

    #[test]
    fn parse_path_choices() {
        assert_eq!(ChosenPath::parse("Let's draft a message"), Some(ChosenPath::Outward));
        assert_eq!(ChosenPath::parse("1"), Some(ChosenPath::Outward));
        assert_eq!(ChosenPath::parse("I'd rather keep it for myself"), Some(ChosenPath::Inward));
        assert_eq!(ChosenPath::parse("option 2 please"), Some(ChosenPath::Inward));
        assert_eq!(ChosenPath::parse("I want Deep Think"), Some(ChosenPath::DeepThink));
        assert_eq!(
            ChosenPath::parse("maybe send a message, or deep think?"),
            Some(ChosenPath::DeepThink)
        );
        assert_eq!(ChosenPath::parse("hmm not sure"), None);
        assert_eq!(ChosenPath::parse("the third one"), Some(ChosenPath::DeepThink));
        assert_eq!(ChosenPath::parse("second"), Some(ChosenPath::Inward));
        assert_eq!(ChosenPath::parse("I think the first option feels right"), Some(ChosenPath::Outward));
        assert_eq!(ChosenPath::parse("At first I thought it was fine"), None);
        assert_eq!(ChosenPath::parse("I only heard it secondhand"), None);
    }

    #[test]
    fn required_language_is_why_and_need() {
        let mut lang = UserLanguage::default();
        assert!(!lang.has_required());
        assert_eq!(lang.missing(), vec!["why", "need"]);

        lang.absorb(UserLanguage {
            why_phrase: Some("the kids need stability".into()),
            ..Default::default()
        });
        assert_eq!(lang.missing(), vec!["need"]);

        lang.absorb(UserLanguage {
            why_phrase: Some("ignored".into()),
            need_phrase: Some("a heads-up before changes".into()),
            ..Default::default()
        });
        assert!(lang.has_required());
        assert_eq!(lang.why_phrase.as_deref(), Some("the kids need stability"));
    }

    #[test]
    fn plan_walks_substeps() {
        let p7 = Phase7Context::default();
        assert_eq!(plan(Phase7Step::Integrate, &p7, "", false), Phase7Action::Integrate);
        assert_eq!(
            plan(Phase7Step::Option, &p7, "", true),
            Phase7Action::PresentOptions { offer_deepthink: true }
        );
        assert_eq!(plan(Phase7Step::FitCheck, &p7, "", false), Phase7Action::FitCheck);
        assert_eq!(plan(Phase7Step::Contain, &p7, "", false), Phase7Action::Contain);
    }

    #[test]
    fn plan_coauthor_respects_choice() {
        let mut p7 = Phase7Context::default();
        assert_eq!(
            plan(Phase7Step::CoAuthor, &p7, "for myself", false),
            Phase7Action::CoAuthor { path: ChosenPath::Inward }
        );
        assert_eq!(
            plan(Phase7Step::CoAuthor, &p7, "whatever", false),
            Phase7Action::CoAuthor { path: ChosenPath::Outward }
        );

        // Deep Think only pauses when it was offered.
        assert_eq!(
            plan(Phase7Step::CoAuthor, &p7, "deep think", false),
            Phase7Action::CoAuthor { path: ChosenPath::Outward }
        );
        p7.deepthink_offered = true;
        assert_eq!(
            plan(Phase7Step::CoAuthor, &p7, "deep think", false),
            Phase7Action::PauseForDeepThink
        );
    }

    #[test]
    fn deepthink_offer_thresholds() {
        assert!(!should_offer_deepthink(false, 0.9, 0.9));
        assert!(should_offer_deepthink(true, 0.6, 0.0));
        assert!(should_offer_deepthink(true, 0.0, 0.7));
        assert!(!should_offer_deepthink(true, 0.4, 0.3));
    }

    #[test]
    fn complexity_grows_with_context() {
        let mut state = FlowState::default();
        assert_eq!(complexity_score(&state), 0.0);

        state.context.issue = Some("schedule".into());
        state.context.feelings = Some("angry".into());
        state.context.why = Some("stability".into());
        state.context.coparent = Some("busy".into());
        state.context.child = Some("confused".into());
        assert!((complexity_score(&state) - 0.5).abs() < 1e-9);

        state.push_turn(Turn::user("word ".repeat(60), FlowPhase::Child));
        assert!((complexity_score(&state) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn harvest_reads_user_turns_only() {
        let mut state = FlowState::default();
        state.push_turn(Turn::assistant("Is it because you need rest?", FlowPhase::Why));
        state.push_turn(Turn::user(
            "It matters because the kids deserve calm evenings.",
            FlowPhase::Why,
        ));
        state.push_turn(Turn::user("I need to know plans a day ahead.", FlowPhase::Coparent));

        let lang = harvest_user_language(&state);
        assert_eq!(lang.why_phrase.as_deref(), Some("the kids deserve calm evenings"));
        assert_eq!(lang.need_phrase.as_deref(), Some("to know plans a day ahead"));
        assert!(lang.ask_phrase.is_none());
    }

    #[test]
    fn integrate_lists_captured_summaries() {
        let mut ctx = FlowContext::default();
        ctx.issue = Some("late pickups".into());
        ctx.why = Some("predictability".into());
        let insights = integrate_insights(&ctx);
        assert_eq!(insights.len(), 2);
        assert!(insights[0].contains("late pickups"));
        assert!(insights[1].starts_with("Why it matters"));
    }

    #[test]
    fn tone_requests() {
        assert_eq!(tone_from_text("Can it be a bit softer?").as_deref(), Some("gentle"));
        assert_eq!(tone_from_text("make it shorter").as_deref(), Some("brief"));
        assert_eq!(tone_from_text("Be more direct").as_deref(), Some("direct"));
        assert_eq!(tone_from_text("looks good"), None);
    }
}
