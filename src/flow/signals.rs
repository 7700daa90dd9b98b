//! Signal detection: cheap, stateless text analysis over the latest input.
//!
//! Nothing here calls out of process. Every function is deterministic and
//! takes literal strings so it can be tested in isolation.

use std::sync::LazyLock;

use regex::Regex;

use super::phase::FlowPhase;
use super::phase7::UserLanguage;
use super::state::{Turn, clamp_unit};

/// Phrases that mean the user has finished with the current thread.
const CLOSURE_PHRASES: &[&str] = &[
    "that's it",
    "thats it",
    "that's all",
    "i'm done",
    "im done",
    "i am done",
    "nothing else",
    "nothing more",
    "that's everything",
    "that covers it",
    "i'm finished",
    "no more to say",
];

/// Phrases that set an explicit boundary on the conversation.
const BOUNDARY_PHRASES: &[&str] = &[
    "i don't want to talk about",
    "i dont want to talk about",
    "i'd rather not",
    "i would rather not",
    "please stop",
    "stop asking",
    "let's stop",
    "not ready to talk",
    "i need a break",
    "leave it there",
];

/// Emotion vocabulary for `detect_feeling_named`.
const FEELING_WORDS: &[&str] = &[
    "angry", "sad", "hurt", "frustrated", "anxious", "worried", "scared", "afraid",
    "overwhelmed", "exhausted", "lonely", "guilty", "ashamed", "resentful", "disappointed",
    "betrayed", "helpless", "confused", "stressed", "upset", "jealous", "embarrassed",
    "nervous", "furious", "heartbroken", "grief", "relieved", "hopeful",
];

const HIGH_INTENSITY: &[&str] = &[
    "furious", "rage", "hate", "devastated", "heartbroken", "terrified", "panic",
    "unbearable", "desperate", "livid", "enraged", "destroyed", "can't take",
    "cant take", "breaking down", "screaming",
];

const MEDIUM_INTENSITY: &[&str] = &[
    "angry", "upset", "frustrated", "anxious", "worried", "hurt", "sad", "stressed",
    "overwhelmed", "scared", "annoyed", "resentful", "exhausted", "fed up",
];

/// Readiness at or above which a child-impact nudge may be offered.
pub const NUDGE_READINESS: f64 = 0.65;

/// Intensity counted as "high" by the ranker.
pub const HIGH_INTENSITY_THRESHOLD: f64 = 0.75;

static FEELING_RE: LazyLock<Regex> = LazyLock::new(|| {
    let words = FEELING_WORDS.join("|");
    Regex::new(&format!(r"\b(?:{words}|feel|feeling|feelings|felt)\b"))
        .expect("feeling lexicon is a valid regex")
});

static NAMED_FEELING_RE: LazyLock<Regex> = LazyLock::new(|| {
    let words = FEELING_WORDS.join("|");
    Regex::new(&format!(r"\b({words})\b")).expect("feeling lexicon is a valid regex")
});

static CHILD_IMPACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:kid|kids|child|children|son|daughter|our boy|our girl|the little ones|how (?:this|it) affects|impact on (?:him|her|them))\b",
    )
    .expect("child impact pattern is a valid regex")
});

static WHY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bbecause\s+([^.!?,;\n]+)").expect("valid regex"));

static NEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bi\s+(?:really\s+)?need\s+([^.!?,;\n]+)").expect("valid regex"));

static ASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:could|can|would|will)\s+(?:you|we)\s+([^.!?,;\n]+)").expect("valid regex")
});

static VOICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bi\s+(?:feel|felt|want|wish|hope)\s+[^.!?,;\n]+").expect("valid regex")
});

static VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:i care about|i value|what matters (?:to me )?is|important to me is)\s+([^.!?,;\n]+)")
        .expect("valid regex")
});

/// Lowercase and fold curly apostrophes so lexicon matching is stable.
pub fn normalize(text: &str) -> String {
    text.to_lowercase().replace(['\u{2019}', '\u{2018}'], "'")
}

/// True if the text contains a completion phrase ("that's it", "i'm done", …).
pub fn detect_closure(text: &str) -> bool {
    let lower = normalize(text);
    CLOSURE_PHRASES.iter().any(|p| lower.contains(p))
}

/// True if the user explicitly set a boundary ("please stop", …).
pub fn detect_boundary(text: &str) -> bool {
    let lower = normalize(text);
    BOUNDARY_PHRASES.iter().any(|p| lower.contains(p))
}

/// True if the text names a feeling or talks about feeling.
pub fn detect_feeling_named(text: &str) -> bool {
    FEELING_RE.is_match(&normalize(text))
}

/// First named emotion word in the text, if any.
pub fn first_feeling(text: &str) -> Option<String> {
    NAMED_FEELING_RE
        .captures(&normalize(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// 0.0–1.0 emotional intensity: 0.4 per distinct high-intensity term, 0.2
/// per distinct medium-intensity term, capped at 1.0.
///
/// Only biases retrieval; never gates advancement.
pub fn detect_emotional_intensity(text: &str) -> f64 {
    let lower = normalize(text);
    let high = HIGH_INTENSITY
        .iter()
        .filter(|t| contains_term(&lower, t))
        .count();
    let medium = MEDIUM_INTENSITY
        .iter()
        .filter(|t| contains_term(&lower, t))
        .count();
    (high as f64 * 0.4 + medium as f64 * 0.2).min(1.0)
}

/// Word-boundary containment for single words, substring for phrases.
fn contains_term(haystack: &str, term: &str) -> bool {
    if term.contains(' ') || term.contains('\'') {
        return haystack.contains(term);
    }
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w == term)
}

/// True if any of the last `last_n` turns already raised child-impact
/// language.
pub fn has_recent_child_impact_cue(history: &[Turn], last_n: usize) -> bool {
    history
        .iter()
        .rev()
        .take(last_n)
        .any(|t| CHILD_IMPACT_RE.is_match(&normalize(&t.content)))
}

/// A bridge is only needed for the issue → feelings transition.
pub fn needs_phase_bridge(current: FlowPhase, previous: Option<FlowPhase>) -> bool {
    previous == Some(FlowPhase::Issue) && current == FlowPhase::Feelings
}

/// Offer a child-impact nudge only in feelings, once a feeling is named,
/// readiness is high enough, and no recent cue exists.
pub fn should_offer_child_impact_nudge(
    phase: FlowPhase,
    feeling_named: bool,
    readiness: f64,
    has_recent_cue: bool,
) -> bool {
    phase == FlowPhase::Feelings && feeling_named && readiness >= NUDGE_READINESS && !has_recent_cue
}

/// Pull why/need/ask phrases and first-person voice from user text.
pub fn extract_user_language(text: &str) -> UserLanguage {
    let capture = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().trim_end_matches(',').to_string())
            .filter(|s| !s.is_empty())
    };
    UserLanguage {
        why_phrase: capture(&WHY_RE),
        need_phrase: capture(&NEED_RE),
        ask_phrase: capture(&ASK_RE),
        phrases: VOICE_RE
            .find_iter(text)
            .map(|m| m.as_str().trim().to_string())
            .collect(),
    }
}

/// What the user says they value, if stated.
pub fn extract_value(text: &str) -> Option<String> {
    VALUE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Everything the detector knows about the latest input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalSnapshot {
    pub closure: bool,
    pub boundary: bool,
    pub feeling_named: bool,
    pub intensity: f64,
    pub recent_child_cue: bool,
    pub bridge: bool,
    pub nudge: bool,
}

impl SignalSnapshot {
    /// Run every detector over `input`.
    ///
    /// `readiness` is the readiness carried in from the previous turn.
    pub fn analyze(
        input: &str,
        history: &[Turn],
        phase: FlowPhase,
        previous: Option<FlowPhase>,
        readiness: f64,
    ) -> Self {
        let feeling_named = detect_feeling_named(input);
        let recent_child_cue = has_recent_child_impact_cue(history, 4)
            || CHILD_IMPACT_RE.is_match(&normalize(input));
        Self {
            closure: detect_closure(input),
            boundary: detect_boundary(input),
            feeling_named,
            intensity: detect_emotional_intensity(input),
            recent_child_cue,
            bridge: needs_phase_bridge(phase, previous),
            nudge: should_offer_child_impact_nudge(phase, feeling_named, readiness, recent_child_cue),
        }
    }

    /// Closure or an explicit boundary both call for containment.
    pub fn wants_containment(&self) -> bool {
        self.closure || self.boundary
    }
}

/// Readiness estimate used when the composer answers without the generator.
pub fn heuristic_readiness(signals: &SignalSnapshot, input: &str) -> f64 {
    if signals.wants_containment() {
        return 0.75;
    }
    let mut score = 0.3;
    if signals.feeling_named {
        score += 0.15;
    }
    let words = input.split_whitespace().count();
    if words >= 25 {
        score += 0.15;
    } else if words >= 10 {
        score += 0.08;
    }
    clamp_unit(score)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_phrases() {
        assert!(detect_closure("That's it, I'm done"));
        assert!(detect_closure("honestly nothing else"));
        assert!(detect_closure("That\u{2019}s all for now"));
        assert!(!detect_closure("It started when we moved"));
    }

    #[test]
    fn boundary_phrases() {
        assert!(detect_boundary("Please stop asking about her"));
        assert!(detect_boundary("I'd rather not go there"));
        assert!(!detect_boundary("I'd love to talk"));
    }

    #[test]
    fn feeling_named() {
        assert!(detect_feeling_named("I feel invisible"));
        assert!(detect_feeling_named("Mostly frustrated and tired"));
        assert!(detect_feeling_named("I felt it"));
        assert!(!detect_feeling_named("We swapped weekends"));
        // "sadly" is not "sad"
        assert!(!detect_feeling_named("sadly the bus was late"));
    }

    #[test]
    fn first_feeling_word() {
        assert_eq!(first_feeling("I'm so Anxious and sad").as_deref(), Some("anxious"));
        assert_eq!(first_feeling("I feel okay"), None);
    }

    #[test]
    fn intensity_scoring() {
        assert_eq!(detect_emotional_intensity("we talked"), 0.0);
        assert!((detect_emotional_intensity("I'm upset") - 0.2).abs() < 1e-9);
        assert!((detect_emotional_intensity("I'm furious") - 0.4).abs() < 1e-9);
        assert!((detect_emotional_intensity("furious and upset") - 0.6).abs() < 1e-9);
        assert_eq!(
            detect_emotional_intensity("furious, devastated, terrified, I hate this"),
            1.0
        );
    }

    #[test]
    fn child_impact_cue_in_recent_turns() {
        let history = vec![
            Turn::user("the kids cried at drop-off", FlowPhase::Issue),
            Turn::assistant("That sounds hard.", FlowPhase::Issue),
            Turn::user("yes", FlowPhase::Feelings),
        ];
        assert!(has_recent_child_impact_cue(&history, 3));
        assert!(!has_recent_child_impact_cue(&history, 2));
        assert!(!has_recent_child_impact_cue(&[], 5));
    }

    #[test]
    fn bridge_only_for_issue_to_feelings() {
        assert!(needs_phase_bridge(FlowPhase::Feelings, Some(FlowPhase::Issue)));
        assert!(!needs_phase_bridge(FlowPhase::Feelings, Some(FlowPhase::Feelings)));
        assert!(!needs_phase_bridge(FlowPhase::Why, Some(FlowPhase::Feelings)));
        assert!(!needs_phase_bridge(FlowPhase::Feelings, None));
    }

    #[test]
    fn nudge_conditions() {
        assert!(should_offer_child_impact_nudge(FlowPhase::Feelings, true, 0.65, false));
        assert!(!should_offer_child_impact_nudge(FlowPhase::Feelings, true, 0.64, false));
        assert!(!should_offer_child_impact_nudge(FlowPhase::Feelings, false, 0.9, false));
        assert!(!should_offer_child_impact_nudge(FlowPhase::Feelings, true, 0.9, true));
        assert!(!should_offer_child_impact_nudge(FlowPhase::Why, true, 0.9, false));
    }

    #[test]
    fn extract_language_phrases() {
        let lang = extract_user_language(
            "I want peace. I need a heads-up before changes, because the kids need routine. Could you text me by Friday?",
        );
        assert_eq!(lang.why_phrase.as_deref(), Some("the kids need routine"));
        assert_eq!(lang.need_phrase.as_deref(), Some("a heads-up before changes"));
        assert_eq!(lang.ask_phrase.as_deref(), Some("text me by Friday"));
        assert_eq!(lang.phrases, vec!["I want peace".to_string()]);

        assert!(extract_user_language("ok").is_empty());
    }

    #[test]
    fn extract_value_phrase() {
        assert_eq!(
            extract_value("What matters to me is being fair.").as_deref(),
            Some("being fair")
        );
        assert_eq!(extract_value("no idea"), None);
    }

    #[test]
    fn snapshot_combines_detectors() {
        let snap = SignalSnapshot::analyze(
            "That's it, I'm done",
            &[],
            FlowPhase::Issue,
            None,
            0.0,
        );
        assert!(snap.closure);
        assert!(snap.wants_containment());
        assert!(!snap.bridge);
        assert!(!snap.nudge);

        let snap = SignalSnapshot::analyze(
            "I feel hurt",
            &[],
            FlowPhase::Feelings,
            Some(FlowPhase::Issue),
            0.7,
        );
        assert!(snap.bridge);
        assert!(snap.nudge);
    }

    #[test]
    fn heuristic_readiness_levels() {
        let closure = SignalSnapshot {
            closure: true,
            ..Default::default()
        };
        assert_eq!(heuristic_readiness(&closure, "done"), 0.75);

        let plain = SignalSnapshot::default();
        assert!((heuristic_readiness(&plain, "short") - 0.3).abs() < 1e-9);

        let feeling = SignalSnapshot {
            feeling_named: true,
            ..Default::default()
        };
        let long = "word ".repeat(30);
        assert!((heuristic_readiness(&feeling, &long) - 0.6).abs() < 1e-9);
    }
}
