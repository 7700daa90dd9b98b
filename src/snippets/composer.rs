//! Deterministic reply composition from ranked snippets.
//!
//! Each phase has a fixed ordering of snippet kinds. For every slot the
//! highest-ranked approved snippet whose template renders cleanly is used.
//! If a required slot cannot be filled the composer returns `None` and the
//! caller falls through to the generator.

use std::sync::LazyLock;

use regex::Regex;

use crate::flow::phase::FlowPhase;
use crate::flow::signals::SignalSnapshot;
use crate::flow::state::FlowContext;

use super::model::{RankedSnippet, SnippetKind};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_]+)\}").expect("placeholder pattern is a valid regex"));

const SALUTATIONS: &[&str] = &["hi ", "hey ", "hello ", "dear "];

/// Inputs for composition beyond the snippets themselves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposerContext {
    pub phase: FlowPhase,
    pub closure: bool,
    pub bridge: bool,
    pub nudge: bool,
    pub coparent_name: Option<String>,
    pub child_name: Option<String>,
    pub last_feeling: Option<String>,
    pub last_value: Option<String>,
    pub issue: Option<String>,
    pub why_phrase: Option<String>,
    pub need_phrase: Option<String>,
    pub ask_phrase: Option<String>,
}

impl ComposerContext {
    pub fn new(phase: FlowPhase, context: &FlowContext, signals: &SignalSnapshot) -> Self {
        let language = &context.phase7.user_language;
        Self {
            phase,
            closure: signals.wants_containment(),
            bridge: signals.bridge,
            nudge: signals.nudge,
            coparent_name: context.coparent_name.clone(),
            child_name: context.child_name.clone(),
            last_feeling: context.last_feeling.clone(),
            last_value: context.last_value.clone(),
            issue: context.issue.clone(),
            why_phrase: language.why_phrase.clone(),
            need_phrase: language.need_phrase.clone(),
            ask_phrase: language.ask_phrase.clone(),
        }
    }

    /// Why and need are both present.
    pub fn has_required_language(&self) -> bool {
        self.why_phrase.is_some() && self.need_phrase.is_some()
    }
}

/// A composed reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub text: String,
    pub snippet_ids: Vec<String>,
    pub kinds: Vec<SnippetKind>,
}

impl Composition {
    pub fn uses(&self, kind: SnippetKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// One position in a phase's ordering.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Slot {
    kind: SnippetKind,
    count: usize,
    required: bool,
}

impl Slot {
    fn required(kind: SnippetKind) -> Self {
        Self {
            kind,
            count: 1,
            required: true,
        }
    }

    fn optional(kind: SnippetKind) -> Self {
        Self {
            kind,
            count: 1,
            required: false,
        }
    }
}

/// The ordered slots for the given context.
fn ordering(ctx: &ComposerContext) -> Vec<Slot> {
    use SnippetKind::*;
    match ctx.phase {
        FlowPhase::Options => vec![
            Slot::optional(WhyRecap),
            Slot::optional(Bridge),
            Slot::optional(ConfirmWhy),
            Slot {
                kind: OptionInvitation,
                count: 2,
                required: true,
            },
            Slot::optional(LensTie),
            Slot::optional(ReEngagement),
        ],
        FlowPhase::Message => {
            if !ctx.has_required_language() {
                return vec![Slot::required(CollectionRequest)];
            }
            let mut slots = vec![Slot::required(CoAuthorSeed)];
            if ctx.ask_phrase.is_some() {
                slots.push(Slot::optional(ClarityFrame));
            }
            slots.push(Slot::optional(Containment));
            slots
        }
        _ => {
            let mut slots = vec![Slot::optional(Acknowledgment)];
            if ctx.closure {
                // Containment takes the place of the probing prompt.
                slots.push(Slot::required(Containment));
            }
            if ctx.bridge {
                slots.push(Slot::optional(Bridge));
            }
            if !ctx.closure {
                slots.push(Slot::required(Prompt));
                if ctx.nudge {
                    slots.push(Slot::optional(Nudge));
                }
            }
            slots
        }
    }
}

/// Compose a reply, or `None` if a required slot cannot be filled.
pub fn compose(ranked: &[RankedSnippet], ctx: &ComposerContext) -> Option<Composition> {
    let mut parts = Vec::new();
    let mut snippet_ids: Vec<String> = Vec::new();
    let mut kinds = Vec::new();

    for slot in ordering(ctx) {
        let mut filled = 0;
        for candidate in ranked {
            if filled == slot.count {
                break;
            }
            let snippet = &candidate.snippet;
            if snippet.kind != slot.kind
                || !snippet.is_approved()
                || snippet_ids.contains(&snippet.id)
            {
                continue;
            }
            let Ok(text) = render(&snippet.content, ctx) else {
                continue;
            };
            if text.is_empty() {
                continue;
            }
            parts.push(text);
            snippet_ids.push(snippet.id.clone());
            kinds.push(slot.kind);
            filled += 1;
        }
        if slot.required && filled < slot.count {
            return None;
        }
    }

    if parts.is_empty() {
        return None;
    }

    let separator = if ctx.phase == FlowPhase::Message { "\n\n" } else { " " };
    Some(Composition {
        text: parts.join(separator).trim().to_string(),
        snippet_ids,
        kinds,
    })
}

/// Why a template could not be rendered.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RenderError {
    #[error("no value for {{{0}}}")]
    Missing(String),
    #[error("unknown template variable {{{0}}}")]
    Unknown(String),
    #[error("rendered text still contains a placeholder")]
    Unresolved,
}

/// Fill `{variable}` placeholders from the context.
///
/// Names and feelings fall back to neutral phrases. The terminal-phase
/// phrases (why, need, ask) have no default and block rendering.
pub fn render(template: &str, ctx: &ComposerContext) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        match name.as_str() {
            "coparent_name" => match non_blank(&ctx.coparent_name) {
                Some(value) => out.push_str(value),
                None if ends_with_salutation(&out) => {
                    let trimmed = out.trim_end().len();
                    out.truncate(trimmed);
                }
                None => out.push_str("your co-parent"),
            },
            other => out.push_str(&lookup(other, ctx)?),
        }
    }
    out.push_str(&template[last..]);

    if PLACEHOLDER_RE.is_match(&out) {
        return Err(RenderError::Unresolved);
    }
    Ok(collapse_spaces(out.trim()))
}

fn lookup(name: &str, ctx: &ComposerContext) -> Result<String, RenderError> {
    let with_default = |value: &Option<String>, default: &str| {
        non_blank(value).unwrap_or(default).to_string()
    };
    let required = |value: &Option<String>| {
        non_blank(value)
            .map(str::to_string)
            .ok_or_else(|| RenderError::Missing(name.to_string()))
    };
    match name {
        "child_name" => Ok(with_default(&ctx.child_name, "your child")),
        "feeling" | "last_feeling" => Ok(with_default(&ctx.last_feeling, "what you're feeling")),
        "value" | "last_value" => Ok(with_default(&ctx.last_value, "what matters to you")),
        "issue" => Ok(with_default(&ctx.issue, "this situation")),
        "why" | "why_phrase" => required(&ctx.why_phrase),
        "need" | "need_phrase" => required(&ctx.need_phrase),
        "ask" | "ask_phrase" => required(&ctx.ask_phrase),
        other => Err(RenderError::Unknown(other.to_string())),
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn ends_with_salutation(text: &str) -> bool {
    let lower = text.to_lowercase();
    SALUTATIONS.iter().any(|s| lower.ends_with(s))
}

fn collapse_spaces(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_space = false;
    for c in text.chars() {
        if c == ' ' {
            if !prev_space {
                out.push(c);
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snippets::model::{FlowSnippet, SnippetStatus};

    fn ranked(snippets: Vec<FlowSnippet>) -> Vec<RankedSnippet> {
        snippets
            .into_iter()
            .map(|snippet| RankedSnippet {
                snippet,
                similarity: 0.5,
                score: 0.5,
            })
            .collect()
    }

    fn ctx(phase: FlowPhase) -> ComposerContext {
        ComposerContext {
            phase,
            ..Default::default()
        }
    }

    fn s(id: &str, kind: SnippetKind, content: &str) -> FlowSnippet {
        FlowSnippet::new(id, kind, None, content)
    }

    #[test]
    fn default_ordering_ack_then_prompt() {
        let snippets = ranked(vec![
            s("p1", SnippetKind::Prompt, "What happened?"),
            s("a1", SnippetKind::Acknowledgment, "Thanks for sharing."),
            s("c1", SnippetKind::Containment, "We can pause here."),
        ]);
        let out = compose(&snippets, &ctx(FlowPhase::Issue)).unwrap();
        assert_eq!(out.text, "Thanks for sharing. What happened?");
        assert_eq!(out.snippet_ids, vec!["a1", "p1"]);
        assert!(!out.uses(SnippetKind::Containment));
    }

    #[test]
    fn closure_uses_containment_instead_of_prompt() {
        let snippets = ranked(vec![
            s("p1", SnippetKind::Prompt, "What happened?"),
            s("c1", SnippetKind::Containment, "We can pause here."),
        ]);
        let mut c = ctx(FlowPhase::Issue);
        c.closure = true;
        let out = compose(&snippets, &c).unwrap();
        assert_eq!(out.text, "We can pause here.");
        assert!(out.uses(SnippetKind::Containment));
        assert!(!out.uses(SnippetKind::Prompt));
    }

    #[test]
    fn closure_without_containment_snippet_defers() {
        let snippets = ranked(vec![s("p1", SnippetKind::Prompt, "What happened?")]);
        let mut c = ctx(FlowPhase::Issue);
        c.closure = true;
        assert!(compose(&snippets, &c).is_none());
    }

    #[test]
    fn bridge_and_nudge_only_when_flagged() {
        let snippets = ranked(vec![
            s("b1", SnippetKind::Bridge, "Let's turn to how this feels."),
            s("p1", SnippetKind::Prompt, "What comes up?"),
            s("n1", SnippetKind::Nudge, "How might {child_name} see it?"),
        ]);
        let plain = compose(&snippets, &ctx(FlowPhase::Feelings)).unwrap();
        assert_eq!(plain.text, "What comes up?");

        let mut c = ctx(FlowPhase::Feelings);
        c.bridge = true;
        c.nudge = true;
        c.child_name = Some("Maya".into());
        let flagged = compose(&snippets, &c).unwrap();
        assert_eq!(
            flagged.text,
            "Let's turn to how this feels. What comes up? How might Maya see it?"
        );
    }

    #[test]
    fn missing_prompt_returns_none() {
        let snippets = ranked(vec![s("a1", SnippetKind::Acknowledgment, "Thanks.")]);
        assert!(compose(&snippets, &ctx(FlowPhase::Why)).is_none());
    }

    #[test]
    fn unapproved_snippets_are_never_used() {
        let snippets = ranked(vec![
            s("bad", SnippetKind::Prompt, "Unreviewed question?").with_status(SnippetStatus::Pending),
            s("good", SnippetKind::Prompt, "What happened?"),
        ]);
        let out = compose(&snippets, &ctx(FlowPhase::Issue)).unwrap();
        assert_eq!(out.snippet_ids, vec!["good"]);
    }

    #[test]
    fn options_ordering_needs_two_invitations() {
        let mut snippets = ranked(vec![
            s("r1", SnippetKind::ReEngagement, "Which feels closer?"),
            s("o1", SnippetKind::OptionInvitation, "You could talk on Sunday."),
            s("w1", SnippetKind::WhyRecap, "You care about {value}."),
            s("l1", SnippetKind::LensTie, "Both keep {child_name} in view."),
        ]);
        assert!(compose(&snippets, &ctx(FlowPhase::Options)).is_none());

        snippets.extend(ranked(vec![
            s("o2", SnippetKind::OptionInvitation, "Or you could write a note."),
            s("o3", SnippetKind::OptionInvitation, "Or wait a week."),
        ]));
        let out = compose(&snippets, &ctx(FlowPhase::Options)).unwrap();
        assert_eq!(out.snippet_ids, vec!["w1", "o1", "o2", "l1", "r1"]);
        assert_eq!(
            out.text,
            "You care about what matters to you. You could talk on Sunday. Or you could write a note. Both keep your child in view. Which feels closer?"
        );
    }

    #[test]
    fn message_without_language_only_collects() {
        let snippets = ranked(vec![
            s("seed", SnippetKind::CoAuthorSeed, "I'm writing because {why}."),
            s("ask", SnippetKind::CollectionRequest, "Before we draft, tell me why this matters and what you need."),
            s("close", SnippetKind::Containment, "Take your time."),
        ]);
        let out = compose(&snippets, &ctx(FlowPhase::Message)).unwrap();
        assert_eq!(out.kinds, vec![SnippetKind::CollectionRequest]);
        assert!(!out.text.contains('{'));
    }

    #[test]
    fn message_with_language_drafts() {
        let snippets = ranked(vec![
            s("seed", SnippetKind::CoAuthorSeed, "Hi {coparent_name}, this matters to me because {why}. I need {need}."),
            s("frame", SnippetKind::ClarityFrame, "Could we {ask}?"),
            s("close", SnippetKind::Containment, "Read it over when you're ready."),
        ]);
        let mut c = ctx(FlowPhase::Message);
        c.why_phrase = Some("the kids need calm evenings".into());
        c.need_phrase = Some("a day's notice".into());
        let out = compose(&snippets, &c).unwrap();
        assert_eq!(
            out.text,
            "Hi, this matters to me because the kids need calm evenings. I need a day's notice.\n\nRead it over when you're ready."
        );
        assert!(!out.uses(SnippetKind::ClarityFrame));

        c.ask_phrase = Some("swap Fridays".into());
        c.coparent_name = Some("Sam".into());
        let out = compose(&snippets, &c).unwrap();
        assert!(out.text.starts_with("Hi Sam, this matters"));
        assert!(out.text.contains("Could we swap Fridays?"));
    }

    #[test]
    fn render_defaults_and_blocking_variables() {
        let c = ctx(FlowPhase::Issue);
        assert_eq!(
            render("How is {child_name} doing?", &c).unwrap(),
            "How is your child doing?"
        );
        assert_eq!(
            render("What would {coparent_name} say?", &c).unwrap(),
            "What would your co-parent say?"
        );
        assert_eq!(render("Dear {coparent_name}, hello", &c).unwrap(), "Dear, hello");
        assert_eq!(
            render("Because {why}", &c).unwrap_err(),
            RenderError::Missing("why".into())
        );
        assert_eq!(
            render("Hi {nickname}", &c).unwrap_err(),
            RenderError::Unknown("nickname".into())
        );
    }

    #[test]
    fn render_rejects_placeholders_smuggled_in_values() {
        let mut c = ctx(FlowPhase::Issue);
        c.issue = Some("the {issue} thing".into());
        assert_eq!(render("About {issue}.", &c).unwrap_err(), RenderError::Unresolved);
    }
}
