//! Content snippets and their taxonomy.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::flow::phase::FlowPhase;

/// Structural role a snippet plays in a composed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnippetKind {
    Acknowledgment,
    Containment,
    Bridge,
    Prompt,
    Nudge,
    OptionInvitation,
    WhyRecap,
    ConfirmWhy,
    LensTie,
    ReEngagement,
    CollectionRequest,
    CoAuthorSeed,
    ClarityFrame,
}

impl SnippetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acknowledgment => "acknowledgment",
            Self::Containment => "containment",
            Self::Bridge => "bridge",
            Self::Prompt => "prompt",
            Self::Nudge => "nudge",
            Self::OptionInvitation => "option_invitation",
            Self::WhyRecap => "why_recap",
            Self::ConfirmWhy => "confirm_why",
            Self::LensTie => "lens_tie",
            Self::ReEngagement => "re_engagement",
            Self::CollectionRequest => "collection_request",
            Self::CoAuthorSeed => "co_author_seed",
            Self::ClarityFrame => "clarity_frame",
        }
    }
}

impl std::fmt::Display for SnippetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SnippetKind {
    type Err = String;

    /// Accepts snake_case and hyphenated spellings (`option-invitation`,
    /// `re-engage`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "acknowledgment" | "acknowledgement" => Ok(Self::Acknowledgment),
            "containment" => Ok(Self::Containment),
            "bridge" => Ok(Self::Bridge),
            "prompt" => Ok(Self::Prompt),
            "nudge" => Ok(Self::Nudge),
            "option_invitation" => Ok(Self::OptionInvitation),
            "why_recap" => Ok(Self::WhyRecap),
            "confirm_why" => Ok(Self::ConfirmWhy),
            "lens_tie" => Ok(Self::LensTie),
            "re_engagement" | "re_engage" => Ok(Self::ReEngagement),
            "collection_request" => Ok(Self::CollectionRequest),
            "co_author_seed" | "coauthor_seed" => Ok(Self::CoAuthorSeed),
            "clarity_frame" => Ok(Self::ClarityFrame),
            other => Err(format!("unknown snippet kind: {other}")),
        }
    }
}

/// Moderation status. Only `Approved` snippets are ever surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnippetStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Retired,
}

impl SnippetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Retired => "retired",
        }
    }

    /// Unknown strings map to `Pending`, which is never eligible.
    pub fn from_db(s: &str) -> Self {
        match s {
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            "retired" => Self::Retired,
            _ => Self::Pending,
        }
    }
}

/// How much a snippet's authorship is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StewardTier {
    Primary,
    Secondary,
    Other,
}

/// An immutable unit of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnippet {
    pub id: String,
    /// Template text with `{variable}` placeholders.
    pub content: String,
    pub kind: SnippetKind,
    /// `None` means usable in any phase.
    pub phase: Option<FlowPhase>,
    pub weight: f64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub steward: Option<String>,
    #[serde(default)]
    pub status: SnippetStatus,
}

impl FlowSnippet {
    /// An approved snippet with weight 1.0.
    pub fn new(id: impl Into<String>, kind: SnippetKind, phase: Option<FlowPhase>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            kind,
            phase,
            weight: 1.0,
            tags: BTreeSet::new(),
            steward: None,
            status: SnippetStatus::Approved,
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_steward(mut self, steward: impl Into<String>) -> Self {
        self.steward = Some(steward.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_status(mut self, status: SnippetStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_approved(&self) -> bool {
        self.status == SnippetStatus::Approved
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Containment content, by kind or by tag.
    pub fn is_containment(&self) -> bool {
        self.kind == SnippetKind::Containment || self.has_tag("containment")
    }

    pub fn steward_tier(&self) -> StewardTier {
        match self.steward.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("steward" | "primary" | "primary_steward") => StewardTier::Primary,
            Some("admin" | "secondary" | "secondary_steward") => StewardTier::Secondary,
            _ => StewardTier::Other,
        }
    }
}

/// A snippet as returned by a `SnippetSource`, before boosting.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub snippet: FlowSnippet,
    /// Externally computed relevance, 0.0..=1.0.
    pub similarity: f64,
}

/// A snippet with its retrieval similarity and boosted score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedSnippet {
    pub snippet: FlowSnippet,
    pub similarity: f64,
    pub score: f64,
}

/// Token-overlap similarity between a query and a snippet, in 0.0..=1.0.
///
/// The fraction of distinct query words (three letters or more) that also
/// appear in the snippet's content or tags.
pub fn lexical_similarity(query: &str, snippet: &FlowSnippet) -> f64 {
    let query_tokens = tokens(query);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let mut haystack = tokens(&snippet.content);
    for tag in &snippet.tags {
        haystack.extend(tokens(tag));
    }
    let hits = query_tokens.iter().filter(|t| haystack.contains(*t)).count();
    hits as f64 / query_tokens.len() as f64
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(str::to_string)
        .collect()
}
