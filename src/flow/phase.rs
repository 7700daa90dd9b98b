//! Reflection phases and the terminal phase's sub-states.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The phases of a guided reflection.
///
/// Progresses linearly: Issue → Feelings → Why → Coparent → Child →
/// Options → Message. `Message` is terminal and runs its own sub-flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowPhase {
    Issue,
    Feelings,
    Why,
    Coparent,
    Child,
    Options,
    Message,
}

impl FlowPhase {
    /// Every phase, in flow order.
    pub const ALL: [FlowPhase; 7] = [
        FlowPhase::Issue,
        FlowPhase::Feelings,
        FlowPhase::Why,
        FlowPhase::Coparent,
        FlowPhase::Child,
        FlowPhase::Options,
        FlowPhase::Message,
    ];

    /// Zero-based position in the flow.
    pub fn index(&self) -> usize {
        match self {
            Self::Issue => 0,
            Self::Feelings => 1,
            Self::Why => 2,
            Self::Coparent => 3,
            Self::Child => 4,
            Self::Options => 5,
            Self::Message => 6,
        }
    }

    /// Get the next phase in the linear progression, if any.
    pub fn next(&self) -> Option<FlowPhase> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Whether `target` is the immediate successor of `self`.
    pub fn is_successor(&self, target: FlowPhase) -> bool {
        self.next() == Some(target)
    }

    /// Check if a transition from `self` to `target` keeps the flow moving
    /// forward. Forced jumps may skip phases but never go back.
    pub fn can_transition_to(&self, target: FlowPhase) -> bool {
        target.index() > self.index()
    }

    /// Whether this is the terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Message)
    }

    /// Phases that use the default acknowledgment/prompt composition.
    pub fn is_exploratory(&self) -> bool {
        self.index() <= Self::Child.index()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Feelings => "feelings",
            Self::Why => "why",
            Self::Coparent => "coparent",
            Self::Child => "child",
            Self::Options => "options",
            Self::Message => "message",
        }
    }

    /// Short human label used in prompts.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Issue => "Naming the issue",
            Self::Feelings => "Feelings",
            Self::Why => "Why it matters",
            Self::Coparent => "The co-parent's shoes",
            Self::Child => "The child's view",
            Self::Options => "Choosing a way forward",
            Self::Message => "Crafting the message",
        }
    }
}

impl Default for FlowPhase {
    fn default() -> Self {
        Self::Issue
    }
}

impl std::fmt::Display for FlowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FlowPhase {
    type Err = ConfigError;

    /// Accepts canonical names plus the richer-variant aliases
    /// (`perspective`/`shoes` → coparent, `choose` → options).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "issue" => Ok(Self::Issue),
            "feelings" => Ok(Self::Feelings),
            "why" => Ok(Self::Why),
            "coparent" | "perspective" | "shoes" => Ok(Self::Coparent),
            "child" => Ok(Self::Child),
            "options" | "choose" => Ok(Self::Options),
            "message" => Ok(Self::Message),
            other => Err(ConfigError::UnknownPhase {
                phase: other.to_string(),
            }),
        }
    }
}

/// Sub-states of the terminal `Message` phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase7Step {
    Integrate,
    Option,
    CoAuthor,
    FitCheck,
    Contain,
}

impl Phase7Step {
    /// Default sub-state order.
    pub const DEFAULT_ORDER: [Phase7Step; 5] = [
        Phase7Step::Integrate,
        Phase7Step::Option,
        Phase7Step::CoAuthor,
        Phase7Step::FitCheck,
        Phase7Step::Contain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integrate => "integrate",
            Self::Option => "option",
            Self::CoAuthor => "co_author",
            Self::FitCheck => "fit_check",
            Self::Contain => "contain",
        }
    }

    /// Next sub-state within `order`, or `None` at the end.
    pub fn next_in(&self, order: &[Phase7Step]) -> Option<Phase7Step> {
        let pos = order.iter().position(|s| s == self)?;
        order.get(pos + 1).copied()
    }
}

impl std::fmt::Display for Phase7Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase7Step {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "integrate" => Ok(Self::Integrate),
            "option" => Ok(Self::Option),
            "co_author" | "coauthor" => Ok(Self::CoAuthor),
            "fit_check" | "fitcheck" => Ok(Self::FitCheck),
            "contain" => Ok(Self::Contain),
            other => Err(ConfigError::ParseError(format!("unknown sub-state: {other}"))),
        }
    }
}
