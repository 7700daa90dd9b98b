//! Phase controller: readiness and reprompt count in, transition out.

use serde::{Deserialize, Serialize};

use crate::error::{Error, FlowError};

use super::phase::FlowPhase;
use super::phase_config::{PhaseCfg, PhaseTable};
use super::state::FlowState;

/// What the controller decided for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Remain in the current phase and reprompt.
    Stay,
    /// Readiness met the threshold.
    Advance,
    /// Reprompt budget exhausted; advanced regardless of readiness.
    ForceAdvance,
    /// Explicit caller-requested jump.
    Jump,
    /// Moved one step inside the terminal sub-flow.
    Substate,
    /// Deep Think chosen; session paused.
    Pause,
    /// Terminal sub-flow finished.
    Complete,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stay => "stay",
            Self::Advance => "advance",
            Self::ForceAdvance => "force_advance",
            Self::Jump => "jump",
            Self::Substate => "substate",
            Self::Pause => "pause",
            Self::Complete => "complete",
        }
    }

    /// Whether this decision moves to a different phase.
    pub fn changes_phase(&self) -> bool {
        matches!(self, Self::Advance | Self::ForceAdvance | Self::Jump)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stay" => Ok(Self::Stay),
            "advance" => Ok(Self::Advance),
            "force_advance" => Ok(Self::ForceAdvance),
            "jump" => Ok(Self::Jump),
            "substate" => Ok(Self::Substate),
            "pause" => Ok(Self::Pause),
            "complete" => Ok(Self::Complete),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

/// Where a turn's reply text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    /// Parsed generator output.
    Generator,
    /// Canned reply after a generator failure.
    Fallback,
    /// Composed directly from snippets.
    Composer,
    /// Fixed sub-flow copy.
    Script,
}

impl ReplySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Fallback => "fallback",
            Self::Composer => "composer",
            Self::Script => "script",
        }
    }

    /// Unknown values read back from storage map to `Generator`.
    pub fn from_db(s: &str) -> Self {
        match s {
            "fallback" => Self::Fallback,
            "composer" => Self::Composer,
            "script" => Self::Script,
            _ => Self::Generator,
        }
    }
}

/// The outcome of applying a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub decision: Decision,
    pub from: FlowPhase,
    pub to: FlowPhase,
}

impl Transition {
    pub fn advanced(&self) -> bool {
        self.from != self.to
    }
}

/// Decide whether to stay or advance out of a non-terminal phase.
///
/// Force-advance is checked against the count before this turn's
/// increment, so once `reprompt_count == max_reprompts` the very next turn
/// advances.
pub fn decide(cfg: &PhaseCfg, next: Option<FlowPhase>, readiness: f64, reprompt_count: u32) -> Decision {
    if next.is_none() {
        return Decision::Stay;
    }
    if readiness >= cfg.min_readiness_to_advance {
        Decision::Advance
    } else if reprompt_count >= cfg.max_reprompts {
        Decision::ForceAdvance
    } else {
        Decision::Stay
    }
}

/// Apply a decision to the session state and return the transition.
pub fn apply(state: &mut FlowState, from: FlowPhase, decision: Decision, next: Option<FlowPhase>) -> Transition {
    let to = match (decision.changes_phase(), next) {
        (true, Some(next)) => next,
        _ => from,
    };
    if to != from {
        state.reset_reprompts();
        state.previous_phase = Some(from);
    } else if decision == Decision::Stay {
        state.increment_reprompts();
    }
    Transition { decision, from, to }
}

/// Validate an explicit jump: forward only, to an enabled phase.
pub fn validate_jump(table: &PhaseTable, from: FlowPhase, to: FlowPhase) -> Result<FlowPhase, Error> {
    if !from.can_transition_to(to) {
        return Err(FlowError::InvalidJump {
            from: from.to_string(),
            to: to.to_string(),
        }
        .into());
    }
    table.resolve(to)?;
    Ok(to)
}
