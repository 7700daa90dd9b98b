//! The Flow Engine: phases, signals, policy, and the per-turn pipeline.

pub mod controller;
pub mod engine;
mod message;
pub mod phase;
pub mod phase7;
pub mod phase_config;
pub mod routes;
pub mod signals;
pub mod state;

pub use controller::{Decision, ReplySource};
pub use engine::{FlowEngine, TurnRequest, TurnResponse};
pub use phase::{FlowPhase, Phase7Step};
pub use phase_config::{PhaseCfg, PhaseConfigResolver, PhaseTable};
pub use routes::flow_routes;
pub use state::{FlowContext, FlowState, SessionStatus};
