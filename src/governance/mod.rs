//! Governance: coaching rules, phase guidance, and instruction assembly.

pub mod builder;
pub mod config;

pub use builder::{PromptInput, build_instructions};
pub use config::{GovernanceConfig, Phase7Copy, PhaseGuidance};
