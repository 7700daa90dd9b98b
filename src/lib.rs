//! Reflect Flow: phase-driven guided reflection engine.

pub mod config;
pub mod deepthink;
pub mod error;
pub mod flow;
pub mod governance;
pub mod llm;
pub mod snippets;
pub mod store;
