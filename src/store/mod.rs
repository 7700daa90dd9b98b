//! Persistence layer: libSQL-backed storage for sessions, phase
//! configuration, snippets, traces and the Deep Think queue.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Database, DeepThinkQueue, PhaseConfigStore, SessionRecord, SessionStore, SnippetSource,
    TraceRecord, TraceSink,
};
