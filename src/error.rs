//! Error types for the flow engine.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),
}

/// Configuration-related errors.
///
/// `UnknownPhase` and `PhaseDisabled` indicate a client or deployment bug and
/// are never degraded into a user-facing reply.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown phase: {phase}")]
    UnknownPhase { phase: String },

    #[error("Phase {phase} is disabled")]
    PhaseDisabled { phase: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Version conflict on session {session_id}: expected {expected}, found {found}")]
    VersionConflict {
        session_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Request to {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Snippet retrieval errors. Always absorbed by the retriever.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Retrieval is disabled")]
    Disabled,

    #[error("Retrieval backend failed: {0}")]
    Backend(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Session-level integrity errors surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Session {session_id} is paused awaiting Deep Think review")]
    SessionPaused { session_id: String },

    #[error("Session {session_id} is already complete")]
    SessionComplete { session_id: String },

    #[error("Cannot jump from {from} to {to}")]
    InvalidJump { from: String, to: String },

    #[error("Session {session_id} was modified concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        session_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Session {session_id} has no Deep Think snapshot to resume")]
    NothingToResume { session_id: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

