//! Store traits: one async interface per collaborator the engine talks to.
//!
//! `LibSqlBackend` implements all of them; tests substitute small stubs for
//! whichever one they need to fail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::deepthink::DeepThinkJob;
use crate::error::{DatabaseError, RetrievalError};
use crate::flow::controller::{Decision, ReplySource};
use crate::flow::phase::{FlowPhase, Phase7Step};
use crate::flow::phase_config::PhaseConfigRow;
use crate::flow::state::FlowState;
use crate::snippets::model::{Candidate, FlowSnippet};

/// A persisted session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub current_phase: FlowPhase,
    pub state: FlowState,
    pub updated_at: DateTime<Utc>,
}

/// One append-only observability record per processed turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
    pub id: Uuid,
    pub session_id: String,
    pub turn_index: u64,
    pub phase: FlowPhase,
    pub substate: Option<Phase7Step>,
    pub user_input: String,
    pub ai_response: String,
    pub readiness: f64,
    pub decision: Decision,
    pub source: ReplySource,
    pub snippet_ids: Vec<String>,
    /// The generator's own phase suggestion; recorded, never acted on.
    pub proposed_next_phase: Option<String>,
    /// Context fields the turn's delta actually changed.
    pub context_fields: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ── Sessions ────────────────────────────────────────────────────────

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session by ID.
    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, DatabaseError>;

    /// Compare-and-set save. Succeeds only if the stored version equals
    /// `expected_version` (0 for a session that does not exist yet).
    /// Returns the new version.
    async fn save_session(
        &self,
        record: &SessionRecord,
        expected_version: u64,
    ) -> Result<u64, DatabaseError>;
}

// ── Phase configuration ─────────────────────────────────────────────

#[async_trait]
pub trait PhaseConfigStore: Send + Sync {
    /// Read every phase row in one call.
    async fn load_phase_rows(&self) -> Result<Vec<PhaseConfigRow>, DatabaseError>;

    /// Insert or replace the row for `row.phase`.
    async fn upsert_phase_row(&self, row: &PhaseConfigRow) -> Result<(), DatabaseError>;
}

// ── Snippets ────────────────────────────────────────────────────────

#[async_trait]
pub trait SnippetSource: Send + Sync {
    /// Fetch up to `limit` candidates for `phase` with similarity scores.
    ///
    /// Sources may return unapproved snippets; the ranker drops them.
    async fn fetch_snippets(
        &self,
        query: &str,
        phase: FlowPhase,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<Candidate>, RetrievalError>;
}

// ── Traces ──────────────────────────────────────────────────────────

#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Append a trace record.
    async fn record_trace(&self, trace: &TraceRecord) -> Result<(), DatabaseError>;

    /// List a session's traces in turn order.
    async fn list_traces(&self, session_id: &str) -> Result<Vec<TraceRecord>, DatabaseError>;
}

// ── Deep Think queue ────────────────────────────────────────────────

#[async_trait]
pub trait DeepThinkQueue: Send + Sync {
    /// Enqueue a paused session for later resumption.
    async fn enqueue_deepthink(&self, job: &DeepThinkJob) -> Result<(), DatabaseError>;

    /// Mark up to `limit` pending jobs due at or before `now` as claimed
    /// and return them. A job is handed out once.
    async fn claim_due_deepthink(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeepThinkJob>, DatabaseError>;

    /// Mark a claimed job done.
    async fn complete_deepthink(&self, id: Uuid) -> Result<(), DatabaseError>;
}

/// Everything the server needs from one backend.
#[async_trait]
pub trait Database:
    SessionStore + PhaseConfigStore + SnippetSource + TraceSink + DeepThinkQueue
{
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert or replace a snippet in the content store.
    async fn insert_snippet(&self, snippet: &FlowSnippet) -> Result<(), DatabaseError>;
}
