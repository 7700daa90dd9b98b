//! libSQL backend: implements every store trait over one connection.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::deepthink::{DeepThinkJob, JobStatus};
use crate::error::{DatabaseError, RetrievalError};
use crate::flow::controller::{Decision, ReplySource};
use crate::flow::phase::{FlowPhase, Phase7Step};
use crate::flow::phase_config::PhaseConfigRow;
use crate::flow::state::FlowState;
use crate::snippets::model::{Candidate, FlowSnippet, SnippetKind, SnippetStatus, lexical_similarity};
use crate::store::migrations;
use crate::store::traits::{
    Database, DeepThinkQueue, PhaseConfigStore, SessionRecord, SessionStore, SnippetSource,
    TraceRecord, TraceSink,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn session_version(&self, session_id: &str) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT version FROM flow_sessions WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("session_version: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let v: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("session_version row parse: {e}")))?;
                Ok(u64::try_from(v).unwrap_or(0))
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("session_version: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    // Try SQLite datetime() output without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Fixed-width UTC timestamp so `due_at` compares correctly as text.
fn sortable_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn string_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn parse_phase(raw: &str) -> Result<FlowPhase, DatabaseError> {
    raw.parse()
        .map_err(|e| DatabaseError::Serialization(format!("phase '{raw}': {e}")))
}

/// Column order matches SESSION_COLUMNS:
/// 0:session_id, 1:current_phase, 2:state, 3:version, 4:updated_at
fn row_to_session(row: &libsql::Row) -> Result<SessionRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("session row parse: {e}"));
    let session_id: String = row.get(0).map_err(get_err)?;
    let phase_str: String = row.get(1).map_err(get_err)?;
    let state_json: String = row.get(2).map_err(get_err)?;
    let version: i64 = row.get(3).map_err(get_err)?;
    let updated_str: String = row.get(4).map_err(get_err)?;

    let mut state: FlowState = serde_json::from_str(&state_json)
        .map_err(|e| DatabaseError::Serialization(format!("session {session_id} state: {e}")))?;
    // The column is authoritative for the concurrency stamp.
    state.version = u64::try_from(version).unwrap_or(0);

    Ok(SessionRecord {
        current_phase: parse_phase(&phase_str)?,
        session_id,
        state,
        updated_at: parse_datetime(&updated_str),
    })
}

/// Column order matches PHASE_COLUMNS:
/// 0:phase, 1:next_phase, 2:min_readiness_to_advance, 3:max_reprompts,
/// 4:allow_deepthink, 5:substate_order, 6:enabled
fn row_to_phase_config(row: &libsql::Row) -> Result<PhaseConfigRow, libsql::Error> {
    let substate_order: String = row.get::<String>(5).unwrap_or_else(|_| "[]".into());
    Ok(PhaseConfigRow {
        phase: row.get(0)?,
        next_phase: row.get::<String>(1).ok(),
        min_readiness_to_advance: row.get(2)?,
        max_reprompts: row.get(3)?,
        allow_deepthink: row.get::<i64>(4)? != 0,
        substate_order: string_list(&substate_order),
        enabled: row.get::<i64>(6)? != 0,
    })
}

/// Column order matches SNIPPET_COLUMNS:
/// 0:id, 1:content, 2:kind, 3:phase, 4:weight, 5:tags, 6:steward, 7:status
fn row_to_snippet(row: &libsql::Row) -> Result<FlowSnippet, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("snippet row parse: {e}"));
    let id: String = row.get(0).map_err(get_err)?;
    let kind_str: String = row.get(2).map_err(get_err)?;
    let kind: SnippetKind = kind_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("snippet {id} kind: {e}")))?;
    let phase = match row.get::<String>(3).ok() {
        Some(p) if !p.trim().is_empty() => Some(parse_phase(&p)?),
        _ => None,
    };
    let tags: String = row.get::<String>(5).unwrap_or_else(|_| "[]".into());
    let status: String = row.get(7).map_err(get_err)?;

    Ok(FlowSnippet {
        content: row.get(1).map_err(get_err)?,
        kind,
        phase,
        weight: row.get(4).map_err(get_err)?,
        tags: string_list(&tags).into_iter().collect(),
        steward: row.get::<String>(6).ok(),
        status: SnippetStatus::from_db(&status),
        id,
    })
}

/// Column order matches TRACE_COLUMNS:
/// 0:id, 1:session_id, 2:turn_index, 3:phase, 4:substate, 5:user_input,
/// 6:ai_response, 7:readiness, 8:decision, 9:source, 10:snippet_ids,
/// 11:proposed_next_phase, 12:context_fields, 13:created_at
fn row_to_trace(row: &libsql::Row) -> Result<TraceRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("trace row parse: {e}"));
    let id_str: String = row.get(0).map_err(get_err)?;
    let phase_str: String = row.get(3).map_err(get_err)?;
    let decision_str: String = row.get(8).map_err(get_err)?;
    let source_str: String = row.get(9).map_err(get_err)?;
    let snippet_ids: String = row.get(10).map_err(get_err)?;
    let context_fields: String = row.get(12).map_err(get_err)?;
    let created_str: String = row.get(13).map_err(get_err)?;
    let turn_index: i64 = row.get(2).map_err(get_err)?;

    Ok(TraceRecord {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("trace id: {e}")))?,
        session_id: row.get(1).map_err(get_err)?,
        turn_index: u64::try_from(turn_index).unwrap_or(0),
        phase: parse_phase(&phase_str)?,
        substate: row
            .get::<String>(4)
            .ok()
            .and_then(|s| s.parse::<Phase7Step>().ok()),
        user_input: row.get(5).map_err(get_err)?,
        ai_response: row.get(6).map_err(get_err)?,
        readiness: row.get(7).map_err(get_err)?,
        decision: decision_str
            .parse::<Decision>()
            .map_err(DatabaseError::Serialization)?,
        source: ReplySource::from_db(&source_str),
        snippet_ids: string_list(&snippet_ids),
        proposed_next_phase: row.get::<String>(11).ok(),
        context_fields: string_list(&context_fields),
        created_at: parse_datetime(&created_str),
    })
}

/// Column order matches JOB_COLUMNS:
/// 0:id, 1:session_id, 2:due_at, 3:snapshot, 4:status, 5:created_at
fn row_to_job(row: &libsql::Row) -> Result<DeepThinkJob, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("deepthink row parse: {e}"));
    let id_str: String = row.get(0).map_err(get_err)?;
    let due_str: String = row.get(2).map_err(get_err)?;
    let snapshot: String = row.get(3).map_err(get_err)?;
    let status: String = row.get(4).map_err(get_err)?;
    let created_str: String = row.get(5).map_err(get_err)?;

    Ok(DeepThinkJob {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("deepthink id: {e}")))?,
        session_id: row.get(1).map_err(get_err)?,
        due_at: parse_datetime(&due_str),
        snapshot: serde_json::from_str(&snapshot)
            .map_err(|e| DatabaseError::Serialization(format!("deepthink snapshot: {e}")))?,
        status: JobStatus::from_db(&status),
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementations ───────────────────────────────────────────

const SESSION_COLUMNS: &str = "session_id, current_phase, state, version, updated_at";

const PHASE_COLUMNS: &str = "phase, next_phase, min_readiness_to_advance, max_reprompts, allow_deepthink, substate_order, enabled";

const SNIPPET_COLUMNS: &str = "id, content, kind, phase, weight, tags, steward, status";

const TRACE_COLUMNS: &str = "id, session_id, turn_index, phase, substate, user_input, ai_response, readiness, decision, source, snippet_ids, proposed_next_phase, context_fields, created_at";

const JOB_COLUMNS: &str = "id, session_id, due_at, snapshot, status, created_at";

#[async_trait]
impl SessionStore for LibSqlBackend {
    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM flow_sessions WHERE session_id = ?1"),
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_session(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("load_session: {e}"))),
        }
    }

    async fn save_session(
        &self,
        record: &SessionRecord,
        expected_version: u64,
    ) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let new_version = expected_version + 1;
        let mut state = record.state.clone();
        state.version = new_version;
        let state_json = to_json("session state", &state)?;
        let now = Utc::now().to_rfc3339();
        let version_param = i64::try_from(new_version)
            .map_err(|_| DatabaseError::Serialization("session version overflow".into()))?;

        let affected = if expected_version == 0 {
            conn.execute(
                "INSERT OR IGNORE INTO flow_sessions (session_id, current_phase, state, status, version, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    record.session_id.clone(),
                    record.current_phase.to_string(),
                    state_json,
                    state.status.to_string(),
                    version_param,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_session insert: {e}")))?
        } else {
            conn.execute(
                "UPDATE flow_sessions SET current_phase = ?1, state = ?2, status = ?3, version = ?4, updated_at = ?5 WHERE session_id = ?6 AND version = ?7",
                params![
                    record.current_phase.to_string(),
                    state_json,
                    state.status.to_string(),
                    version_param,
                    now,
                    record.session_id.clone(),
                    version_param - 1,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_session update: {e}")))?
        };

        if affected == 0 {
            let found = self.session_version(&record.session_id).await?;
            return Err(DatabaseError::VersionConflict {
                session_id: record.session_id.clone(),
                expected: expected_version,
                found,
            });
        }

        debug!(
            session_id = %record.session_id,
            phase = %record.current_phase,
            version = new_version,
            "Session saved"
        );
        Ok(new_version)
    }
}

#[async_trait]
impl PhaseConfigStore for LibSqlBackend {
    async fn load_phase_rows(&self) -> Result<Vec<PhaseConfigRow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(&format!("SELECT {PHASE_COLUMNS} FROM phase_config"), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("load_phase_rows: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_phase_config(&row) {
                Ok(r) => out.push(r),
                Err(e) => tracing::warn!("Skipping phase_config row: {e}"),
            }
        }
        Ok(out)
    }

    async fn upsert_phase_row(&self, row: &PhaseConfigRow) -> Result<(), DatabaseError> {
        let substate_order = to_json("substate_order", &row.substate_order)?;
        self.conn()
            .execute(
                "INSERT INTO phase_config (phase, next_phase, min_readiness_to_advance, max_reprompts, allow_deepthink, substate_order, enabled, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(phase) DO UPDATE SET next_phase = excluded.next_phase, min_readiness_to_advance = excluded.min_readiness_to_advance, max_reprompts = excluded.max_reprompts, allow_deepthink = excluded.allow_deepthink, substate_order = excluded.substate_order, enabled = excluded.enabled, updated_at = excluded.updated_at",
                params![
                    row.phase.clone(),
                    opt_text(row.next_phase.as_deref()),
                    row.min_readiness_to_advance,
                    row.max_reprompts,
                    i64::from(row.allow_deepthink),
                    substate_order,
                    i64::from(row.enabled),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_phase_row: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl SnippetSource for LibSqlBackend {
    async fn fetch_snippets(
        &self,
        query: &str,
        phase: FlowPhase,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SNIPPET_COLUMNS} FROM flow_snippets WHERE status = 'approved' AND (phase = ?1 OR phase IS NULL)"
                ),
                params![phase.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_snippets: {e}")))?;

        let text = if tags.is_empty() {
            query.to_string()
        } else {
            format!("{query} {}", tags.join(" "))
        };

        let mut candidates = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_snippet(&row) {
                Ok(snippet) => {
                    let similarity = lexical_similarity(&text, &snippet);
                    candidates.push(Candidate {
                        snippet,
                        similarity,
                    });
                }
                Err(e) => tracing::warn!("Skipping snippet row: {e}"),
            }
        }

        candidates.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.snippet.id.cmp(&b.snippet.id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }
}

#[async_trait]
impl TraceSink for LibSqlBackend {
    async fn record_trace(&self, trace: &TraceRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO flow_traces ({TRACE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    trace.id.to_string(),
                    trace.session_id.clone(),
                    i64::try_from(trace.turn_index).unwrap_or(i64::MAX),
                    trace.phase.to_string(),
                    opt_text(trace.substate.map(|s| s.as_str())),
                    trace.user_input.clone(),
                    trace.ai_response.clone(),
                    trace.readiness,
                    trace.decision.as_str(),
                    trace.source.as_str(),
                    to_json("snippet_ids", &trace.snippet_ids)?,
                    opt_text(trace.proposed_next_phase.as_deref()),
                    to_json("context_fields", &trace.context_fields)?,
                    trace.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_trace: {e}")))?;
        Ok(())
    }

    async fn list_traces(&self, session_id: &str) -> Result<Vec<TraceRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TRACE_COLUMNS} FROM flow_traces WHERE session_id = ?1 ORDER BY turn_index ASC, created_at ASC"
                ),
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_traces: {e}")))?;

        let mut traces = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_trace(&row) {
                Ok(t) => traces.push(t),
                Err(e) => tracing::warn!("Skipping trace row: {e}"),
            }
        }
        Ok(traces)
    }
}

#[async_trait]
impl DeepThinkQueue for LibSqlBackend {
    async fn enqueue_deepthink(&self, job: &DeepThinkJob) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO deepthink_jobs (id, session_id, due_at, snapshot, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    job.id.to_string(),
                    job.session_id.clone(),
                    sortable_ts(job.due_at),
                    to_json("deepthink snapshot", &job.snapshot)?,
                    job.status.as_str(),
                    job.created_at.to_rfc3339(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue_deepthink: {e}")))?;

        debug!(job_id = %job.id, session_id = %job.session_id, due_at = %job.due_at, "Deep Think job enqueued");
        Ok(())
    }

    async fn claim_due_deepthink(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeepThinkJob>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM deepthink_jobs WHERE status = 'pending' AND due_at <= ?1 ORDER BY due_at ASC LIMIT ?2"
                ),
                params![sortable_ts(now), i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_due_deepthink: {e}")))?;

        let mut due = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => due.push(job),
                Err(e) => tracing::warn!("Skipping deepthink row: {e}"),
            }
        }
        drop(rows);

        // The status guard makes each claim exclusive even if two sweepers
        // select the same row.
        let mut claimed = Vec::with_capacity(due.len());
        for mut job in due {
            let affected = conn
                .execute(
                    "UPDATE deepthink_jobs SET status = 'claimed', updated_at = ?1 WHERE id = ?2 AND status = 'pending'",
                    params![Utc::now().to_rfc3339(), job.id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_due_deepthink update: {e}")))?;
            if affected == 1 {
                job.status = JobStatus::Claimed;
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn complete_deepthink(&self, id: Uuid) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE deepthink_jobs SET status = 'done', updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_deepthink: {e}")))?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "deepthink_job".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_snippet(&self, snippet: &FlowSnippet) -> Result<(), DatabaseError> {
        let tags: Vec<&String> = snippet.tags.iter().collect();
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO flow_snippets ({SNIPPET_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    snippet.id.clone(),
                    snippet.content.clone(),
                    snippet.kind.as_str(),
                    opt_text(snippet.phase.map(|p| p.as_str())),
                    snippet.weight,
                    to_json("tags", &tags)?,
                    opt_text(snippet.steward.as_deref()),
                    snippet.status.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_snippet: {e}")))?;
        debug!(snippet_id = %snippet.id, kind = %snippet.kind, "Snippet stored");
        Ok(())
    }
}
