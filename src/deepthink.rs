//! Deep Think: the durable pause in the message sub-flow.
//!
//! Choosing Deep Think enqueues a job holding a snapshot of the session and
//! a `due_at`. A background sweeper claims due jobs and hands them to
//! `FlowEngine::resume_deep_think`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::engine::FlowEngine;
use crate::flow::state::FlowState;

/// Jobs claimed per sweep.
pub const SWEEP_BATCH: usize = 16;

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Done,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "claimed" => Self::Claimed,
            "done" => Self::Done,
            _ => Self::Pending,
        }
    }
}

/// A paused session awaiting asynchronous guidance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepThinkJob {
    pub id: Uuid,
    pub session_id: String,
    pub due_at: DateTime<Utc>,
    /// Session state at the moment of pausing.
    pub snapshot: FlowState,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl DeepThinkJob {
    /// A pending job due `delay` from now.
    pub fn new(session_id: impl Into<String>, snapshot: FlowState, delay: Duration) -> Self {
        let now = Utc::now();
        let fallback = chrono::Duration::hours(24);
        let delay = chrono::Duration::from_std(delay).unwrap_or(fallback);
        let due_at = now
            .checked_add_signed(delay)
            .unwrap_or_else(|| now + fallback);
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            due_at,
            snapshot,
            status: JobStatus::Pending,
            created_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.due_at <= now
    }
}

/// Spawn the Deep Think sweeper background task.
pub fn spawn_deepthink_sweeper(
    engine: Arc<FlowEngine>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let resumed = engine.resume_due_deep_think(Utc::now(), SWEEP_BATCH).await;
            if resumed > 0 {
                tracing::info!(resumed, "Deep Think sweep resumed sessions");
            }
        }
    })
}
