//! Schema for the flow tables.
//!
//! Applied versions are recorded in `_migrations`; only newer entries in
//! `MIGRATIONS` run. Missing `phase_config` rows are then filled from the
//! built-in phase table.

use libsql::Connection;

use crate::error::DatabaseError;
use crate::flow::phase_config::{PhaseConfigRow, PhaseTable};

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS flow_sessions (
                session_id TEXT PRIMARY KEY,
                current_phase TEXT NOT NULL,
                state TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_flow_sessions_status ON flow_sessions(status);

            CREATE TABLE IF NOT EXISTS phase_config (
                phase TEXT PRIMARY KEY,
                next_phase TEXT,
                min_readiness_to_advance REAL NOT NULL,
                max_reprompts INTEGER NOT NULL,
                allow_deepthink INTEGER NOT NULL DEFAULT 0,
                substate_order TEXT NOT NULL DEFAULT '[]',
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS flow_snippets (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                kind TEXT NOT NULL,
                phase TEXT,
                weight REAL NOT NULL DEFAULT 1.0,
                tags TEXT NOT NULL DEFAULT '[]',
                steward TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_flow_snippets_phase ON flow_snippets(phase);
            CREATE INDEX IF NOT EXISTS idx_flow_snippets_status ON flow_snippets(status);
        "#,
    },
    Migration {
        version: 2,
        name: "flow_traces",
        sql: r#"
            CREATE TABLE IF NOT EXISTS flow_traces (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                turn_index INTEGER NOT NULL,
                phase TEXT NOT NULL,
                substate TEXT,
                user_input TEXT NOT NULL,
                ai_response TEXT NOT NULL,
                readiness REAL NOT NULL,
                decision TEXT NOT NULL,
                source TEXT NOT NULL,
                snippet_ids TEXT NOT NULL DEFAULT '[]',
                proposed_next_phase TEXT,
                context_fields TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_flow_traces_session ON flow_traces(session_id, turn_index);
        "#,
    },
    Migration {
        version: 3,
        name: "deepthink_jobs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS deepthink_jobs (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                due_at TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_deepthink_jobs_due ON deepthink_jobs(status, due_at);
            CREATE INDEX IF NOT EXISTS idx_deepthink_jobs_session ON deepthink_jobs(session_id);
        "#,
    },
];

/// Bring the schema up to date, then seed phase configuration.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;

    let applied = applied_version(conn).await?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        apply(conn, migration).await?;
    }

    let seeded = seed_phase_config(conn).await?;
    if seeded > 0 {
        tracing::info!(rows = seeded, "Seeded phase configuration");
    }
    let version = applied_version(conn).await?;
    tracing::debug!(version, "Schema up to date");
    Ok(())
}

/// Highest recorded version; 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("applied_version: {e}")))?;
    let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("applied_version: {e}")))?
    else {
        return Ok(0);
    };
    row.get(0)
        .map_err(|e| DatabaseError::Migration(format!("applied_version: {e}")))
}

/// Run one migration's SQL and record it as applied.
async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    tracing::info!(version = migration.version, name = migration.name, "Applying migration");
    let label = format!("V{} {}", migration.version, migration.name);
    conn.execute_batch(migration.sql)
        .await
        .map_err(|e| DatabaseError::Migration(format!("{label}: {e}")))?;
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("{label} not recorded: {e}")))?;
    Ok(())
}

/// Insert built-in rows for phases the table does not have yet. Existing
/// rows are left untouched so operator edits survive restarts.
async fn seed_phase_config(conn: &Connection) -> Result<u64, DatabaseError> {
    let table = PhaseTable::builtin();
    let mut inserted = 0;
    for cfg in table.enabled() {
        let row = PhaseConfigRow::from(cfg);
        let substate_order = serde_json::to_string(&row.substate_order)
            .map_err(|e| DatabaseError::Serialization(format!("substate_order: {e}")))?;
        inserted += conn
            .execute(
                "INSERT OR IGNORE INTO phase_config (phase, next_phase, min_readiness_to_advance, max_reprompts, allow_deepthink, substate_order, enabled) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                libsql::params![
                    row.phase.clone(),
                    match row.next_phase.clone() {
                        Some(n) => libsql::Value::Text(n),
                        None => libsql::Value::Null,
                    },
                    row.min_readiness_to_advance,
                    row.max_reprompts,
                    i64::from(row.allow_deepthink),
                    substate_order,
                    i64::from(row.enabled),
                ],
            )
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!("Failed to seed phase_config {}: {e}", row.phase))
            })?;
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap()
            .connect()
            .unwrap()
    }

    async fn count(conn: &Connection, sql: &str) -> i64 {
        let mut rows = conn.query(sql, ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get(0).unwrap()
    }

    #[tokio::test]
    async fn fresh_database_gets_every_table() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let tables = count(
            &conn,
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('_migrations', 'flow_sessions', 'phase_config', 'flow_snippets', 'flow_traces', 'deepthink_jobs')",
        )
        .await;
        assert_eq!(tables, 6);
    }

    #[tokio::test]
    async fn rerunning_is_a_no_op() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        assert_eq!(applied_version(&conn).await.unwrap(), 3);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM _migrations").await, 3);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM phase_config").await, 7);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn migration_future_can_cross_threads() {
        let conn = test_conn().await;
        let fut = run_migrations(&conn);
        assert_send(&fut);
        fut.await.unwrap();
        assert_eq!(applied_version(&conn).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn seeding_keeps_operator_edits() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute(
            "UPDATE phase_config SET min_readiness_to_advance = 0.9 WHERE phase = 'why'",
            (),
        )
        .await
        .unwrap();

        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query(
                "SELECT min_readiness_to_advance FROM phase_config WHERE phase = 'why'",
                (),
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let readiness: f64 = row.get(0).unwrap();
        assert!((readiness - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn message_row_is_terminal_with_substates() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query(
                "SELECT next_phase, allow_deepthink, substate_order FROM phase_config WHERE phase = 'message'",
                (),
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let next: Option<String> = row.get::<String>(0).ok();
        let allow: i64 = row.get(1).unwrap();
        let order: String = row.get(2).unwrap();
        assert!(next.is_none());
        assert_eq!(allow, 1);
        assert!(order.contains("co_author"));
    }
}
