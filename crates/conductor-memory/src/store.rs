use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::{ExecutionStore, MetricsStore};
use conductor_core::types::{
    ExecutionProgress, ExecutionRecord, ExecutionStatus, PerformanceMetrics, PerformanceRecord,
    SelectionDecision,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS performance (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        agent_id TEXT NOT NULL,
        workflow_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        success INTEGER NOT NULL,
        quality_score REAL NOT NULL,
        error_count INTEGER NOT NULL,
        user_satisfaction REAL,
        recorded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_performance_scope
        ON performance(agent_id, workflow_id, step_id, id);

    CREATE INDEX IF NOT EXISTS idx_performance_recent
        ON performance(agent_id, recorded_at);

    CREATE TABLE IF NOT EXISTS active_executions (
        agent_id TEXT NOT NULL,
        execution_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        started_at TEXT NOT NULL,
        PRIMARY KEY (agent_id, execution_id, step_id)
    );

    CREATE TABLE IF NOT EXISTS selection_decisions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        execution_id TEXT,
        workflow_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        strategy TEXT NOT NULL,
        chosen_agents TEXT NOT NULL,
        candidates TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS executions (
        execution_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        progress TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status, updated_at);";

/// Fixed-width UTC timestamps so text comparison matches time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn db_err(e: rusqlite::Error) -> ConductorError {
    ConductorError::Database(e.to_string())
}

/// SQLite-backed telemetry and execution store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    ///
    /// Running marks left by a previous process are cleared.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConductorError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        let stale = conn
            .execute("DELETE FROM active_executions", [])
            .map_err(db_err)?;
        if stale > 0 {
            warn!(count = stale, "Cleared stale running marks");
        }

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ConductorError::Database(e.to_string()))
    }

    /// Most recent selection decisions for a step, newest first.
    pub fn recent_selections(&self, step_id: &str, limit: usize) -> Result<Vec<SelectionDecision>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT execution_id, workflow_id, step_id, strategy, chosen_agents, candidates, timestamp
                 FROM selection_decisions
                 WHERE step_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![step_id, limit as i64], |row| {
                let chosen: String = row.get(4)?;
                let candidates: String = row.get(5)?;
                let timestamp: String = row.get(6)?;
                Ok(SelectionDecision {
                    execution_id: row.get(0)?,
                    workflow_id: row.get(1)?,
                    step_id: row.get(2)?,
                    strategy: row.get(3)?,
                    chosen_agents: serde_json::from_str(&chosen).unwrap_or_default(),
                    candidates: serde_json::from_str(&candidates).unwrap_or_default(),
                    timestamp: parse_ts(&timestamp),
                })
            })
            .map_err(db_err)?;

        let mut decisions = Vec::new();
        for row in rows {
            decisions.push(row.map_err(db_err)?);
        }
        Ok(decisions)
    }
}

fn read_record(
    execution_id: String,
    status: String,
    progress: String,
    updated_at: String,
) -> Result<ExecutionRecord> {
    let status = ExecutionStatus::parse(&status).ok_or_else(|| {
        ConductorError::Database(format!("unknown execution status '{}'", status))
    })?;
    let progress: ExecutionProgress = serde_json::from_str(&progress)?;
    Ok(ExecutionRecord {
        execution_id,
        status,
        progress,
        updated_at: parse_ts(&updated_at),
    })
}

impl MetricsStore for SqliteStore {
    fn record_performance(
        &self,
        agent_id: &str,
        step_id: &str,
        workflow_id: &str,
        metrics: &PerformanceMetrics,
    ) -> BoxFuture<'_, Result<()>> {
        let (agent_id, step_id, workflow_id) =
            (agent_id.to_string(), step_id.to_string(), workflow_id.to_string());
        let m = metrics.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO performance
                    (agent_id, workflow_id, step_id, duration_ms, success, quality_score,
                     error_count, user_satisfaction, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    agent_id,
                    workflow_id,
                    step_id,
                    m.duration_ms as i64,
                    m.success,
                    m.quality_score,
                    m.error_count,
                    m.user_satisfaction,
                    ts(Utc::now()),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn query_recent_performance(
        &self,
        agent_id: &str,
        workflow_id: &str,
        step_id: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<PerformanceRecord>>> {
        let (agent_id, workflow_id, step_id) =
            (agent_id.to_string(), workflow_id.to_string(), step_id.to_string());

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT agent_id, workflow_id, step_id, duration_ms, success, quality_score,
                            error_count, user_satisfaction, recorded_at
                     FROM performance
                     WHERE agent_id = ?1 AND workflow_id = ?2 AND step_id = ?3
                     ORDER BY id DESC
                     LIMIT ?4",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![agent_id, workflow_id, step_id, limit as i64], |row| {
                    let duration_ms: i64 = row.get(3)?;
                    let recorded_at: String = row.get(8)?;
                    Ok(PerformanceRecord {
                        agent_id: row.get(0)?,
                        workflow_id: row.get(1)?,
                        step_id: row.get(2)?,
                        metrics: PerformanceMetrics {
                            duration_ms: duration_ms.max(0) as u64,
                            success: row.get(4)?,
                            quality_score: row.get(5)?,
                            error_count: row.get(6)?,
                            user_satisfaction: row.get(7)?,
                        },
                        recorded_at: parse_ts(&recorded_at),
                    })
                })
                .map_err(db_err)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(db_err)?);
            }
            Ok(records)
        })
    }

    fn query_active_load(&self, agent_id: &str) -> BoxFuture<'_, Result<u32>> {
        let agent_id = agent_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM active_executions WHERE agent_id = ?1",
                    params![agent_id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(count.max(0) as u32)
        })
    }

    fn success_rate_since(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<f64>>> {
        let agent_id = agent_id.to_string();
        let since = ts(since);
        Box::pin(async move {
            let conn = self.lock()?;
            let (total, successes): (i64, Option<i64>) = conn
                .query_row(
                    "SELECT COUNT(*), SUM(success) FROM performance
                     WHERE agent_id = ?1 AND recorded_at >= ?2",
                    params![agent_id, since],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(db_err)?;
            if total == 0 {
                return Ok(None);
            }
            Ok(Some(successes.unwrap_or(0) as f64 / total as f64))
        })
    }

    fn begin_execution(
        &self,
        agent_id: &str,
        execution_id: &str,
        step_id: &str,
    ) -> BoxFuture<'_, Result<()>> {
        let (agent_id, execution_id, step_id) =
            (agent_id.to_string(), execution_id.to_string(), step_id.to_string());
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO active_executions (agent_id, execution_id, step_id, started_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![agent_id, execution_id, step_id, ts(Utc::now())],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn end_execution(
        &self,
        agent_id: &str,
        execution_id: &str,
        step_id: &str,
    ) -> BoxFuture<'_, Result<()>> {
        let (agent_id, execution_id, step_id) =
            (agent_id.to_string(), execution_id.to_string(), step_id.to_string());
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "DELETE FROM active_executions
                 WHERE agent_id = ?1 AND execution_id = ?2 AND step_id = ?3",
                params![agent_id, execution_id, step_id],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn record_selection(&self, decision: &SelectionDecision) -> BoxFuture<'_, Result<()>> {
        let decision = decision.clone();
        Box::pin(async move {
            let chosen = serde_json::to_string(&decision.chosen_agents)?;
            let candidates = serde_json::to_string(&decision.candidates)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO selection_decisions
                    (execution_id, workflow_id, step_id, strategy, chosen_agents, candidates, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    decision.execution_id,
                    decision.workflow_id,
                    decision.step_id,
                    decision.strategy,
                    chosen,
                    candidates,
                    ts(decision.timestamp),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }
}

impl ExecutionStore for SqliteStore {
    fn persist_execution_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        progress: &ExecutionProgress,
    ) -> BoxFuture<'_, Result<()>> {
        let execution_id = execution_id.to_string();
        let workflow_id = progress.workflow_id.clone();
        let progress = serde_json::to_string(progress);

        Box::pin(async move {
            let progress = progress?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO executions (execution_id, workflow_id, status, progress, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(execution_id) DO UPDATE SET
                    status = excluded.status,
                    progress = excluded.progress,
                    updated_at = excluded.updated_at",
                params![execution_id, workflow_id, status.as_str(), progress, ts(Utc::now())],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_execution(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let row = conn
                .query_row(
                    "SELECT execution_id, status, progress, updated_at
                     FROM executions WHERE execution_id = ?1",
                    params![execution_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(db_err)?;
            match row {
                Some((id, status, progress, updated_at)) => {
                    Ok(Some(read_record(id, status, progress, updated_at)?))
                }
                None => Ok(None),
            }
        })
    }

    fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT execution_id, status, progress, updated_at
                     FROM executions
                     WHERE ?1 IS NULL OR status = ?1
                     ORDER BY updated_at DESC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![status.map(|s| s.as_str())], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })
                .map_err(db_err)?;

            let mut records = Vec::new();
            for row in rows {
                let (id, status, progress, updated_at) = row.map_err(db_err)?;
                records.push(read_record(id, status, progress, updated_at)?);
            }
            Ok(records)
        })
    }
}
