//! SQLite persistence for pending executions and audit records.
//!
//! Claiming is an atomic compare-and-swap on `status` — an UPDATE guarded
//! by the expected current value — so concurrent sweepers (or a sweep
//! racing a cancellation) resolve to exactly one winner.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use careflow_core::error::{CareFlowError, Result};

use crate::audit::{ExecOutcome, ExecutionRecord};
use crate::pending::{ExecStatus, PendingExecution, SubjectContext};

/// Engine database: pending executions + execution records.
pub struct EngineDb {
    conn: Mutex<Connection>,
}

impl EngineDb {
    /// Open or create the engine database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| CareFlowError::Database(format!("engine db open: {e}")))?;
        // The rule store shares the file; wait out its write locks.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| CareFlowError::Database(e.to_string()))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CareFlowError::Database(format!("engine db open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS pending_executions (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                action_index INTEGER NOT NULL,
                subject_id TEXT NOT NULL,
                occurrence_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                action TEXT NOT NULL,            -- JSON snapshot
                context TEXT NOT NULL,           -- JSON snapshot
                scheduled_fire_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                rule_priority INTEGER NOT NULL DEFAULT 0,
                action_priority INTEGER NOT NULL DEFAULT 0,
                created_seq INTEGER NOT NULL,
                delay_minutes INTEGER NOT NULL DEFAULT 0,
                anchor_relative INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- The dedupe/idempotency key: at most one live execution per
            -- (rule, action, subject, occurrence).
            CREATE UNIQUE INDEX IF NOT EXISTS idx_exec_dedupe
                ON pending_executions (rule_id, action_index, subject_id, occurrence_id)
                WHERE status IN ('pending', 'claimed');

            CREATE INDEX IF NOT EXISTS idx_exec_due
                ON pending_executions (status, scheduled_fire_at);
            CREATE INDEX IF NOT EXISTS idx_exec_subject
                ON pending_executions (subject_id, status);

            CREATE TABLE IF NOT EXISTS execution_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                action_index INTEGER NOT NULL,
                subject_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_subject
                ON execution_records (subject_id, recorded_at);
            ",
        )
        .map_err(|e| CareFlowError::Database(format!("engine migration: {e}")))?;
        Ok(())
    }

    // ─── Pending executions ──────────────────────────────────

    /// Insert a pending execution. Returns false when a live row already
    /// holds the dedupe key (idempotent no-op for duplicate dispatch).
    pub fn insert_pending(&self, exec: &PendingExecution) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let created_seq: i64 = conn
            .query_row(
                "SELECT IFNULL(MAX(created_seq), 0) + 1 FROM pending_executions",
                [],
                |r| r.get(0),
            )
            .map_err(|e| CareFlowError::Database(format!("exec seq: {e}")))?;

        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO pending_executions
                 (id, rule_id, action_index, subject_id, occurrence_id, org_id, action, context,
                  scheduled_fire_at, status, attempt_count, rule_priority, action_priority,
                  created_seq, delay_minutes, anchor_relative, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                rusqlite::params![
                    exec.id,
                    exec.rule_id,
                    exec.action_index as i64,
                    exec.subject_id,
                    exec.occurrence_id,
                    exec.org_id,
                    serde_json::to_string(&exec.action)
                        .map_err(|e| CareFlowError::Database(e.to_string()))?,
                    serde_json::to_string(&exec.context)
                        .map_err(|e| CareFlowError::Database(e.to_string()))?,
                    exec.scheduled_fire_at.to_rfc3339(),
                    exec.status.as_str(),
                    exec.attempt_count,
                    exec.rule_priority,
                    exec.action_priority,
                    created_seq,
                    exec.delay_minutes,
                    exec.anchor_relative as i32,
                    exec.created_at.to_rfc3339(),
                    exec.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| CareFlowError::Database(format!("insert execution: {e}")))?;
        Ok(changed == 1)
    }

    /// Atomically claim one pending execution. Returns true iff this
    /// caller won the `pending -> claimed` transition.
    pub fn claim(&self, execution_id: &str) -> Result<bool> {
        self.cas_status(execution_id, ExecStatus::Pending, ExecStatus::Claimed)
    }

    /// Guarded status transition: succeeds only when the row is currently
    /// in `from`. Loses races loudly — the caller gets
    /// `InvalidStateTransition` carrying the actual current status.
    pub fn transition(&self, execution_id: &str, from: ExecStatus, to: ExecStatus) -> Result<()> {
        ExecStatus::check_transition(from, to)?;
        if self.cas_status(execution_id, from, to)? {
            return Ok(());
        }
        let actual = self.get(execution_id)?.status;
        Err(CareFlowError::InvalidStateTransition {
            from: actual.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }

    fn cas_status(&self, execution_id: &str, from: ExecStatus, to: ExecStatus) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE pending_executions SET status = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = ?2",
                rusqlite::params![
                    execution_id,
                    from.as_str(),
                    to.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| CareFlowError::Database(format!("status cas: {e}")))?;
        Ok(changed == 1)
    }

    /// Re-enqueue a claimed execution for retry with a new fire time and
    /// incremented attempt count.
    pub fn requeue_retry(
        &self,
        execution_id: &str,
        attempt_count: u32,
        next_fire_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE pending_executions
                 SET status = 'pending', attempt_count = ?2, scheduled_fire_at = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = 'claimed'",
                rusqlite::params![
                    execution_id,
                    attempt_count,
                    next_fire_at.to_rfc3339(),
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| CareFlowError::Database(format!("requeue: {e}")))?;
        if changed == 1 {
            Ok(())
        } else {
            let actual = self.get(execution_id)?.status;
            Err(CareFlowError::InvalidStateTransition {
                from: actual.as_str().to_string(),
                to: ExecStatus::Pending.as_str().to_string(),
            })
        }
    }

    /// Persist an updated attempt count (while claimed).
    pub fn set_attempt_count(&self, execution_id: &str, attempt_count: u32) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pending_executions SET attempt_count = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![execution_id, attempt_count, Utc::now().to_rfc3339()],
        )
        .map_err(|e| CareFlowError::Database(format!("attempt count: {e}")))?;
        Ok(())
    }

    /// Due pending executions, in deterministic firing order:
    /// (scheduled_fire_at, rule priority, action priority, creation order).
    pub fn due_pending(&self, now: DateTime<Utc>) -> Result<Vec<PendingExecution>> {
        self.select_executions(
            "WHERE status = 'pending' AND scheduled_fire_at <= ?1
             ORDER BY scheduled_fire_at ASC, rule_priority ASC, action_priority ASC, created_seq ASC",
            rusqlite::params![now.to_rfc3339()],
        )
    }

    /// All non-terminal rows for a subject (pending and claimed).
    pub fn live_for_subject(&self, subject_id: &str) -> Result<Vec<PendingExecution>> {
        self.select_executions(
            "WHERE subject_id = ?1 AND status IN ('pending', 'claimed')
             ORDER BY created_seq ASC",
            rusqlite::params![subject_id],
        )
    }

    /// Cancel every *pending* execution for a subject. Claimed rows can
    /// not be cancelled; they are returned so the caller can log the
    /// refused transitions. Returns (cancelled ids, refused claimed ids).
    pub fn cancel_subject(&self, subject_id: &str) -> Result<(Vec<String>, Vec<String>)> {
        let live = self.live_for_subject(subject_id)?;
        let mut cancelled = Vec::new();
        let mut refused = Vec::new();
        for exec in live {
            match exec.status {
                ExecStatus::Pending => {
                    if self.cas_status(&exec.id, ExecStatus::Pending, ExecStatus::Cancelled)? {
                        cancelled.push(exec.id);
                    } else {
                        // Lost a race to a concurrent claim.
                        refused.push(exec.id);
                    }
                }
                ExecStatus::Claimed => refused.push(exec.id),
                _ => {}
            }
        }
        Ok((cancelled, refused))
    }

    /// Recompute fire times for still-pending anchor-relative executions
    /// of a subject. Claimed and terminal rows are left untouched.
    /// Returns the ids that were rescheduled.
    pub fn reschedule_anchor(
        &self,
        subject_id: &str,
        new_anchor: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let pending = self.select_executions(
            "WHERE subject_id = ?1 AND status = 'pending' AND anchor_relative = 1",
            rusqlite::params![subject_id],
        )?;
        let mut rescheduled = Vec::new();
        let conn = self.conn.lock().unwrap();
        for exec in pending {
            let new_fire = new_anchor + chrono::Duration::minutes(exec.delay_minutes);
            let changed = conn
                .execute(
                    "UPDATE pending_executions
                     SET scheduled_fire_at = ?2, updated_at = ?3
                     WHERE id = ?1 AND status = 'pending'",
                    rusqlite::params![exec.id, new_fire.to_rfc3339(), Utc::now().to_rfc3339()],
                )
                .map_err(|e| CareFlowError::Database(format!("reschedule: {e}")))?;
            if changed == 1 {
                rescheduled.push(exec.id);
            }
        }
        Ok(rescheduled)
    }

    /// Fetch one execution.
    pub fn get(&self, execution_id: &str) -> Result<PendingExecution> {
        let mut rows =
            self.select_executions("WHERE id = ?1", rusqlite::params![execution_id])?;
        rows.pop()
            .ok_or_else(|| CareFlowError::NotFound(format!("execution {execution_id}")))
    }

    /// Count of pending rows — the sweep queue depth.
    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pending_executions WHERE status = 'pending'",
                [],
                |r| r.get(0),
            )
            .map_err(|e| CareFlowError::Database(e.to_string()))?;
        Ok(n as usize)
    }

    fn select_executions(
        &self,
        where_clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<PendingExecution>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, rule_id, action_index, subject_id, occurrence_id, org_id, action, context,
                    scheduled_fire_at, status, attempt_count, rule_priority, action_priority,
                    created_seq, delay_minutes, anchor_relative, created_at, updated_at
             FROM pending_executions {where_clause}"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| CareFlowError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params, row_to_execution)
            .map_err(|e| CareFlowError::Database(e.to_string()))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| CareFlowError::Database(e.to_string()))
    }

    // ─── Execution records ──────────────────────────────────

    /// Append an audit record for one firing attempt. Never updated.
    pub fn append_record(
        &self,
        exec: &PendingExecution,
        attempt: u32,
        outcome: ExecOutcome,
        detail: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO execution_records
             (execution_id, rule_id, action_index, subject_id, attempt, outcome, detail, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                exec.id,
                exec.rule_id,
                exec.action_index as i64,
                exec.subject_id,
                attempt,
                outcome.as_str(),
                detail,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| CareFlowError::Database(format!("append record: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Audit query: records for a subject within an inclusive date range,
    /// newest first.
    pub fn records_for_subject(
        &self,
        subject_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExecutionRecord>> {
        let from = from
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "0000-01-01T00:00:00Z".to_string());
        let to = to
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "9999-12-31T23:59:59Z".to_string());
        self.select_records(
            "WHERE subject_id = ?1 AND recorded_at >= ?2 AND recorded_at <= ?3
             ORDER BY recorded_at DESC, id DESC",
            rusqlite::params![subject_id, from, to],
        )
    }

    /// Audit query: the attempt history of one execution, oldest first.
    pub fn records_for_execution(&self, execution_id: &str) -> Result<Vec<ExecutionRecord>> {
        self.select_records(
            "WHERE execution_id = ?1 ORDER BY attempt ASC",
            rusqlite::params![execution_id],
        )
    }

    fn select_records(
        &self,
        where_clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, execution_id, rule_id, action_index, subject_id, attempt, outcome,
                    detail, recorded_at
             FROM execution_records {where_clause}"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| CareFlowError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params, |row| {
                let outcome_str: String = row.get(6)?;
                let recorded_at_str: String = row.get(8)?;
                Ok(ExecutionRecord {
                    id: row.get(0)?,
                    execution_id: row.get(1)?,
                    rule_id: row.get(2)?,
                    action_index: row.get::<_, i64>(3)? as usize,
                    subject_id: row.get(4)?,
                    attempt: row.get(5)?,
                    outcome: ExecOutcome::from_str(&outcome_str),
                    detail: row.get(7)?,
                    recorded_at: parse_ts(&recorded_at_str),
                })
            })
            .map_err(|e| CareFlowError::Database(e.to_string()))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| CareFlowError::Database(e.to_string()))
    }
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingExecution> {
    let action_str: String = row.get(6)?;
    let context_str: String = row.get(7)?;
    let fire_at_str: String = row.get(8)?;
    let status_str: String = row.get(9)?;
    let created_at_str: String = row.get(16)?;
    let updated_at_str: String = row.get(17)?;

    let action = serde_json::from_str(&action_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let context: SubjectContext = serde_json::from_str(&context_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(PendingExecution {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        action_index: row.get::<_, i64>(2)? as usize,
        subject_id: row.get(3)?,
        occurrence_id: row.get(4)?,
        org_id: row.get(5)?,
        action,
        context,
        scheduled_fire_at: parse_ts(&fire_at_str),
        status: ExecStatus::from_str(&status_str),
        attempt_count: row.get(10)?,
        rule_priority: row.get(11)?,
        action_priority: row.get(12)?,
        created_seq: row.get(13)?,
        delay_minutes: row.get(14)?,
        anchor_relative: row.get::<_, i32>(15)? != 0,
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts(&updated_at_str),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
