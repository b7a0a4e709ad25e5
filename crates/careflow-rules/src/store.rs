//! SQLite-backed Rule Store — validates, persists, and serves rules.
//!
//! Every `match_rules` call reads straight from SQLite, so a rule change
//! is visible to the very next match (zero staleness, well inside the
//! one-sweep-interval bound the dispatcher documents).

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use careflow_core::error::{CareFlowError, Result};
use careflow_core::event::TriggerEvent;

use crate::condition::{self, ConditionTest};
use crate::rule::{Action, Rule, RuleType};

/// Filter for listing rules (mirrors the configuration UI's query surface).
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub rule_type: Option<RuleType>,
    pub trigger_event: Option<TriggerEvent>,
    pub active_only: bool,
}

/// The Rule Store.
pub struct RuleStore {
    conn: Mutex<Connection>,
}

impl RuleStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| CareFlowError::Database(format!("rule store open: {e}")))?;
        // The engine db shares the file; wait out its write locks.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| CareFlowError::Database(e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CareFlowError::Database(format!("rule store open: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                rule_type TEXT NOT NULL,
                trigger_event TEXT NOT NULL,
                conditions TEXT NOT NULL,        -- JSON array of tests
                actions TEXT NOT NULL,           -- JSON array of actions
                priority INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                execution_count INTEGER NOT NULL DEFAULT 0,
                created_seq INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rules_match
                ON rules (org_id, trigger_event, is_active);
            ",
        )
        .map_err(|e| CareFlowError::Database(format!("rule store migration: {e}")))?;
        Ok(())
    }

    /// Validate and persist a new rule. Assigns id and created_seq.
    pub fn register(&self, mut rule: Rule) -> Result<Rule> {
        rule.validate()?;
        let conn = self.conn.lock().unwrap();

        rule.id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        rule.created_at = now;
        rule.updated_at = now;
        rule.execution_count = 0;
        rule.created_seq = conn
            .query_row("SELECT IFNULL(MAX(created_seq), 0) + 1 FROM rules", [], |r| {
                r.get(0)
            })
            .map_err(|e| CareFlowError::Database(format!("rule seq: {e}")))?;

        conn.execute(
            "INSERT INTO rules
             (id, org_id, name, description, rule_type, trigger_event, conditions, actions,
              priority, is_active, execution_count, created_seq, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            rusqlite::params![
                rule.id,
                rule.org_id,
                rule.name,
                rule.description,
                rule.rule_type.as_str(),
                rule.trigger_event.as_str(),
                serde_json::to_string(&rule.conditions)
                    .map_err(|e| CareFlowError::Database(e.to_string()))?,
                serde_json::to_string(&rule.actions)
                    .map_err(|e| CareFlowError::Database(e.to_string()))?,
                rule.priority,
                rule.is_active as i32,
                rule.execution_count as i64,
                rule.created_seq,
                rule.created_at.to_rfc3339(),
                rule.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| CareFlowError::Database(format!("register rule: {e}")))?;

        tracing::info!("📋 Rule registered: '{}' ({})", rule.name, rule.id);
        Ok(rule)
    }

    /// Validate and persist changes to an existing rule. Registration
    /// sequence, creation time, and execution count are preserved.
    pub fn update(&self, mut rule: Rule) -> Result<Rule> {
        rule.validate()?;
        let existing = self.get(&rule.id)?;
        rule.created_seq = existing.created_seq;
        rule.created_at = existing.created_at;
        rule.execution_count = existing.execution_count;
        rule.updated_at = Utc::now();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE rules SET org_id = ?2, name = ?3, description = ?4, rule_type = ?5,
             trigger_event = ?6, conditions = ?7, actions = ?8, priority = ?9,
             is_active = ?10, updated_at = ?11
             WHERE id = ?1",
            rusqlite::params![
                rule.id,
                rule.org_id,
                rule.name,
                rule.description,
                rule.rule_type.as_str(),
                rule.trigger_event.as_str(),
                serde_json::to_string(&rule.conditions)
                    .map_err(|e| CareFlowError::Database(e.to_string()))?,
                serde_json::to_string(&rule.actions)
                    .map_err(|e| CareFlowError::Database(e.to_string()))?,
                rule.priority,
                rule.is_active as i32,
                rule.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| CareFlowError::Database(format!("update rule: {e}")))?;
        Ok(rule)
    }

    /// Deactivate a rule. Deactivated rules never match; history stays.
    pub fn deactivate(&self, rule_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE rules SET is_active = 0, updated_at = ?2 WHERE id = ?1",
                rusqlite::params![rule_id, Utc::now().to_rfc3339()],
            )
            .map_err(|e| CareFlowError::Database(format!("deactivate rule: {e}")))?;
        if changed == 0 {
            return Err(CareFlowError::NotFound(format!("rule {rule_id}")));
        }
        tracing::info!("🚫 Rule deactivated: {}", rule_id);
        Ok(())
    }

    /// Fetch one rule by id.
    pub fn get(&self, rule_id: &str) -> Result<Rule> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("SELECT {COLUMNS} FROM rules WHERE id = ?1"))
            .map_err(|e| CareFlowError::Database(e.to_string()))?;
        let mut rows = stmt
            .query_map([rule_id], row_to_rule)
            .map_err(|e| CareFlowError::Database(e.to_string()))?;
        match rows.next() {
            Some(Ok(rule)) => Ok(rule),
            Some(Err(e)) => Err(CareFlowError::Database(e.to_string())),
            None => Err(CareFlowError::NotFound(format!("rule {rule_id}"))),
        }
    }

    /// List rules for an organization, optionally filtered.
    pub fn list(&self, org_id: &str, filter: &RuleFilter) -> Result<Vec<Rule>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!("SELECT {COLUMNS} FROM rules WHERE org_id = ?1");
        let mut params: Vec<String> = vec![org_id.to_string()];
        if let Some(rt) = filter.rule_type {
            sql.push_str(&format!(" AND rule_type = ?{}", params.len() + 1));
            params.push(rt.as_str().to_string());
        }
        if let Some(te) = &filter.trigger_event {
            sql.push_str(&format!(" AND trigger_event = ?{}", params.len() + 1));
            params.push(te.as_str().to_string());
        }
        if filter.active_only {
            sql.push_str(" AND is_active = 1");
        }
        sql.push_str(" ORDER BY priority ASC, created_seq ASC");

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| CareFlowError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), row_to_rule)
            .map_err(|e| CareFlowError::Database(e.to_string()))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| CareFlowError::Database(e.to_string()))
    }

    /// Active rules for (org, trigger) whose conditions hold against the
    /// subject attributes. Absent attributes fail closed. Ordered by
    /// (priority asc, created_seq asc) — deterministic for identical input.
    pub fn match_rules(
        &self,
        org_id: &str,
        trigger_event: &TriggerEvent,
        attributes: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<Rule>> {
        let candidates = self.list(
            org_id,
            &RuleFilter {
                trigger_event: Some(trigger_event.clone()),
                active_only: true,
                ..Default::default()
            },
        )?;
        Ok(candidates
            .into_iter()
            .filter(|rule| condition::matches_all(&rule.conditions, attributes))
            .collect())
    }

    /// Increment a rule's successful-firing counter. Engine-owned; called
    /// by the executor on success only.
    pub fn record_success(&self, rule_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE rules SET execution_count = execution_count + 1 WHERE id = ?1",
            [rule_id],
        )
        .map_err(|e| CareFlowError::Database(format!("record success: {e}")))?;
        Ok(())
    }
}

const COLUMNS: &str = "id, org_id, name, description, rule_type, trigger_event, conditions, \
                       actions, priority, is_active, execution_count, created_seq, created_at, \
                       updated_at";

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Rule> {
    let rule_type_str: String = row.get(4)?;
    let trigger_str: String = row.get(5)?;
    let conditions_str: String = row.get(6)?;
    let actions_str: String = row.get(7)?;
    let created_at_str: String = row.get(12)?;
    let updated_at_str: String = row.get(13)?;

    let conditions: Vec<ConditionTest> = serde_json::from_str(&conditions_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let actions: Vec<Action> = serde_json::from_str(&actions_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let rule_type: RuleType = rule_type_str.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("bad rule_type `{rule_type_str}`").into(),
        )
    })?;

    Ok(Rule {
        id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        rule_type,
        trigger_event: TriggerEvent::from(trigger_str),
        conditions,
        actions,
        priority: row.get(8)?,
        is_active: row.get::<_, i32>(9)? != 0,
        execution_count: row.get::<_, i64>(10)? as u64,
        created_seq: row.get(11)?,
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts(&updated_at_str),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
