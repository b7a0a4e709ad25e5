//! Execution audit records — one immutable entry per firing attempt.
//!
//! Compliance tooling reads these; nothing in the engine ever updates or
//! deletes one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single firing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecOutcome {
    /// Handler succeeded.
    Success,
    /// Handler failed transiently (or timed out); a retry was scheduled.
    RetryableFailure,
    /// Handler signalled an unrecoverable error, or retries were exhausted.
    Failed,
}

impl ExecOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure => "retryable_failure",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "retryable_failure" => Self::RetryableFailure,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for ExecOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Rowid, assigned by the store.
    pub id: i64,
    pub execution_id: String,
    pub rule_id: String,
    pub action_index: usize,
    pub subject_id: String,
    /// 1-based attempt number this record describes.
    pub attempt: u32,
    pub outcome: ExecOutcome,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}
