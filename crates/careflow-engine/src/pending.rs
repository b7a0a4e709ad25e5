//! Pending executions — the durable unit of scheduled work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use careflow_core::error::{CareFlowError, Result};
use careflow_core::event::DomainEvent;
use careflow_rules::Action;

/// Execution status.
///
/// ```text
/// pending ──► claimed ──► fired
///    │           │  ╰───► failed
///    │           ╰──────► pending   (retry re-enqueue)
///    ╰─────────► cancelled
/// ```
/// `fired`, `failed`, and `cancelled` are terminal. A claimed execution
/// can not be cancelled — the in-flight attempt resolves first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Pending,
    Claimed,
    Fired,
    Failed,
    Cancelled,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Fired => "fired",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "claimed" => Self::Claimed,
            "fired" => Self::Fired,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fired | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows `from -> to`.
    pub fn can_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Pending, Self::Claimed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Claimed, Self::Fired)
                | (Self::Claimed, Self::Failed)
                | (Self::Claimed, Self::Pending)
        )
    }

    /// Validate a transition, producing the typed error on violation.
    pub fn check_transition(from: Self, to: Self) -> Result<()> {
        if Self::can_transition(from, to) {
            Ok(())
        } else {
            Err(CareFlowError::InvalidStateTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything an action handler needs to know about the subject, captured
/// at dispatch time so firing never depends on re-reading the event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectContext {
    pub subject_id: String,
    pub subject_type: String,
    pub org_id: String,
    pub occurrence_id: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub event_time: DateTime<Utc>,
    #[serde(default)]
    pub anchor_time: Option<DateTime<Utc>>,
}

impl SubjectContext {
    pub fn from_event(event: &DomainEvent, org_id: &str) -> Self {
        Self {
            subject_id: event.subject_id.clone(),
            subject_type: event.subject_type.clone(),
            org_id: org_id.to_string(),
            occurrence_id: event.occurrence_id.clone(),
            attributes: event.attributes.clone(),
            event_time: event.event_time,
            anchor_time: event.anchor_time,
        }
    }
}

/// A scheduled, not-yet-resolved instance of one rule-action pair for one
/// subject. Born at dispatch, dies in a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingExecution {
    pub id: String,
    pub rule_id: String,
    pub action_index: usize,
    pub subject_id: String,
    pub occurrence_id: String,
    pub org_id: String,
    /// Snapshot of the action at dispatch time.
    pub action: Action,
    /// Snapshot of the subject context at dispatch time.
    pub context: SubjectContext,
    pub scheduled_fire_at: DateTime<Utc>,
    pub status: ExecStatus,
    pub attempt_count: u32,
    /// Denormalized ordering keys — same-instant executions fire in
    /// (rule priority, action priority, creation order).
    pub rule_priority: i32,
    pub action_priority: i32,
    pub created_seq: i64,
    /// Kept for anchor rescheduling: negative delays are recomputed when
    /// the anchor moves while the row is still pending.
    pub delay_minutes: i64,
    pub anchor_relative: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use ExecStatus::*;
        assert!(ExecStatus::can_transition(Pending, Claimed));
        assert!(ExecStatus::can_transition(Pending, Cancelled));
        assert!(ExecStatus::can_transition(Claimed, Fired));
        assert!(ExecStatus::can_transition(Claimed, Failed));
        assert!(ExecStatus::can_transition(Claimed, Pending)); // retry

        // Claimed work may not be cancelled mid-flight.
        assert!(!ExecStatus::can_transition(Claimed, Cancelled));
        // Terminal states absorb.
        for terminal in [Fired, Failed, Cancelled] {
            for to in [Pending, Claimed, Fired, Failed, Cancelled] {
                assert!(!ExecStatus::can_transition(terminal, to));
            }
        }
    }

    #[test]
    fn test_check_transition_error() {
        let err = ExecStatus::check_transition(ExecStatus::Claimed, ExecStatus::Cancelled)
            .unwrap_err();
        assert!(err.to_string().contains("claimed"));
        assert!(err.to_string().contains("cancelled"));
    }
}
