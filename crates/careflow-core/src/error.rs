//! Error types shared across CareFlow crates.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CareFlowError>;

/// All errors the engine can surface.
#[derive(Debug, Error)]
pub enum CareFlowError {
    /// A rule or action failed validation at write time. Names the offending
    /// field so the configuration UI can highlight it.
    #[error("validation failed for `{field}`: {message}")]
    Validation { field: String, message: String },

    /// An action with a negative delay was dispatched for an event that
    /// carries no anchor time. Local to one (rule, action) pair.
    #[error("rule {rule_id} action #{action_index} needs an anchor time but the event has none")]
    MissingAnchor { rule_id: String, action_index: usize },

    /// A status change was attempted that the execution state machine does
    /// not allow (e.g. cancelling a claimed execution).
    #[error("illegal execution transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("config error: {0}")]
    Config(String),

    /// Failure reported while invoking an external action handler.
    #[error("handler error: {0}")]
    Handler(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CareFlowError {
    /// Shorthand for a validation failure on a named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_names_field() {
        let err = CareFlowError::validation("actions[0].form_code", "must not be empty");
        assert!(err.to_string().contains("actions[0].form_code"));
    }
}
