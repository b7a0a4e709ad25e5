//! Rule and action definitions — the configuration the engine executes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use careflow_core::error::{CareFlowError, Result};
use careflow_core::event::TriggerEvent;

use crate::condition::ConditionTest;

/// What kind of automation a rule drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    TaskAssignment,
    Alert,
    CdsHook,
    MedicationAssignment,
    Reminder,
    Notification,
    WorkflowAutomation,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskAssignment => "task_assignment",
            Self::Alert => "alert",
            Self::CdsHook => "cds_hook",
            Self::MedicationAssignment => "medication_assignment",
            Self::Reminder => "reminder",
            Self::Notification => "notification",
            Self::WorkflowAutomation => "workflow_automation",
        }
    }
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RuleType {
    type Err = CareFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "task_assignment" => Ok(Self::TaskAssignment),
            "alert" => Ok(Self::Alert),
            "cds_hook" => Ok(Self::CdsHook),
            "medication_assignment" => Ok(Self::MedicationAssignment),
            "reminder" => Ok(Self::Reminder),
            "notification" => Ok(Self::Notification),
            "workflow_automation" => Ok(Self::WorkflowAutomation),
            other => Err(CareFlowError::validation(
                "rule_type",
                format!("unknown rule type `{other}`"),
            )),
        }
    }
}

/// The closed set of action kinds the executor can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SendForm,
    SendReminder,
    OrderLab,
    ScheduleFollowup,
    VerifyReferral,
    RequestMedicalRecords,
    NotifyStaff,
    UpdateImmunizationRecord,
    AttachLabResults,
}

impl ActionType {
    /// Every dispatchable action type, in declaration order.
    pub const ALL: [ActionType; 9] = [
        Self::SendForm,
        Self::SendReminder,
        Self::OrderLab,
        Self::ScheduleFollowup,
        Self::VerifyReferral,
        Self::RequestMedicalRecords,
        Self::NotifyStaff,
        Self::UpdateImmunizationRecord,
        Self::AttachLabResults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendForm => "send_form",
            Self::SendReminder => "send_reminder",
            Self::OrderLab => "order_lab",
            Self::ScheduleFollowup => "schedule_followup",
            Self::VerifyReferral => "verify_referral",
            Self::RequestMedicalRecords => "request_medical_records",
            Self::NotifyStaff => "notify_staff",
            Self::UpdateImmunizationRecord => "update_immunization_record",
            Self::AttachLabResults => "attach_lab_results",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed action payload — the discriminated union keyed by `action_type`.
///
/// A payload that does not conform to its variant's shape is rejected when
/// the rule is written, so the executor never sees a malformed config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", content = "action_config", rename_all = "snake_case")]
pub enum ActionConfig {
    SendForm {
        form_code: String,
        #[serde(default)]
        required: bool,
        #[serde(default)]
        send_immediately: bool,
    },
    SendReminder {
        channels: Vec<String>,
        template: String,
        #[serde(default)]
        message: Option<String>,
    },
    OrderLab {
        lab_tests: Vec<String>,
        #[serde(default)]
        timing: Option<String>,
        #[serde(default)]
        instructions: Option<String>,
    },
    ScheduleFollowup {
        days: u32,
        purpose: String,
        #[serde(default)]
        auto_suggest: bool,
        #[serde(default)]
        message: Option<String>,
    },
    VerifyReferral {
        #[serde(default)]
        required: bool,
        #[serde(default)]
        check_authorization: bool,
    },
    RequestMedicalRecords {
        from_provider: String,
        documents: Vec<String>,
    },
    NotifyStaff {
        notification_type: String,
        message: String,
    },
    UpdateImmunizationRecord {
        #[serde(default)]
        auto_update: bool,
        #[serde(default)]
        send_to_registry: bool,
    },
    AttachLabResults {
        #[serde(default)]
        auto_attach: bool,
        #[serde(default)]
        notify_if_abnormal: bool,
    },
}

impl ActionConfig {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::SendForm { .. } => ActionType::SendForm,
            Self::SendReminder { .. } => ActionType::SendReminder,
            Self::OrderLab { .. } => ActionType::OrderLab,
            Self::ScheduleFollowup { .. } => ActionType::ScheduleFollowup,
            Self::VerifyReferral { .. } => ActionType::VerifyReferral,
            Self::RequestMedicalRecords { .. } => ActionType::RequestMedicalRecords,
            Self::NotifyStaff { .. } => ActionType::NotifyStaff,
            Self::UpdateImmunizationRecord { .. } => ActionType::UpdateImmunizationRecord,
            Self::AttachLabResults { .. } => ActionType::AttachLabResults,
        }
    }

    /// Parse an (action_type, opaque config) pair as delivered by the
    /// configuration UI. Errors name the offending field.
    pub fn parse(action_type: &str, config: &serde_json::Value) -> Result<Self> {
        let tagged = serde_json::json!({
            "action_type": action_type,
            "action_config": config,
        });
        serde_json::from_value(tagged).map_err(|e| {
            CareFlowError::validation(format!("action_config({action_type})"), e.to_string())
        })
    }

    /// Semantic checks beyond shape. `path` prefixes field names in errors
    /// (e.g. "actions[2]").
    fn validate(&self, path: &str) -> Result<()> {
        match self {
            Self::SendForm { form_code, .. } if form_code.is_empty() => Err(
                CareFlowError::validation(format!("{path}.form_code"), "must not be empty"),
            ),
            Self::SendReminder { channels, .. } if channels.is_empty() => Err(
                CareFlowError::validation(format!("{path}.channels"), "at least one channel"),
            ),
            Self::OrderLab { lab_tests, .. } if lab_tests.is_empty() => Err(
                CareFlowError::validation(format!("{path}.lab_tests"), "at least one test"),
            ),
            Self::ScheduleFollowup { days: 0, .. } => Err(CareFlowError::validation(
                format!("{path}.days"),
                "must be at least 1",
            )),
            Self::RequestMedicalRecords { documents, .. } if documents.is_empty() => Err(
                CareFlowError::validation(format!("{path}.documents"), "at least one document"),
            ),
            Self::NotifyStaff { message, .. } if message.is_empty() => Err(
                CareFlowError::validation(format!("{path}.message"), "must not be empty"),
            ),
            _ => Ok(()),
        }
    }
}

/// One action a rule fires. A rule carries one or more.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(flatten)]
    pub config: ActionConfig,
    /// Tie-break among actions of the same rule (lower fires first).
    #[serde(default)]
    pub priority: i32,
    /// >= 0: minutes after the event time. < 0: minutes before the anchor
    /// time (e.g. "-120" = 2 hours before the appointment).
    #[serde(default)]
    pub delay_minutes: i64,
}

impl Action {
    pub fn new(config: ActionConfig) -> Self {
        Self {
            config,
            priority: 0,
            delay_minutes: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay_minutes(mut self, delay_minutes: i64) -> Self {
        self.delay_minutes = delay_minutes;
        self
    }

    pub fn action_type(&self) -> ActionType {
        self.config.action_type()
    }
}

/// An automation rule: when `trigger_event` fires for a matching subject in
/// `org_id`, the actions are scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub org_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub rule_type: RuleType,
    pub trigger_event: TriggerEvent,
    /// Conjunction of attribute tests; empty matches every subject.
    #[serde(default)]
    pub conditions: Vec<ConditionTest>,
    pub actions: Vec<Action>,
    /// Lower value = higher precedence.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Successful firings. Owned by the engine, monotonic.
    #[serde(default)]
    pub execution_count: u64,
    /// Store-assigned registration sequence; the deterministic tie-break
    /// when two rules share a priority.
    #[serde(default)]
    pub created_seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl Rule {
    /// Create an unregistered rule. The store assigns id and created_seq.
    pub fn new(
        org_id: &str,
        name: &str,
        rule_type: RuleType,
        trigger_event: TriggerEvent,
        actions: Vec<Action>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            org_id: org_id.to_string(),
            name: name.to_string(),
            description: String::new(),
            rule_type,
            trigger_event,
            conditions: Vec::new(),
            actions,
            priority: 0,
            is_active: true,
            execution_count: 0,
            created_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_conditions(mut self, conditions: Vec<ConditionTest>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Write-time validation. Called by the store on register/update.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CareFlowError::validation("name", "must not be empty"));
        }
        if self.org_id.is_empty() {
            return Err(CareFlowError::validation("org_id", "must not be empty"));
        }
        if self.actions.is_empty() {
            return Err(CareFlowError::validation(
                "actions",
                "a rule needs at least one action",
            ));
        }
        for (i, test) in self.conditions.iter().enumerate() {
            if test.field.is_empty() {
                return Err(CareFlowError::validation(
                    format!("conditions[{i}].field"),
                    "must not be empty",
                ));
            }
        }
        for (i, action) in self.actions.iter().enumerate() {
            action.config.validate(&format!("actions[{i}]"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reminder_action() -> Action {
        Action::new(ActionConfig::SendReminder {
            channels: vec!["sms".into()],
            template: "sick_visit_reminder".into(),
            message: None,
        })
    }

    #[test]
    fn test_parse_opaque_config() {
        let cfg = ActionConfig::parse(
            "send_form",
            &json!({"form_code": "health-history-update", "required": true}),
        )
        .unwrap();
        assert_eq!(cfg.action_type(), ActionType::SendForm);
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let err = ActionConfig::parse("launch_rocket", &json!({})).unwrap_err();
        assert!(err.to_string().contains("launch_rocket"));
    }

    #[test]
    fn test_parse_rejects_missing_field() {
        // send_reminder requires `template`
        let err = ActionConfig::parse("send_reminder", &json!({"channels": ["sms"]})).unwrap_err();
        assert!(matches!(
            err,
            careflow_core::CareFlowError::Validation { .. }
        ));
    }

    #[test]
    fn test_rule_validation_names_field() {
        let mut rule = Rule::new(
            "org-1",
            "empty form code",
            RuleType::Reminder,
            TriggerEvent::Created,
            vec![Action::new(ActionConfig::SendForm {
                form_code: String::new(),
                required: false,
                send_immediately: false,
            })],
        );
        let err = rule.validate().unwrap_err();
        assert!(err.to_string().contains("actions[0].form_code"));

        rule.actions = vec![];
        let err = rule.validate().unwrap_err();
        assert!(err.to_string().contains("actions"));
    }

    #[test]
    fn test_no_actions_rejected() {
        let rule = Rule::new(
            "org-1",
            "no actions",
            RuleType::Alert,
            TriggerEvent::Created,
            vec![],
        );
        assert!(rule.validate().is_err());
        let rule = Rule::new(
            "org-1",
            "ok",
            RuleType::Reminder,
            TriggerEvent::Created,
            vec![reminder_action()],
        );
        assert!(rule.validate().is_ok());
    }
}
