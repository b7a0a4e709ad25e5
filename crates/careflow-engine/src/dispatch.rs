//! Trigger Dispatcher — turns one lifecycle event into pending executions.
//!
//! Per-subject operations are serialized through a subject-scoped async
//! lock, so two concurrent dispatches of the same occurrence cannot both
//! create a row for the same dedupe key. (The partial unique index in the
//! store backs this up across processes.)

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use careflow_core::error::{CareFlowError, Result};
use careflow_core::event::DomainEvent;
use careflow_rules::{Action, Rule, RuleStore};

use crate::executor::ActionExecutor;
use crate::pending::{ExecStatus, PendingExecution, SubjectContext};
use crate::persistence::EngineDb;

/// What one dispatch did.
#[derive(Debug, Default)]
pub struct DispatchSummary {
    /// New pending executions created.
    pub created: usize,
    /// Duplicate (rule, action, subject, occurrence) keys skipped.
    pub duplicates: usize,
    /// Actions skipped because they need an anchor the event lacks.
    pub skipped_missing_anchor: usize,
    /// Executions already due at dispatch time, handed straight to the
    /// executor. Await these to observe the immediate firings.
    pub immediate: Vec<JoinHandle<()>>,
}

/// Subject-scoped lock registry.
struct SubjectLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SubjectLocks {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, subject_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(subject_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Consumes lifecycle events, matches rules, schedules executions.
pub struct TriggerDispatcher {
    rules: Arc<RuleStore>,
    db: Arc<EngineDb>,
    executor: Arc<ActionExecutor>,
    locks: SubjectLocks,
}

impl TriggerDispatcher {
    pub fn new(rules: Arc<RuleStore>, db: Arc<EngineDb>, executor: Arc<ActionExecutor>) -> Self {
        Self {
            rules,
            db,
            executor,
            locks: SubjectLocks::new(),
        }
    }

    /// Dispatch one event for an organization.
    ///
    /// A failing action (missing anchor, duplicate) never aborts the rest
    /// of the dispatch — failures stay local to one (rule, action) pair.
    pub async fn dispatch(&self, org_id: &str, event: &DomainEvent) -> Result<DispatchSummary> {
        let _guard = self.locks.acquire(&event.subject_id).await;

        let matched =
            self.rules
                .match_rules(org_id, &event.trigger_event, &event.attributes)?;
        tracing::debug!(
            "⚡ Event {}/{} for {} matched {} rule(s)",
            event.trigger_event,
            event.occurrence_id,
            event.subject_id,
            matched.len()
        );

        let mut summary = DispatchSummary::default();
        let context = SubjectContext::from_event(event, org_id);

        for rule in &matched {
            // Actions fire in (action priority, definition order).
            let mut ordered: Vec<(usize, &Action)> = rule.actions.iter().enumerate().collect();
            ordered.sort_by_key(|(index, action)| (action.priority, *index));

            for (action_index, action) in ordered {
                let fire_at = match compute_fire_at(action, event, &rule.id, action_index) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(
                            "⏭️ Skipping rule '{}' action #{action_index}: {e}",
                            rule.name
                        );
                        summary.skipped_missing_anchor += 1;
                        continue;
                    }
                };

                let exec = build_execution(rule, action_index, action, &context, fire_at);
                let exec_id = exec.id.clone();
                if !self.db.insert_pending(&exec)? {
                    tracing::debug!(
                        "↩️ Duplicate dispatch for rule {} action #{action_index}, occurrence {} — no-op",
                        rule.id,
                        event.occurrence_id
                    );
                    summary.duplicates += 1;
                    continue;
                }
                summary.created += 1;

                // Already due: claim and hand to the executor right away.
                if fire_at <= Utc::now() && self.db.claim(&exec_id)? {
                    let mut claimed = exec;
                    claimed.status = ExecStatus::Claimed;
                    summary.immediate.push(self.executor.submit(claimed).await);
                }
            }
        }
        Ok(summary)
    }
}

/// Resolve an action's fire time against the event.
fn compute_fire_at(
    action: &Action,
    event: &DomainEvent,
    rule_id: &str,
    action_index: usize,
) -> Result<DateTime<Utc>> {
    if action.delay_minutes >= 0 {
        Ok(event.event_time + Duration::minutes(action.delay_minutes))
    } else {
        match event.anchor_time {
            Some(anchor) => Ok(anchor + Duration::minutes(action.delay_minutes)),
            None => Err(CareFlowError::MissingAnchor {
                rule_id: rule_id.to_string(),
                action_index,
            }),
        }
    }
}

fn build_execution(
    rule: &Rule,
    action_index: usize,
    action: &Action,
    context: &SubjectContext,
    fire_at: DateTime<Utc>,
) -> PendingExecution {
    let now = Utc::now();
    PendingExecution {
        id: Uuid::new_v4().to_string(),
        rule_id: rule.id.clone(),
        action_index,
        subject_id: context.subject_id.clone(),
        occurrence_id: context.occurrence_id.clone(),
        org_id: context.org_id.clone(),
        action: action.clone(),
        context: context.clone(),
        scheduled_fire_at: fire_at,
        status: ExecStatus::Pending,
        attempt_count: 0,
        rule_priority: rule.priority,
        action_priority: action.priority,
        created_seq: 0, // assigned by the store
        delay_minutes: action.delay_minutes,
        anchor_relative: action.delay_minutes < 0,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ActionHandler, ExecutorPolicy, HandlerOutcome, HandlerRegistry};
    use async_trait::async_trait;
    use careflow_core::event::TriggerEvent;
    use careflow_rules::{ActionConfig, RuleType};
    use std::time::Duration as StdDuration;

    struct OkHandler;

    #[async_trait]
    impl ActionHandler for OkHandler {
        async fn execute(
            &self,
            _: &ActionConfig,
            _: &crate::pending::SubjectContext,
        ) -> HandlerOutcome {
            HandlerOutcome::Success { detail: None }
        }
    }

    fn quick_policy() -> ExecutorPolicy {
        ExecutorPolicy {
            max_attempts: 3,
            handler_timeout: StdDuration::from_millis(200),
            backoff_base: StdDuration::from_millis(1),
        }
    }

    fn setup() -> (TriggerDispatcher, Arc<EngineDb>, Arc<RuleStore>) {
        let db = Arc::new(EngineDb::in_memory().unwrap());
        let rules = Arc::new(RuleStore::in_memory().unwrap());
        let mut registry = HandlerRegistry::new();
        registry.register_for_all(Arc::new(OkHandler));
        let executor = Arc::new(ActionExecutor::new(
            db.clone(),
            rules.clone(),
            registry,
            quick_policy(),
            2,
        ));
        (
            TriggerDispatcher::new(rules.clone(), db.clone(), executor),
            db,
            rules,
        )
    }

    fn reminder(delay_minutes: i64) -> Action {
        Action::new(ActionConfig::SendReminder {
            channels: vec!["sms".into()],
            template: "visit_reminder".into(),
            message: None,
        })
        .with_delay_minutes(delay_minutes)
    }

    fn future_event(occurrence: &str) -> DomainEvent {
        DomainEvent::new(
            "appt-1",
            "appointment",
            TriggerEvent::Created,
            Utc::now(),
            occurrence,
        )
    }

    #[tokio::test]
    async fn test_positive_delay_arithmetic() {
        let (dispatcher, db, rules) = setup();
        rules
            .register(
                Rule::new(
                    "org-1",
                    "week out",
                    RuleType::Reminder,
                    TriggerEvent::Created,
                    vec![reminder(10080)],
                ),
            )
            .unwrap();

        let mut event = future_event("occ-1");
        event.event_time = "2024-01-01T00:00:00Z".parse().unwrap();
        let summary = dispatcher.dispatch("org-1", &event).await.unwrap();
        assert_eq!(summary.created, 1);

        let rows = db.live_for_subject("appt-1").unwrap();
        let expected: DateTime<Utc> = "2024-01-08T00:00:00Z".parse().unwrap();
        assert_eq!(rows[0].scheduled_fire_at, expected);
    }

    #[tokio::test]
    async fn test_negative_delay_uses_anchor() {
        let (dispatcher, db, rules) = setup();
        rules
            .register(Rule::new(
                "org-1",
                "2h before",
                RuleType::Reminder,
                TriggerEvent::Created,
                vec![reminder(-120)],
            ))
            .unwrap();

        let anchor: DateTime<Utc> = "2024-01-01T10:00:00Z".parse().unwrap();
        let event = future_event("occ-1").with_anchor(anchor);
        let summary = dispatcher.dispatch("org-1", &event).await.unwrap();
        assert_eq!(summary.created, 1);

        let rows = db.live_for_subject("appt-1").unwrap();
        let expected: DateTime<Utc> = "2024-01-01T08:00:00Z".parse().unwrap();
        assert_eq!(rows[0].scheduled_fire_at, expected);
        assert!(rows[0].anchor_relative);
    }

    #[tokio::test]
    async fn test_missing_anchor_skips_only_that_action() {
        let (dispatcher, db, rules) = setup();
        rules
            .register(Rule::new(
                "org-1",
                "mixed delays",
                RuleType::Reminder,
                TriggerEvent::Created,
                vec![reminder(-120), reminder(10080)],
            ))
            .unwrap();

        // No anchor on the event: the negative-delay action is skipped,
        // the positive-delay sibling still schedules.
        let summary = dispatcher
            .dispatch("org-1", &future_event("occ-1"))
            .await
            .unwrap();
        assert_eq!(summary.skipped_missing_anchor, 1);
        assert_eq!(summary.created, 1);
        assert_eq!(db.live_for_subject("appt-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_occurrence_is_idempotent() {
        let (dispatcher, db, rules) = setup();
        rules
            .register(Rule::new(
                "org-1",
                "r",
                RuleType::Reminder,
                TriggerEvent::Created,
                vec![reminder(60)],
            ))
            .unwrap();

        let event = future_event("occ-1");
        let first = dispatcher.dispatch("org-1", &event).await.unwrap();
        let second = dispatcher.dispatch("org-1", &event).await.unwrap();
        assert_eq!(first.created, 1);
        assert_eq!(second.created, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(db.live_for_subject("appt-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_due_now_fires_immediately() {
        let (dispatcher, db, rules) = setup();
        let rule = rules
            .register(Rule::new(
                "org-1",
                "immediate",
                RuleType::Notification,
                TriggerEvent::Created,
                vec![reminder(0)],
            ))
            .unwrap();

        let mut event = future_event("occ-1");
        event.event_time = Utc::now() - Duration::minutes(1);
        let summary = dispatcher.dispatch("org-1", &event).await.unwrap();
        assert_eq!(summary.immediate.len(), 1);
        for handle in summary.immediate {
            handle.await.unwrap();
        }

        let rows = db
            .records_for_subject("appt-1", None, None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rules.get(&rule.id).unwrap().execution_count, 1);
    }

    #[tokio::test]
    async fn test_unmatched_event_creates_nothing() {
        let (dispatcher, db, rules) = setup();
        rules
            .register(Rule::new(
                "org-1",
                "on completed",
                RuleType::Reminder,
                TriggerEvent::Completed,
                vec![reminder(60)],
            ))
            .unwrap();

        let summary = dispatcher
            .dispatch("org-1", &future_event("occ-1"))
            .await
            .unwrap();
        assert_eq!(summary.created, 0);
        assert!(db.live_for_subject("appt-1").unwrap().is_empty());
    }
}
