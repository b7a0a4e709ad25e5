//! Action Executor — invokes external handlers, manages retries, writes
//! the audit trail.
//!
//! Handlers run in a bounded worker pool with a per-invocation timeout,
//! so a stalled external service can hold at most `worker_count` slots
//! for at most the timeout. Permits are acquired in `submit` call order
//! (the semaphore is FIFO), which is what makes same-instant firing
//! order deterministic and testable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use careflow_core::CareFlowConfig;
use careflow_rules::{ActionConfig, ActionType, RuleStore};

use crate::audit::ExecOutcome;
use crate::pending::{ExecStatus, PendingExecution, SubjectContext};
use crate::persistence::EngineDb;

/// What a handler reports back for one invocation.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Success { detail: Option<String> },
    /// Transient — worth retrying with backoff.
    RetryableFailure { detail: String },
    /// Unrecoverable — fail immediately, no retry.
    TerminalFailure { detail: String },
}

/// Contract implemented by external action services.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, config: &ActionConfig, context: &SubjectContext) -> HandlerOutcome;
}

/// Dispatch table: action type → handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ActionType, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action_type: ActionType, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type, handler);
    }

    /// Register one handler for every action type (e.g. a webhook fan-out
    /// or a dry-run logger).
    pub fn register_for_all(&mut self, handler: Arc<dyn ActionHandler>) {
        for action_type in ActionType::ALL {
            self.handlers.insert(action_type, handler.clone());
        }
    }

    pub fn get(&self, action_type: ActionType) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&action_type).cloned()
    }
}

/// Retry and timeout policy.
#[derive(Debug, Clone)]
pub struct ExecutorPolicy {
    pub max_attempts: u32,
    pub handler_timeout: Duration,
    /// Base backoff; doubles per attempt with ±20% jitter.
    pub backoff_base: Duration,
}

impl ExecutorPolicy {
    pub fn from_config(config: &CareFlowConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            handler_timeout: Duration::from_secs(config.handler_timeout_secs),
            backoff_base: Duration::from_secs(config.retry_backoff_secs),
        }
    }
}

impl Default for ExecutorPolicy {
    fn default() -> Self {
        Self::from_config(&CareFlowConfig::default())
    }
}

/// The executor. Shared behind an `Arc` by the dispatcher and scheduler.
pub struct ActionExecutor {
    db: Arc<EngineDb>,
    rules: Arc<RuleStore>,
    handlers: HandlerRegistry,
    policy: ExecutorPolicy,
    workers: Arc<Semaphore>,
}

impl ActionExecutor {
    pub fn new(
        db: Arc<EngineDb>,
        rules: Arc<RuleStore>,
        handlers: HandlerRegistry,
        policy: ExecutorPolicy,
        worker_count: usize,
    ) -> Self {
        Self {
            db,
            rules,
            handlers,
            policy,
            workers: Arc::new(Semaphore::new(worker_count.max(1))),
        }
    }

    /// Run one claimed execution on the worker pool.
    ///
    /// Acquires a permit before spawning, so callers submitting in order
    /// start invocations in order. The returned handle resolves when the
    /// attempt (including its bookkeeping) is done.
    pub async fn submit(self: &Arc<Self>, exec: PendingExecution) -> JoinHandle<()> {
        let permit = match self.workers.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                // Semaphore closed — only possible during shutdown.
                tracing::warn!("⚠️ Worker pool closed; dropping execution {}", exec.id);
                return tokio::spawn(async {});
            }
        };
        let executor = self.clone();
        tokio::spawn(async move {
            executor.run_one(exec).await;
            drop(permit);
        })
    }

    async fn run_one(&self, exec: PendingExecution) {
        let attempt = exec.attempt_count + 1;
        let action_type = exec.action.action_type();

        let outcome = match self.handlers.get(action_type) {
            Some(handler) => {
                match tokio::time::timeout(
                    self.policy.handler_timeout,
                    handler.execute(&exec.action.config, &exec.context),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => HandlerOutcome::RetryableFailure {
                        detail: format!(
                            "handler timed out after {}s",
                            self.policy.handler_timeout.as_secs()
                        ),
                    },
                }
            }
            None => HandlerOutcome::TerminalFailure {
                detail: format!("no handler registered for {action_type}"),
            },
        };

        // Failures are local to this (rule, action, subject) — bookkeeping
        // errors are logged, never propagated into sibling executions.
        if let Err(e) = self.settle(&exec, attempt, outcome).await {
            tracing::error!("❌ Failed to settle execution {}: {e}", exec.id);
        }
    }

    async fn settle(
        &self,
        exec: &PendingExecution,
        attempt: u32,
        outcome: HandlerOutcome,
    ) -> careflow_core::Result<()> {
        match outcome {
            HandlerOutcome::Success { detail } => {
                self.db
                    .append_record(exec, attempt, ExecOutcome::Success, detail.as_deref())?;
                self.db.set_attempt_count(&exec.id, attempt)?;
                self.db
                    .transition(&exec.id, ExecStatus::Claimed, ExecStatus::Fired)?;
                self.rules.record_success(&exec.rule_id)?;
                tracing::info!(
                    "✅ Fired {} for subject {} (attempt {attempt})",
                    exec.action.action_type(),
                    exec.subject_id
                );
            }
            HandlerOutcome::RetryableFailure { detail } => {
                if attempt < self.policy.max_attempts {
                    self.db.append_record(
                        exec,
                        attempt,
                        ExecOutcome::RetryableFailure,
                        Some(&detail),
                    )?;
                    let next = Utc::now() + self.backoff_after(attempt);
                    self.db.requeue_retry(&exec.id, attempt, next)?;
                    tracing::warn!(
                        "🔁 Retry {}/{} scheduled for {}: {detail}",
                        attempt,
                        self.policy.max_attempts,
                        exec.id
                    );
                } else {
                    self.db
                        .append_record(exec, attempt, ExecOutcome::Failed, Some(&detail))?;
                    self.db.set_attempt_count(&exec.id, attempt)?;
                    self.db
                        .transition(&exec.id, ExecStatus::Claimed, ExecStatus::Failed)?;
                    tracing::warn!(
                        "❌ Execution {} failed after {attempt} attempts: {detail}",
                        exec.id
                    );
                }
            }
            HandlerOutcome::TerminalFailure { detail } => {
                self.db
                    .append_record(exec, attempt, ExecOutcome::Failed, Some(&detail))?;
                self.db.set_attempt_count(&exec.id, attempt)?;
                self.db
                    .transition(&exec.id, ExecStatus::Claimed, ExecStatus::Failed)?;
                tracing::warn!("❌ Execution {} failed terminally: {detail}", exec.id);
            }
        }
        Ok(())
    }

    /// Exponential backoff with ±20% jitter.
    fn backoff_after(&self, attempt: u32) -> chrono::Duration {
        let base = self.policy.backoff_base.as_secs_f64();
        let exp = base * 2f64.powi(attempt.saturating_sub(1) as i32);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        chrono::Duration::milliseconds((exp * jitter * 1000.0) as i64)
    }
}
