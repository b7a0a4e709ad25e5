//! # CareFlow Engine
//!
//! The automation pipeline: lifecycle events fan out to delayed, durable,
//! retried action executions with an append-only audit trail.
//!
//! ## Architecture
//! ```text
//! DomainEvent (appointment lifecycle, external)
//!   → TriggerDispatcher
//!       ├── RuleStore.match_rules (priority asc, creation order)
//!       ├── fire time: event_time + delay, or anchor_time + delay (< 0)
//!       └── PendingExecution rows (idempotent on rule/action/subject/occurrence)
//!   → DelayScheduler (periodic sweep)
//!       ├── claim due rows: atomic pending → claimed
//!       ├── cancel_subject / reschedule_anchor
//!       └── hands claims to the executor in deterministic order
//!   → ActionExecutor (bounded worker pool)
//!       ├── HandlerRegistry: action_type → external handler
//!       ├── timeout + retries with backoff, then terminal failure
//!       └── ExecutionRecord per attempt (append-only)
//! ```
//!
//! Every scheduled action is a durable SQLite row — after a crash the
//! sweep re-derives its queue from rows with `status = pending`.

pub mod audit;
pub mod dispatch;
pub mod executor;
pub mod handlers;
pub mod pending;
pub mod persistence;
pub mod scheduler;

pub use audit::{ExecOutcome, ExecutionRecord};
pub use dispatch::{DispatchSummary, TriggerDispatcher};
pub use executor::{ActionExecutor, ActionHandler, ExecutorPolicy, HandlerOutcome, HandlerRegistry};
pub use handlers::{LogHandler, WebhookHandler};
pub use pending::{ExecStatus, PendingExecution, SubjectContext};
pub use persistence::EngineDb;
pub use scheduler::{spawn_sweeper, DelayScheduler};
