//! CareFlow CLI — run the engine daemon, inspect rules, ingest events,
//! query the audit trail, and rank triage keywords.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use careflow_core::event::DomainEvent;
use careflow_core::{CareFlowConfig, TriggerEvent};
use careflow_engine::{
    spawn_sweeper, ActionExecutor, DelayScheduler, EngineDb, ExecutorPolicy, HandlerRegistry,
    LogHandler, TriggerDispatcher, WebhookHandler,
};
use careflow_rules::{RuleFilter, RuleStore, RuleType};
use careflow_triage::{mapping, SymptomIndex};

#[derive(Parser)]
#[command(name = "careflow", about = "Appointment automation rule engine")]
struct Cli {
    /// Config file path (defaults to ~/.careflow/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine daemon (sweep loop + executor).
    Run,
    /// List rules for an organization.
    Rules {
        #[arg(long)]
        org: String,
        /// Filter by trigger event (created, confirmed, completed, ...).
        #[arg(long)]
        trigger: Option<String>,
        /// Filter by rule type (reminder, alert, ...).
        #[arg(long = "type")]
        rule_type: Option<String>,
        /// Only active rules.
        #[arg(long)]
        active: bool,
    },
    /// Dispatch one domain event from a JSON file.
    Ingest {
        #[arg(long)]
        org: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Query execution records for a subject.
    Audit {
        #[arg(long)]
        subject: String,
        /// Inclusive RFC 3339 lower bound.
        #[arg(long)]
        from: Option<String>,
        /// Inclusive RFC 3339 upper bound.
        #[arg(long)]
        to: Option<String>,
    },
    /// Rank appointment purposes for a set of symptom keywords.
    Triage {
        /// Comma-separated keywords, e.g. "fever,cough".
        #[arg(long)]
        keywords: String,
        #[arg(long)]
        org: Option<String>,
        /// Mapping file (overrides the config's triage_mappings_path).
        #[arg(long)]
        mappings: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CareFlowConfig::load(path)?,
        None => CareFlowConfig::load_or_default()?,
    };

    match cli.command {
        Command::Run => run_daemon(&config).await,
        Command::Rules {
            org,
            trigger,
            rule_type,
            active,
        } => {
            let rules = RuleStore::open(&config.db_path)?;
            let filter = RuleFilter {
                rule_type: rule_type
                    .as_deref()
                    .map(str::parse::<RuleType>)
                    .transpose()?,
                trigger_event: trigger.map(TriggerEvent::from),
                active_only: active,
            };
            for rule in rules.list(&org, &filter)? {
                println!("{}", serde_json::to_string_pretty(&rule)?);
            }
            Ok(())
        }
        Command::Ingest { org, file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let event: DomainEvent = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", file.display()))?;

            let (dispatcher, _scheduler) = build_pipeline(&config)?;
            let summary = dispatcher.dispatch(&org, &event).await?;
            println!(
                "created={} duplicates={} skipped_missing_anchor={} immediate={}",
                summary.created,
                summary.duplicates,
                summary.skipped_missing_anchor,
                summary.immediate.len()
            );
            for handle in summary.immediate {
                handle.await?;
            }
            Ok(())
        }
        Command::Audit { subject, from, to } => {
            let db = EngineDb::open(&config.db_path)?;
            let from = from.as_deref().map(parse_rfc3339).transpose()?;
            let to = to.as_deref().map(parse_rfc3339).transpose()?;
            for record in db.records_for_subject(&subject, from, to)? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
        Command::Triage {
            keywords,
            org,
            mappings,
        } => {
            let path = mappings
                .or_else(|| config.triage_mappings_path.clone())
                .context("no mapping file: pass --mappings or set triage_mappings_path")?;
            let index = SymptomIndex::new(mapping::load_mappings(&path)?);
            let input: Vec<&str> = keywords.split(',').map(str::trim).collect();
            for suggestion in index.match_keywords(&input, org.as_deref()) {
                println!("{}", serde_json::to_string(&suggestion)?);
            }
            Ok(())
        }
    }
}

async fn run_daemon(config: &CareFlowConfig) -> anyhow::Result<()> {
    let (_dispatcher, scheduler) = build_pipeline(config)?;
    tracing::info!(
        "🚀 CareFlow engine up — db {}, {} pending execution(s)",
        config.db_path.display(),
        scheduler.pending_count()?
    );

    tokio::select! {
        _ = spawn_sweeper(scheduler.clone(), config.sweep_interval_secs) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("👋 Shutting down");
        }
    }
    Ok(())
}

fn build_pipeline(
    config: &CareFlowConfig,
) -> anyhow::Result<(TriggerDispatcher, Arc<DelayScheduler>)> {
    let rules = Arc::new(RuleStore::open(&config.db_path)?);
    let db = Arc::new(EngineDb::open(&config.db_path)?);

    let mut registry = HandlerRegistry::new();
    match &config.webhook {
        Some(webhook) => {
            registry.register_for_all(Arc::new(WebhookHandler::from_config(webhook)));
        }
        None => {
            tracing::warn!("⚠️ No webhook configured — actions run through the dry-run logger");
            registry.register_for_all(Arc::new(LogHandler));
        }
    }

    let executor = Arc::new(ActionExecutor::new(
        db.clone(),
        rules.clone(),
        registry,
        ExecutorPolicy::from_config(config),
        config.worker_count,
    ));
    let dispatcher = TriggerDispatcher::new(rules, db.clone(), executor.clone());
    let scheduler = Arc::new(DelayScheduler::new(db, executor));
    Ok((dispatcher, scheduler))
}

fn parse_rfc3339(s: &str) -> anyhow::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&chrono::Utc))
        .with_context(|| format!("invalid RFC 3339 timestamp: {s}"))
}
