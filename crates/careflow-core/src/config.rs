//! CareFlow configuration system.
//!
//! TOML file with serde defaults for every field, so a partial (or missing)
//! config still yields a working engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CareFlowError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CareFlowConfig {
    /// Path to the engine SQLite database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// How often the delay scheduler sweeps for due executions (seconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Maximum firing attempts per execution before it is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base retry backoff (seconds). Doubles per attempt, with jitter.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
    /// Size of the bounded handler worker pool.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Per-invocation handler timeout (seconds). Timeouts count as
    /// retryable failures.
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
    /// Optional built-in webhook handler target.
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    /// Optional symptom mapping file for the triage matcher.
    #[serde(default)]
    pub triage_mappings_path: Option<PathBuf>,
}

/// Target for the built-in webhook action handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

fn default_db_path() -> PathBuf {
    CareFlowConfig::home_dir().join("engine.db")
}
fn default_sweep_interval() -> u64 {
    5
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff() -> u64 {
    60
}
fn default_worker_count() -> usize {
    4
}
fn default_handler_timeout() -> u64 {
    30
}

impl Default for CareFlowConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            sweep_interval_secs: default_sweep_interval(),
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff(),
            worker_count: default_worker_count(),
            handler_timeout_secs: default_handler_timeout(),
            webhook: None,
            triage_mappings_path: None,
        }
    }
}

impl CareFlowConfig {
    /// Conventional data directory (~/.careflow).
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".careflow")
    }

    /// Default config file location (~/.careflow/config.toml).
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Load from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| CareFlowError::Config(format!("{}: {e}", path.display())))
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}
