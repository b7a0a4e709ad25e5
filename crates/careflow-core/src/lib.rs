//! # CareFlow Core
//!
//! Shared foundation for the CareFlow automation engine:
//! - Configuration (TOML, serde defaults, `~/.careflow/config.toml`)
//! - Error types used across all crates
//! - Domain events consumed from the appointment/encounter lifecycle

pub mod config;
pub mod error;
pub mod event;

pub use config::CareFlowConfig;
pub use error::{CareFlowError, Result};
pub use event::{DomainEvent, TriggerEvent};
