//! # CareFlow Triage
//!
//! Symptom-to-purpose keyword matcher. Called directly by the intake
//! workflow — it does not participate in the dispatch pipeline.
//!
//! ## How it works
//! ```text
//! Patient: "fever and a bad cough since yesterday"
//!   ↓ intake extracts keywords
//! SymptomIndex.match_keywords(["fever", "cough"])
//!   ↓ case-insensitive set/substring intersection
//! Ranked purposes: sick-visit (2 hits, 0.85) > telehealth (1 hit, 0.95)
//! ```
//!
//! Ranking is intersection count first, configured confidence second — a
//! mapping never outranks another on confidence alone.

pub mod mapping;
pub mod matcher;

pub use mapping::{SymptomMapping, Urgency};
pub use matcher::{PurposeSuggestion, SymptomIndex};
