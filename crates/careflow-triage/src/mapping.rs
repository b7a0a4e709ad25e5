//! Symptom mapping definitions — configuration-owned, read-only here.

use std::path::Path;

use serde::{Deserialize, Serialize};

use careflow_core::error::{CareFlowError, Result};

/// How soon the suggested purpose should be seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Routine,
    Urgent,
    Emergency,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Routine => write!(f, "routine"),
            Self::Urgent => write!(f, "urgent"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// A keyword-to-purpose suggestion rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymptomMapping {
    pub keywords: Vec<String>,
    /// Configured confidence, 0–1.
    pub confidence: f64,
    pub urgency: Urgency,
    /// E.g. "today", "within_24h".
    #[serde(default)]
    pub timeframe: Option<String>,
    /// Appointment purpose this mapping suggests.
    #[serde(default)]
    pub purpose: Option<String>,
    /// Organization scope; None = global.
    #[serde(default)]
    pub org_id: Option<String>,
}

/// Load mappings from a JSON file (an array of mappings).
pub fn load_mappings(path: &Path) -> Result<Vec<SymptomMapping>> {
    let raw = std::fs::read_to_string(path)?;
    let mappings: Vec<SymptomMapping> = serde_json::from_str(&raw)
        .map_err(|e| CareFlowError::Config(format!("{}: {e}", path.display())))?;
    tracing::debug!("💾 Loaded {} symptom mappings", mappings.len());
    Ok(mappings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_json_shape() {
        let json = r#"{
            "keywords": ["fever", "cough", "flu"],
            "confidence": 0.85,
            "urgency": "urgent",
            "timeframe": "within_24h",
            "purpose": "sick-visit"
        }"#;
        let mapping: SymptomMapping = serde_json::from_str(json).unwrap();
        assert_eq!(mapping.keywords.len(), 3);
        assert_eq!(mapping.urgency, Urgency::Urgent);
        assert!(mapping.org_id.is_none());
    }
}
