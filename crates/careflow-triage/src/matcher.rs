//! Keyword matching and ranking.

use crate::mapping::{SymptomMapping, Urgency};

/// A ranked match for a set of input keywords.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PurposeSuggestion {
    pub purpose: Option<String>,
    /// Number of mapping keywords the input intersected.
    pub matched_keywords: usize,
    pub confidence: f64,
    pub urgency: Urgency,
    pub timeframe: Option<String>,
}

/// An immutable, queryable set of symptom mappings.
pub struct SymptomIndex {
    mappings: Vec<SymptomMapping>,
}

impl SymptomIndex {
    pub fn new(mappings: Vec<SymptomMapping>) -> Self {
        Self { mappings }
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Rank mappings against the input keywords.
    ///
    /// A mapping keyword counts as intersecting when any input keyword
    /// equals it or either contains the other, case-insensitively. A
    /// mapping with zero intersecting keywords is never returned —
    /// confidence is never inferred from nothing.
    ///
    /// Ranking: intersection count descending, then configured confidence
    /// descending. Stable for identical inputs.
    pub fn match_keywords(&self, input: &[&str], org_id: Option<&str>) -> Vec<PurposeSuggestion> {
        let input_lower: Vec<String> = input.iter().map(|k| k.trim().to_lowercase()).collect();

        let mut suggestions: Vec<PurposeSuggestion> = self
            .mappings
            .iter()
            .filter(|m| match (&m.org_id, org_id) {
                (Some(scope), Some(org)) => scope == org,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .filter_map(|m| {
                let matched = m
                    .keywords
                    .iter()
                    .filter(|kw| {
                        let kw = kw.to_lowercase();
                        input_lower
                            .iter()
                            .any(|inp| !inp.is_empty() && (inp == &kw || kw.contains(inp.as_str()) || inp.contains(kw.as_str())))
                    })
                    .count();
                if matched == 0 {
                    return None;
                }
                Some(PurposeSuggestion {
                    purpose: m.purpose.clone(),
                    matched_keywords: matched,
                    confidence: m.confidence,
                    urgency: m.urgency,
                    timeframe: m.timeframe.clone(),
                })
            })
            .collect();

        suggestions.sort_by(|a, b| {
            b.matched_keywords
                .cmp(&a.matched_keywords)
                .then(b.confidence.total_cmp(&a.confidence))
        });
        suggestions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(keywords: &[&str], confidence: f64, purpose: &str) -> SymptomMapping {
        SymptomMapping {
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            confidence,
            urgency: Urgency::Urgent,
            timeframe: None,
            purpose: Some(purpose.to_string()),
            org_id: None,
        }
    }

    #[test]
    fn test_intersection_count_beats_confidence() {
        // Two intersecting keywords beat one, despite lower confidence.
        let index = SymptomIndex::new(vec![
            mapping(&["fever", "cough", "flu"], 0.85, "sick-visit"),
            mapping(&["cough"], 0.95, "telehealth"),
        ]);
        let ranked = index.match_keywords(&["fever", "cough"], None);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].purpose.as_deref(), Some("sick-visit"));
        assert_eq!(ranked[0].matched_keywords, 2);
        assert_eq!(ranked[1].purpose.as_deref(), Some("telehealth"));
    }

    #[test]
    fn test_zero_intersection_is_excluded() {
        let index = SymptomIndex::new(vec![mapping(&["rash", "itching"], 0.9, "dermatology")]);
        assert!(index.match_keywords(&["fever"], None).is_empty());
        assert!(index.match_keywords(&[], None).is_empty());
    }

    #[test]
    fn test_case_insensitive_and_substring() {
        let index = SymptomIndex::new(vec![mapping(
            &["sore throat", "not feeling well"],
            0.8,
            "sick-visit",
        )]);
        // Exact match, different case.
        assert_eq!(index.match_keywords(&["Sore Throat"], None).len(), 1);
        // Input keyword is a substring of the mapping keyword.
        assert_eq!(index.match_keywords(&["throat"], None).len(), 1);
    }

    #[test]
    fn test_confidence_breaks_ties() {
        let index = SymptomIndex::new(vec![
            mapping(&["headache"], 0.6, "low"),
            mapping(&["headache"], 0.9, "high"),
        ]);
        let ranked = index.match_keywords(&["headache"], None);
        assert_eq!(ranked[0].purpose.as_deref(), Some("high"));
    }

    #[test]
    fn test_org_scoping() {
        let mut scoped = mapping(&["fever"], 0.9, "org-visit");
        scoped.org_id = Some("org-1".into());
        let index = SymptomIndex::new(vec![scoped, mapping(&["fever"], 0.5, "global-visit")]);

        assert_eq!(index.match_keywords(&["fever"], Some("org-1")).len(), 2);
        assert_eq!(index.match_keywords(&["fever"], Some("org-2")).len(), 1);
        assert_eq!(index.match_keywords(&["fever"], None).len(), 1);
    }
}
