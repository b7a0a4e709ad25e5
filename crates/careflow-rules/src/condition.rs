//! Condition predicates — a conjunction of attribute tests over the subject.
//!
//! Evaluation is fail-closed: a test whose field is absent from the
//! subject attributes makes the whole rule not match.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single attribute test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionTest {
    /// Attribute name looked up in the event's subject attributes.
    pub field: String,
    #[serde(flatten)]
    pub op: ConditionOp,
}

/// Supported test operators. Untagged: the JSON shape is
/// `{"field": "purpose", "equals": "sick-visit"}` or
/// `{"field": "urgency", "one_of": ["urgent", "emergency"]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionOp {
    /// Attribute equals the given value.
    Equals { equals: Value },
    /// Attribute is a member of the given set.
    In { one_of: Vec<Value> },
}

impl ConditionTest {
    pub fn equals(field: &str, value: Value) -> Self {
        Self {
            field: field.to_string(),
            op: ConditionOp::Equals { equals: value },
        }
    }

    pub fn one_of(field: &str, values: Vec<Value>) -> Self {
        Self {
            field: field.to_string(),
            op: ConditionOp::In { one_of: values },
        }
    }

    /// Evaluate against subject attributes. Absent field ⇒ false.
    pub fn evaluate(&self, attributes: &serde_json::Map<String, Value>) -> bool {
        let Some(actual) = attributes.get(&self.field) else {
            return false;
        };
        match &self.op {
            ConditionOp::Equals { equals } => actual == equals,
            ConditionOp::In { one_of } => one_of.contains(actual),
        }
    }
}

/// Evaluate a conjunction. Empty condition list matches everything.
pub fn matches_all(tests: &[ConditionTest], attributes: &serde_json::Map<String, Value>) -> bool {
    tests.iter().all(|t| t.evaluate(attributes))
}
