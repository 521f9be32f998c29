//! Filter-group wire format.
//!
//! ```json
//! {"type": "AND", "groups": [
//!   {"type": "OR", "conditions": [
//!     {"field": "email", "operation": "endsWith", "value": "@example.com"},
//!     {"field": "tags", "operation": "contains", "value": ["<tag-id>"]}
//!   ]}
//! ]}
//! ```
//!
//! Operations are kept as raw strings here so that an unknown operation surfaces as a
//! [`crate::SegmentError`] from [`crate::compile`] instead of a deserialization failure.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupOperator {
    And,
    Or,
}

/// Top-level segment document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroups {
    #[serde(rename = "type")]
    pub operator: GroupOperator,
    #[serde(default)]
    pub groups: Vec<FilterGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    #[serde(rename = "type")]
    pub operator: GroupOperator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operation: String,
    pub value: JsonValue,
}

impl FilterGroups {
    pub fn new(operator: GroupOperator, groups: Vec<FilterGroup>) -> Self {
        Self { operator, groups }
    }

    /// A single AND group: every condition must hold.
    pub fn all_of(conditions: Vec<Condition>) -> Self {
        Self::new(GroupOperator::And, vec![FilterGroup::new(GroupOperator::And, conditions)])
    }

    /// A single OR group: any condition may hold.
    pub fn any_of(conditions: Vec<Condition>) -> Self {
        Self::new(GroupOperator::And, vec![FilterGroup::new(GroupOperator::Or, conditions)])
    }

    /// A document without groups (matches every contact).
    pub fn everyone() -> Self {
        Self::new(GroupOperator::And, Vec::new())
    }
}

impl FilterGroup {
    pub fn new(operator: GroupOperator, conditions: Vec<Condition>) -> Self {
        Self { operator, conditions }
    }
}

impl Condition {
    pub fn new(field: impl Into<String>, operation: impl Into<String>, value: JsonValue) -> Self {
        Self {
            field: field.into(),
            operation: operation.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_document() {
        let doc: FilterGroups = serde_json::from_value(serde_json::json!({
            "type": "OR",
            "groups": [
                {"type": "AND", "conditions": [
                    {"field": "email", "operation": "endsWith", "value": "@example.com"}
                ]},
                {"type": "OR", "conditions": []}
            ]
        }))
        .unwrap();

        assert_eq!(doc.operator, GroupOperator::Or);
        assert_eq!(doc.groups.len(), 2);
        assert_eq!(doc.groups[0].conditions[0].operation, "endsWith");
        assert!(doc.groups[1].conditions.is_empty());
    }

    #[test]
    fn missing_groups_default_to_empty() {
        let doc: FilterGroups = serde_json::from_value(serde_json::json!({"type": "AND"})).unwrap();
        assert_eq!(doc, FilterGroups::everyone());
    }

    #[test]
    fn serializes_operator_as_type() {
        let value = serde_json::to_value(FilterGroup::new(GroupOperator::Or, vec![])).unwrap();
        assert_eq!(value["type"], "OR");
    }
}
