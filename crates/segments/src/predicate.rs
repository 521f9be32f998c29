//! Compiled segment predicates.

use std::collections::BTreeSet;

use mailpulse_core::{Contact, TagId};
use serde_json::Value as JsonValue;

use crate::filter::{Condition, FilterGroup, FilterGroups, GroupOperator};
use crate::SegmentError;

/// String-valued contact field a condition can target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextField {
    Email,
    FirstName,
    LastName,
    /// `attributes.<key>`
    Attribute(String),
}

impl TextField {
    fn parse(field: &str) -> Option<Self> {
        match field {
            "email" => Some(Self::Email),
            "firstName" => Some(Self::FirstName),
            "lastName" => Some(Self::LastName),
            other => other
                .strip_prefix("attributes.")
                .filter(|key| !key.is_empty())
                .map(|key| Self::Attribute(key.to_string())),
        }
    }

    /// Value of this field on `contact`; `None` when the contact leaves it unset.
    pub fn value_of<'a>(&self, contact: &'a Contact) -> Option<&'a str> {
        match self {
            TextField::Email => Some(contact.email.as_str()),
            TextField::FirstName => contact.first_name.as_deref(),
            TextField::LastName => contact.last_name.as_deref(),
            TextField::Attribute(key) => contact.attributes.get(key).map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    Eq,
    StartsWith,
    EndsWith,
    /// Byte-wise `>=`.
    Gte,
    /// Byte-wise `<=`.
    Lte,
}

impl StringOp {
    fn parse(operation: &str) -> Option<Self> {
        match operation {
            "eq" => Some(Self::Eq),
            "startsWith" => Some(Self::StartsWith),
            "endsWith" => Some(Self::EndsWith),
            "gte" => Some(Self::Gte),
            "lte" => Some(Self::Lte),
            _ => None,
        }
    }

    pub fn apply(self, actual: &str, expected: &str) -> bool {
        match self {
            StringOp::Eq => actual == expected,
            StringOp::StartsWith => actual.starts_with(expected),
            StringOp::EndsWith => actual.ends_with(expected),
            StringOp::Gte => actual.as_bytes() >= expected.as_bytes(),
            StringOp::Lte => actual.as_bytes() <= expected.as_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOp {
    /// Contact carries at least one of the listed tags.
    Contains,
    /// Contact carries none of the listed tags.
    NotContains,
}

impl TagOp {
    fn parse(operation: &str) -> Option<Self> {
        match operation {
            "contains" => Some(Self::Contains),
            "notContains" => Some(Self::NotContains),
            _ => None,
        }
    }
}

/// Boolean predicate over contacts.
///
/// `All(vec![])` is true and `Any(vec![])` is false, but [`compile`] never produces an
/// empty `Any`: groups without conditions are dropped and an empty document compiles
/// to [`Predicate::Always`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Always,
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Text {
        field: TextField,
        op: StringOp,
        value: String,
    },
    Tags {
        op: TagOp,
        tags: BTreeSet<TagId>,
    },
}

impl Predicate {
    pub fn matches(&self, contact: &Contact) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::All(parts) => parts.iter().all(|p| p.matches(contact)),
            Predicate::Any(parts) => parts.iter().any(|p| p.matches(contact)),
            Predicate::Text { field, op, value } => field
                .value_of(contact)
                .is_some_and(|actual| op.apply(actual, value)),
            Predicate::Tags { op, tags } => {
                let carries_any = tags.iter().any(|t| contact.has_tag(t));
                match op {
                    TagOp::Contains => carries_any,
                    TagOp::NotContains => !carries_any,
                }
            }
        }
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Predicate::Always)
    }
}

/// Validate a filter document and compile it into a [`Predicate`].
pub fn compile(filter: &FilterGroups) -> Result<Predicate, SegmentError> {
    let mut groups = Vec::with_capacity(filter.groups.len());
    for group in &filter.groups {
        if let Some(compiled) = compile_group(group)? {
            groups.push(compiled);
        }
    }

    Ok(combine(filter.operator, groups))
}

/// Compile an optional filter; no filter selects the whole audience.
pub fn compile_optional(filter: Option<&FilterGroups>) -> Result<Predicate, SegmentError> {
    filter.map_or(Ok(Predicate::Always), compile)
}

fn compile_group(group: &FilterGroup) -> Result<Option<Predicate>, SegmentError> {
    if group.conditions.is_empty() {
        return Ok(None);
    }

    let conditions = group
        .conditions
        .iter()
        .map(compile_condition)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(combine(group.operator, conditions)))
}

fn combine(operator: GroupOperator, mut parts: Vec<Predicate>) -> Predicate {
    match parts.len() {
        0 => Predicate::Always,
        1 => parts.remove(0),
        _ => match operator {
            GroupOperator::And => Predicate::All(parts),
            GroupOperator::Or => Predicate::Any(parts),
        },
    }
}

fn compile_condition(condition: &Condition) -> Result<Predicate, SegmentError> {
    if condition.field == "tags" {
        let op = TagOp::parse(&condition.operation).ok_or_else(|| unsupported(condition))?;
        let tags = parse_tag_list(condition)?;
        return Ok(Predicate::Tags { op, tags });
    }

    let field = TextField::parse(&condition.field)
        .ok_or_else(|| SegmentError::UnsupportedField(condition.field.clone()))?;
    let op = StringOp::parse(&condition.operation).ok_or_else(|| unsupported(condition))?;
    let value = match &condition.value {
        JsonValue::String(s) => s.clone(),
        other => {
            return Err(SegmentError::InvalidValue {
                field: condition.field.clone(),
                reason: format!("expected a string, got {other}"),
            });
        }
    };

    Ok(Predicate::Text { field, op, value })
}

fn parse_tag_list(condition: &Condition) -> Result<BTreeSet<TagId>, SegmentError> {
    let invalid = |reason: String| SegmentError::InvalidValue {
        field: condition.field.clone(),
        reason,
    };

    let items = condition
        .value
        .as_array()
        .ok_or_else(|| invalid("expected an array of tag ids".to_string()))?;

    items
        .iter()
        .map(|item| {
            let raw = item
                .as_str()
                .ok_or_else(|| invalid(format!("expected a tag id string, got {item}")))?;
            raw.parse::<TagId>().map_err(|e| invalid(e.to_string()))
        })
        .collect()
}

fn unsupported(condition: &Condition) -> SegmentError {
    SegmentError::UnsupportedOperation {
        field: condition.field.clone(),
        operation: condition.operation.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailpulse_core::AudienceId;
    use serde_json::json;

    fn contact(email: &str) -> Contact {
        Contact::new(AudienceId::new(), email)
    }

    #[test]
    fn empty_document_matches_everyone() {
        let predicate = compile(&FilterGroups::everyone()).unwrap();
        assert!(predicate.is_always());
        assert!(predicate.matches(&contact("a@b.c")));
    }

    #[test]
    fn empty_groups_are_ignored() {
        let filter = FilterGroups::new(
            GroupOperator::Or,
            vec![
                FilterGroup::new(GroupOperator::And, vec![]),
                FilterGroup::new(
                    GroupOperator::And,
                    vec![Condition::new("email", "endsWith", json!("@acme.io"))],
                ),
            ],
        );
        let predicate = compile(&filter).unwrap();

        assert!(predicate.matches(&contact("x@acme.io")));
        assert!(!predicate.matches(&contact("x@other.io")));
    }

    #[test]
    fn string_operations() {
        let c = contact("mallory@example.com").with_name("Mallory", "Smith");

        let check = |field: &str, op: &str, value: &str| {
            compile(&FilterGroups::all_of(vec![Condition::new(field, op, json!(value))]))
                .unwrap()
                .matches(&c)
        };

        assert!(check("email", "eq", "mallory@example.com"));
        assert!(check("firstName", "startsWith", "Mal"));
        assert!(check("lastName", "endsWith", "ith"));
        assert!(check("firstName", "gte", "M"));
        assert!(!check("firstName", "gte", "N"));
        assert!(check("lastName", "lte", "Smith"));
        assert!(!check("lastName", "lte", "Sm"));
    }

    #[test]
    fn unset_fields_never_match() {
        let c = contact("nobody@example.com");
        let predicate = compile(&FilterGroups::all_of(vec![Condition::new(
            "firstName",
            "lte",
            json!("zzz"),
        )]))
        .unwrap();

        assert!(!predicate.matches(&c));
    }

    #[test]
    fn attribute_fields() {
        let c = contact("p@example.com").with_attribute("plan", "pro");
        let predicate = compile(&FilterGroups::all_of(vec![Condition::new(
            "attributes.plan",
            "eq",
            json!("pro"),
        )]))
        .unwrap();

        assert!(predicate.matches(&c));
        assert!(!predicate.matches(&contact("q@example.com")));
    }

    #[test]
    fn tag_operations() {
        let vip = TagId::new();
        let churned = TagId::new();
        let tagged = contact("t@example.com").with_tag(vip);
        let untagged = contact("u@example.com");

        let contains = compile(&FilterGroups::all_of(vec![Condition::new(
            "tags",
            "contains",
            json!([vip.to_string(), churned.to_string()]),
        )]))
        .unwrap();
        let not_contains = compile(&FilterGroups::all_of(vec![Condition::new(
            "tags",
            "notContains",
            json!([vip.to_string()]),
        )]))
        .unwrap();

        assert!(contains.matches(&tagged));
        assert!(!contains.matches(&untagged));
        assert!(!not_contains.matches(&tagged));
        assert!(not_contains.matches(&untagged));
    }

    #[test]
    fn and_or_nesting() {
        let filter = FilterGroups::new(
            GroupOperator::And,
            vec![
                FilterGroup::new(
                    GroupOperator::Or,
                    vec![
                        Condition::new("email", "endsWith", json!("@a.io")),
                        Condition::new("email", "endsWith", json!("@b.io")),
                    ],
                ),
                FilterGroup::new(
                    GroupOperator::And,
                    vec![Condition::new("email", "startsWith", json!("sales"))],
                ),
            ],
        );
        let predicate = compile(&filter).unwrap();

        assert!(predicate.matches(&contact("sales@a.io")));
        assert!(predicate.matches(&contact("sales@b.io")));
        assert!(!predicate.matches(&contact("support@a.io")));
        assert!(!predicate.matches(&contact("sales@c.io")));
    }

    #[test]
    fn rejects_unsupported_operation_for_field_type() {
        let err = compile(&FilterGroups::all_of(vec![Condition::new(
            "email",
            "contains",
            json!("x"),
        )]))
        .unwrap_err();
        assert_eq!(
            err,
            SegmentError::UnsupportedOperation {
                field: "email".into(),
                operation: "contains".into()
            }
        );

        let err = compile(&FilterGroups::all_of(vec![Condition::new(
            "tags",
            "startsWith",
            json!([]),
        )]))
        .unwrap_err();
        assert!(matches!(err, SegmentError::UnsupportedOperation { .. }));
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        assert_eq!(
            compile(&FilterGroups::all_of(vec![Condition::new("age", "eq", json!("3"))])),
            Err(SegmentError::UnsupportedField("age".into()))
        );
        assert!(matches!(
            compile(&FilterGroups::all_of(vec![Condition::new("email", "eq", json!(3))])),
            Err(SegmentError::InvalidValue { .. })
        ));
        assert!(matches!(
            compile(&FilterGroups::all_of(vec![Condition::new(
                "tags",
                "contains",
                json!(["not-a-uuid"])
            )])),
            Err(SegmentError::InvalidValue { .. })
        ));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Property: compiled string operations agree with the std string methods.
            #[test]
            fn string_ops_agree_with_std(local in "[a-z]{1,12}", needle in "[a-z]{0,4}") {
                let email = format!("{local}@example.com");
                let c = contact(&email);

                let starts = compile(&FilterGroups::all_of(vec![
                    Condition::new("email", "startsWith", json!(needle.clone())),
                ])).unwrap();
                let gte = compile(&FilterGroups::all_of(vec![
                    Condition::new("email", "gte", json!(needle.clone())),
                ])).unwrap();

                prop_assert_eq!(starts.matches(&c), email.starts_with(&needle));
                prop_assert_eq!(gte.matches(&c), email.as_str() >= needle.as_str());
            }

            /// Property: an OR document matches exactly when one of its groups does.
            #[test]
            fn or_document_is_disjunction_of_groups(
                local in "[a-c]{1,3}",
                first in "[a-c]{1,2}",
                second in "[a-c]{1,2}",
            ) {
                let c = contact(&format!("{local}@x.io"));
                let g1 = FilterGroup::new(GroupOperator::And, vec![
                    Condition::new("email", "startsWith", json!(first.clone())),
                ]);
                let g2 = FilterGroup::new(GroupOperator::And, vec![
                    Condition::new("email", "startsWith", json!(second.clone())),
                ]);

                let either = compile(&FilterGroups::new(GroupOperator::Or, vec![g1.clone(), g2.clone()])).unwrap();
                let left = compile(&FilterGroups::new(GroupOperator::And, vec![g1])).unwrap();
                let right = compile(&FilterGroups::new(GroupOperator::And, vec![g2])).unwrap();

                prop_assert_eq!(either.matches(&c), left.matches(&c) || right.matches(&c));
            }
        }
    }
}
