//! Renders compiled segment predicates as SQL over the `contacts` table.

use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use mailpulse_segments::{Predicate, StringOp, TagOp, TextField};

/// Append `predicate` as a boolean SQL expression. Values are always bound.
///
/// Unset fields are NULL and every comparison against NULL is false, matching the
/// in-memory evaluation. Range comparisons use the "C" collation so they order by
/// bytes.
pub(crate) fn push_predicate(builder: &mut QueryBuilder<'_, Postgres>, predicate: &Predicate) {
    match predicate {
        Predicate::Always => {
            builder.push("TRUE");
        }
        Predicate::All(parts) => push_joined(builder, parts, " AND ", "TRUE"),
        Predicate::Any(parts) => push_joined(builder, parts, " OR ", "FALSE"),
        Predicate::Text { field, op, value } => {
            match op {
                StringOp::Eq => {
                    push_column(builder, field);
                    builder.push(" = ").push_bind(value.clone());
                }
                StringOp::StartsWith => {
                    builder.push("starts_with(");
                    push_column(builder, field);
                    builder.push(", ").push_bind(value.clone()).push(")");
                }
                StringOp::EndsWith => {
                    builder.push("right(");
                    push_column(builder, field);
                    builder
                        .push(", ")
                        .push_bind(value.chars().count() as i32)
                        .push(") = ")
                        .push_bind(value.clone());
                }
                StringOp::Gte => {
                    push_column(builder, field);
                    builder.push(" COLLATE \"C\" >= ").push_bind(value.clone());
                }
                StringOp::Lte => {
                    push_column(builder, field);
                    builder.push(" COLLATE \"C\" <= ").push_bind(value.clone());
                }
            }
        }
        Predicate::Tags { op, tags } => {
            let tags: Vec<Uuid> = tags.iter().map(|t| *t.as_uuid()).collect();
            match op {
                TagOp::Contains => {
                    builder.push("(tags && ").push_bind(tags).push("::uuid[])");
                }
                TagOp::NotContains => {
                    builder.push("NOT (tags && ").push_bind(tags).push("::uuid[])");
                }
            }
        }
    }
}

fn push_column(builder: &mut QueryBuilder<'_, Postgres>, field: &TextField) {
    builder.push("(");
    match field {
        TextField::Email => {
            builder.push("email");
        }
        TextField::FirstName => {
            builder.push("first_name");
        }
        TextField::LastName => {
            builder.push("last_name");
        }
        TextField::Attribute(key) => {
            builder.push("attributes ->> ").push_bind(key.clone());
        }
    }
    builder.push(")");
}

fn push_joined(
    builder: &mut QueryBuilder<'_, Postgres>,
    parts: &[Predicate],
    separator: &str,
    empty: &str,
) {
    if parts.is_empty() {
        builder.push(empty);
        return;
    }
    builder.push("(");
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            builder.push(separator);
        }
        push_predicate(builder, part);
    }
    builder.push(")");
}
