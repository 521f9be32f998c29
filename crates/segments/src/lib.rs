//! Segment filters: the filter-group wire format and its compiled predicate form.
//!
//! A segment arrives as a nested AND/OR document of `{field, operation, value}`
//! conditions. [`compile`] validates it once and produces a [`Predicate`] that can be
//! evaluated against in-memory contacts or translated into a store query.

pub mod filter;
pub mod predicate;

pub use filter::{Condition, FilterGroup, FilterGroups, GroupOperator};
pub use predicate::{compile, compile_optional, Predicate, StringOp, TagOp, TextField};

use thiserror::Error;

/// Errors raised while compiling a filter document.
///
/// These signal a data or programming defect in the stored segment and are
/// surfaced to whoever enqueues work for it; retrying does not help.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("unsupported field: {0}")]
    UnsupportedField(String),

    #[error("operation '{operation}' is not supported for field '{field}'")]
    UnsupportedOperation { field: String, operation: String },

    #[error("invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}
