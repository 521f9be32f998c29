//! Domain error model.

use thiserror::Error;

/// Result type used across the domain crates.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic domain failure: the same input fails the same way on every attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier did not parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A lifecycle move the current status does not allow.
    #[error("{entity} cannot move from {from} to {to}")]
    IllegalTransition {
        entity: String,
        from: &'static str,
        to: &'static str,
    },
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn illegal_transition(entity: impl Into<String>, from: &'static str, to: &'static str) -> Self {
        Self::IllegalTransition {
            entity: entity.into(),
            from,
            to,
        }
    }
}
