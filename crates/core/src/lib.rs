//! Shared identifiers, the contact model and the domain error type.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod contact;
pub mod error;
pub mod id;

pub use contact::Contact;
pub use error::{DomainError, DomainResult};
pub use id::{AudienceId, AutomationId, BroadcastId, ContactId, StepId, TagId, VariantId};
