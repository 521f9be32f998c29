//! Broadcasts and AB-test partitioning.
//!
//! A broadcast sends one piece of content (or, for AB tests, several weighted
//! variants) to a filtered audience. This crate holds the broadcast model, the
//! status lifecycle, the weighted partition plan and winner selection; scheduling
//! the resulting jobs lives in `mailpulse-infra`.

pub mod broadcast;
pub mod delivery;
pub mod partition;
pub mod variant;
pub mod winner;

pub use broadcast::{Broadcast, BroadcastStatus, EmailContent};
pub use delivery::BroadcastDelivery;
pub use partition::{batches, plan_partitions, PartitionError, PartitionPlan, Slice};
pub use variant::{validate_variants, AbTestVariant};
pub use winner::{pick_winner, VariantEngagement};
