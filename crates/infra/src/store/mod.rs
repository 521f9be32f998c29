//! Domain storage used by the job handlers.
//!
//! Contacts, automations and broadcasts are owned by the CRUD side; the workers read
//! them, record progress and deliveries, and flip a few status fields. Every write a
//! handler makes is idempotent so a re-delivered job is harmless.

pub mod memory;
pub mod postgres;
pub mod schema;
mod segment_sql;

use std::sync::Arc;

use thiserror::Error;

use mailpulse_automations::{Automation, AutomationStep, ContactAutomationStep};
use mailpulse_broadcasts::{
    AbTestVariant, Broadcast, BroadcastDelivery, BroadcastStatus, VariantEngagement,
};
use mailpulse_core::{
    AudienceId, AutomationId, BroadcastId, Contact, ContactId, StepId, TagId, VariantId,
};
use mailpulse_segments::{Predicate, SegmentError};

pub use memory::InMemoryMarketingStore;
pub use postgres::PostgresMarketingStore;
pub use schema::migrate;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error("row could not be decoded: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait::async_trait]
pub trait ContactStore: Send + Sync {
    async fn get_contact(&self, id: ContactId) -> Result<Option<Contact>, StoreError>;

    /// Returns `true` when the tag was newly attached.
    async fn add_tag(&self, contact: ContactId, tag: TagId) -> Result<bool, StoreError>;

    /// Returns `true` when the tag was present.
    async fn remove_tag(&self, contact: ContactId, tag: TagId) -> Result<bool, StoreError>;

    /// Contacts of `audience` matching `filter` with id greater than `after`, ascending
    /// by id, at most `limit`.
    async fn page_audience(
        &self,
        audience: AudienceId,
        filter: &Predicate,
        after: Option<ContactId>,
        limit: usize,
    ) -> Result<Vec<Contact>, StoreError>;

    /// Ids of every subscribed contact of `audience` matching `filter`, ascending.
    async fn matching_contact_ids(
        &self,
        audience: AudienceId,
        filter: &Predicate,
    ) -> Result<Vec<ContactId>, StoreError>;
}

#[async_trait::async_trait]
pub trait AutomationStore: Send + Sync {
    async fn get_automation(&self, id: AutomationId) -> Result<Option<Automation>, StoreError>;

    async fn get_step(&self, id: StepId) -> Result<Option<AutomationStep>, StoreError>;

    async fn trigger_step(
        &self,
        automation: AutomationId,
    ) -> Result<Option<AutomationStep>, StoreError>;

    async fn steps(&self, automation: AutomationId) -> Result<Vec<AutomationStep>, StoreError>;

    /// Direct children of `step`, ordered by branch index.
    async fn children(&self, step: StepId) -> Result<Vec<AutomationStep>, StoreError>;

    async fn progress(
        &self,
        contact: ContactId,
        step: StepId,
    ) -> Result<Option<ContactAutomationStep>, StoreError>;

    /// Insert a COMPLETED row with the branch the contact left on; `false` when the
    /// pair already has one.
    async fn record_completion(
        &self,
        contact: ContactId,
        step: StepId,
        branch: Option<u32>,
    ) -> Result<bool, StoreError>;

    /// Contacts that left `parent` on `branch` but have no row at `step`, id greater
    /// than `after`, ascending, at most `limit`.
    async fn pending_at_step(
        &self,
        parent: StepId,
        branch: u32,
        step: StepId,
        after: Option<ContactId>,
        limit: usize,
    ) -> Result<Vec<ContactId>, StoreError>;
}

#[async_trait::async_trait]
pub trait BroadcastStore: Send + Sync {
    async fn get_broadcast(&self, id: BroadcastId) -> Result<Option<Broadcast>, StoreError>;

    /// Write the status, planned recipients and failure reason only while the stored
    /// status is still `expected`. The winning variant is left alone.
    ///
    /// Returns `false` when another writer moved it first.
    async fn update_status(
        &self,
        broadcast: &Broadcast,
        expected: BroadcastStatus,
    ) -> Result<bool, StoreError>;

    /// Set the winning variant unless one is already recorded; `false` when it was.
    async fn record_winner(
        &self,
        broadcast: BroadcastId,
        variant: VariantId,
    ) -> Result<bool, StoreError>;

    /// Variants ordered by position.
    async fn variants(&self, broadcast: BroadcastId) -> Result<Vec<AbTestVariant>, StoreError>;

    async fn has_delivery(&self, broadcast: BroadcastId, contact: ContactId)
    -> Result<bool, StoreError>;

    /// Insert a delivery row; `false` when the contact already has one for the broadcast.
    async fn record_delivery(&self, delivery: &BroadcastDelivery) -> Result<bool, StoreError>;

    async fn delivery_count(&self, broadcast: BroadcastId) -> Result<u64, StoreError>;
}

/// Engagement counters from the analytics side.
#[async_trait::async_trait]
pub trait EngagementMetrics: Send + Sync {
    /// One entry per variant, in the order given.
    async fn variant_engagement(
        &self,
        broadcast: BroadcastId,
        variants: &[AbTestVariant],
    ) -> Result<Vec<VariantEngagement>, StoreError>;
}

/// The stores a worker's handlers share.
#[derive(Clone)]
pub struct Stores {
    pub contacts: Arc<dyn ContactStore>,
    pub automations: Arc<dyn AutomationStore>,
    pub broadcasts: Arc<dyn BroadcastStore>,
    pub engagement: Arc<dyn EngagementMetrics>,
}

impl Stores {
    /// Use one backend for every store.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: ContactStore + AutomationStore + BroadcastStore + EngagementMetrics + 'static,
    {
        Self {
            contacts: store.clone(),
            automations: store.clone(),
            broadcasts: store.clone(),
            engagement: store,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

/// Map SQLx errors to store errors.
///
/// | SQLx Error | PostgreSQL Error Code | StoreError |
/// |------------|----------------------|------------|
/// | Database (unique violation) | `23505` | `Conflict` |
/// | Database (other) | Any other | `Storage` |
/// | PoolClosed / other | N/A | `Storage` |
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        other => StoreError::Storage(format!("database error in {}: {}", operation, other)),
    }
}
