//! Per-contact send record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailpulse_core::{BroadcastId, ContactId, VariantId};

/// One contact settled by a broadcast.
///
/// At most one row exists per `(broadcast_id, contact_id)`; a batch that runs again
/// skips contacts that already have one. `message_id` is `None` when the contact was
/// skipped (deleted or unsubscribed by the time its batch ran). Open and click
/// timestamps are filled in by the tracking side and feed winner selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastDelivery {
    pub broadcast_id: BroadcastId,
    pub contact_id: ContactId,
    /// Variant whose content was sent; `None` for non-AB sends.
    pub variant_id: Option<VariantId>,
    pub message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clicked_at: Option<DateTime<Utc>>,
}

impl BroadcastDelivery {
    pub fn sent(
        broadcast_id: BroadcastId,
        contact_id: ContactId,
        variant_id: Option<VariantId>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            broadcast_id,
            contact_id,
            variant_id,
            message_id: Some(message_id.into()),
            sent_at: Utc::now(),
            opened_at: None,
            clicked_at: None,
        }
    }

    pub fn skipped(
        broadcast_id: BroadcastId,
        contact_id: ContactId,
        variant_id: Option<VariantId>,
    ) -> Self {
        Self {
            broadcast_id,
            contact_id,
            variant_id,
            message_id: None,
            sent_at: Utc::now(),
            opened_at: None,
            clicked_at: None,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.message_id.is_some()
    }
}
