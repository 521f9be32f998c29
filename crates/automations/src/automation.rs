//! Automation header record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailpulse_core::{AudienceId, AutomationId};

/// An automation workflow over one audience. Its steps are stored separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Automation {
    pub id: AutomationId,
    pub audience_id: AudienceId,
    pub name: String,
    /// Only active automations enroll contacts.
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Automation {
    pub fn new(audience_id: AudienceId, name: impl Into<String>) -> Self {
        Self {
            id: AutomationId::new(),
            audience_id,
            name: name.into(),
            active: true,
            created_at: Utc::now(),
        }
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}
