//! Typed configuration for the built-in step subtypes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use mailpulse_core::TagId;
use mailpulse_segments::FilterGroups;

/// `TRIGGER_SEGMENT`: contacts enter the workflow when they match the filter.
/// No filter admits every contact of the audience.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    #[serde(default)]
    pub filter: Option<FilterGroups>,
}

/// `ACTION_ADD_TAG` / `ACTION_REMOVE_TAG`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagConfig {
    pub tag_id: TagId,
}

/// `ACTION_SEND_EMAIL`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailConfig {
    pub from: String,
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// `RULE_IF_ELSE`: branch 0 when the filter matches, branch 1 otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IfElseConfig {
    pub filter: FilterGroups,
}

/// `RULE_WAIT`: hold the contact before moving to the single child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitConfig {
    pub seconds: u64,
}

impl WaitConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds)
    }
}
