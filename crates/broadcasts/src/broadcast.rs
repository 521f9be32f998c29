//! Broadcast model and status lifecycle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailpulse_core::{AudienceId, BroadcastId, DomainError, DomainResult, VariantId};
use mailpulse_segments::FilterGroups;

/// Broadcast status lifecycle.
///
/// `Draft -> Queued -> Sending -> Sent | Failed`; `Queued -> Failed` covers
/// broadcasts rejected while scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastStatus {
    Draft,
    Queued,
    Sending,
    Sent,
    Failed,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastStatus::Draft => "DRAFT",
            BroadcastStatus::Queued => "QUEUED",
            BroadcastStatus::Sending => "SENDING",
            BroadcastStatus::Sent => "SENT",
            BroadcastStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(Self::Draft),
            "QUEUED" => Some(Self::Queued),
            "SENDING" => Some(Self::Sending),
            "SENT" => Some(Self::Sent),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BroadcastStatus::Sent | BroadcastStatus::Failed)
    }

    pub fn can_transition_to(&self, next: BroadcastStatus) -> bool {
        use BroadcastStatus::*;
        matches!(
            (self, next),
            (Draft, Queued) | (Queued, Sending) | (Queued, Failed) | (Sending, Sent) | (Sending, Failed)
        )
    }
}

/// Email content shared by broadcasts and their variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailContent {
    pub from: String,
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl EmailContent {
    pub fn new(from: impl Into<String>, subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            subject: subject.into(),
            html: html.into(),
            text: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Broadcast {
    pub id: BroadcastId,
    pub audience_id: AudienceId,
    /// Segment narrowing the audience; `None` targets every contact.
    #[serde(default)]
    pub filter: Option<FilterGroups>,
    pub is_ab_test: bool,
    /// Hours between the variant sends and winner selection.
    pub waiting_time_to_pick_winner: u32,
    pub status: BroadcastStatus,
    /// Content used by non-AB broadcasts.
    pub content: EmailContent,
    /// Number of contacts selected when the broadcast was scheduled.
    #[serde(default)]
    pub planned_recipients: Option<u64>,
    #[serde(default)]
    pub winning_variant_id: Option<VariantId>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Broadcast {
    pub fn new(audience_id: AudienceId, content: EmailContent) -> Self {
        let now = Utc::now();
        Self {
            id: BroadcastId::new(),
            audience_id,
            filter: None,
            is_ab_test: false,
            waiting_time_to_pick_winner: 0,
            status: BroadcastStatus::Draft,
            content,
            planned_recipients: None,
            winning_variant_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_filter(mut self, filter: FilterGroups) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn ab_test(mut self, waiting_hours: u32) -> Self {
        self.is_ab_test = true;
        self.waiting_time_to_pick_winner = waiting_hours;
        self
    }

    /// Move to `next`, rejecting transitions outside the lifecycle.
    pub fn transition(&mut self, next: BroadcastStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::illegal_transition(
                format!("broadcast {}", self.id),
                self.status.as_str(),
                next.as_str(),
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Delay before the winner is picked.
    pub fn winner_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.waiting_time_to_pick_winner) * 3600)
    }

    /// Delay before the final sample goes out: the winner delay plus `grace`, so the
    /// pick-winner job has run first.
    pub fn final_sample_delay(&self, grace: Duration) -> Duration {
        self.winner_delay() + grace
    }
}
