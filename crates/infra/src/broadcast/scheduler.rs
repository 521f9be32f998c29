//! Broadcast scheduling and sending.
//!
//! `queue` is the producer entry point. The handlers split the recipients into
//! variant slices, send them in batches, pick the winner after the waiting time and
//! send the final sample with the winning content.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use mailpulse_broadcasts::{
    batches, pick_winner, plan_partitions, validate_variants, AbTestVariant, Broadcast,
    BroadcastDelivery, BroadcastStatus, EmailContent, PartitionPlan,
};
use mailpulse_core::{BroadcastId, ContactId, VariantId};
use mailpulse_segments::{compile_optional, Predicate};

use super::jobs::{PickWinner, ScheduleBroadcast, SendBatch, SendFinalSample};
use super::{BroadcastError, ValidationError};
use crate::jobs::{JobError, JobId, JobResult, JobStore, NewJob};
use crate::mail::{MailSender, OutboundEmail};
use crate::store::{StoreError, Stores};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_WINNER_GRACE: Duration = Duration::from_secs(180);
pub const NO_WINNER_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastSettings {
    /// Contacts per send job.
    pub batch_size: usize,
    /// Added to the waiting time before the final sample goes out.
    pub winner_grace: Duration,
    /// How long a final-sample batch waits when no winner is recorded yet.
    pub no_winner_retry: Duration,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            winner_grace: DEFAULT_WINNER_GRACE,
            no_winner_retry: NO_WINNER_RETRY,
        }
    }
}

/// Weights keyed by variant; a plain broadcast is one implicit weight-100 slice.
type Weights = Vec<(Option<VariantId>, u32)>;

struct Prepared {
    contacts: Vec<ContactId>,
    plan: PartitionPlan<Option<VariantId>>,
}

fn done(reason: &str) -> JobResult {
    JobResult::output(json!({ "skipped": reason }))
}

pub struct BroadcastScheduler {
    stores: Stores,
    jobs: Arc<dyn JobStore>,
    mail: Arc<dyn MailSender>,
    settings: BroadcastSettings,
}

impl BroadcastScheduler {
    pub fn new(
        stores: Stores,
        jobs: Arc<dyn JobStore>,
        mail: Arc<dyn MailSender>,
        settings: BroadcastSettings,
    ) -> Self {
        Self {
            stores,
            jobs,
            mail,
            settings,
        }
    }

    pub fn settings(&self) -> BroadcastSettings {
        self.settings
    }

    /// Validate a draft, move it to QUEUED and dispatch `broadcast.schedule`.
    ///
    /// Validation errors are returned here and leave the broadcast untouched. Calling
    /// this again for a broadcast that is already QUEUED dispatches another schedule
    /// job, which is harmless.
    pub async fn queue(&self, broadcast_id: BroadcastId) -> Result<JobId, BroadcastError> {
        let mut broadcast = self
            .stores
            .broadcasts
            .get_broadcast(broadcast_id)
            .await?
            .ok_or(BroadcastError::NotFound(broadcast_id))?;

        if broadcast.status != BroadcastStatus::Queued {
            self.validate(&broadcast).await?;
            broadcast.transition(BroadcastStatus::Queued)?;
            if !self
                .stores
                .broadcasts
                .update_status(&broadcast, BroadcastStatus::Draft)
                .await?
            {
                return Err(BroadcastError::Conflict(broadcast_id));
            }
        }

        let job_id = self
            .jobs
            .dispatch(ScheduleBroadcast { broadcast_id }.job()?)
            .await?;
        info!(broadcast_id = %broadcast_id, job_id = %job_id, "broadcast queued");
        Ok(job_id)
    }

    /// Compute the plan, enqueue every send job and move the broadcast to SENDING.
    pub async fn schedule(&self, payload: ScheduleBroadcast) -> Result<JobResult, JobError> {
        let Some(mut broadcast) = self.stores.broadcasts.get_broadcast(payload.broadcast_id).await?
        else {
            return Ok(done("broadcast not found"));
        };
        if broadcast.status != BroadcastStatus::Queued {
            return Ok(done("broadcast not queued"));
        }

        let prepared = self.prepare(&broadcast).await;
        let Prepared { contacts, plan } = match prepared {
            Ok(prepared) => prepared,
            Err(BroadcastError::Validation(error)) => {
                let reason = error.to_string();
                warn!(broadcast_id = %broadcast.id, %reason, "broadcast failed validation");
                self.mark_failed(broadcast, reason.clone()).await?;
                return Ok(JobResult::output(json!({ "failed": reason })));
            }
            Err(other) => return Err(other.into()),
        };

        let total = contacts.len();
        broadcast.planned_recipients = Some(total as u64);

        if total == 0 {
            broadcast.transition(BroadcastStatus::Sending).map_err(domain)?;
            broadcast.transition(BroadcastStatus::Sent).map_err(domain)?;
            self.stores
                .broadcasts
                .update_status(&broadcast, BroadcastStatus::Queued)
                .await?;
            info!(broadcast_id = %broadcast.id, "nothing to send");
            return Ok(JobResult::output(json!({ "recipients": 0 })));
        }

        let jobs = self.send_jobs(&broadcast, &contacts, &plan)?;
        let dispatched = self.jobs.dispatch_many(jobs).await?.len();

        broadcast.transition(BroadcastStatus::Sending).map_err(domain)?;
        if !self
            .stores
            .broadcasts
            .update_status(&broadcast, BroadcastStatus::Queued)
            .await?
        {
            warn!(broadcast_id = %broadcast.id, "broadcast changed while scheduling");
            return Ok(done("broadcast changed while scheduling"));
        }
        // Batches may have finished before the status moved.
        self.complete_if_done(broadcast.id).await?;

        info!(
            broadcast_id = %broadcast.id,
            recipients = total,
            final_sample = plan.final_sample.len,
            jobs = dispatched,
            "broadcast scheduled"
        );
        Ok(JobResult::output(json!({
            "recipients": total,
            "finalSample": plan.final_sample.len,
            "jobs": dispatched,
        })))
    }

    pub async fn send_batch(&self, payload: SendBatch) -> Result<JobResult, JobError> {
        let Some(broadcast) = self.stores.broadcasts.get_broadcast(payload.broadcast_id).await?
        else {
            return Ok(done("broadcast not found"));
        };
        if broadcast.status == BroadcastStatus::Failed {
            return Ok(done("broadcast failed"));
        }

        let content = match payload.variant_id {
            None => broadcast.content.clone(),
            Some(variant_id) => match self.variant(broadcast.id, variant_id).await? {
                Some(variant) => variant.content,
                None => return Ok(done("variant not found")),
            },
        };

        let (sent, skipped) = self
            .deliver(broadcast.id, payload.variant_id, &content, &payload.contact_ids)
            .await?;
        self.complete_if_done(broadcast.id).await?;
        Ok(JobResult::output(json!({ "sent": sent, "skipped": skipped })))
    }

    pub async fn send_final_sample(&self, payload: SendFinalSample) -> Result<JobResult, JobError> {
        let Some(broadcast) = self.stores.broadcasts.get_broadcast(payload.broadcast_id).await?
        else {
            return Ok(done("broadcast not found"));
        };
        if broadcast.status == BroadcastStatus::Failed {
            return Ok(done("broadcast failed"));
        }
        let Some(winner) = broadcast.winning_variant_id else {
            return Ok(JobResult::retry_after(
                "no winner picked yet",
                self.settings.no_winner_retry,
            ));
        };
        let Some(variant) = self.variant(broadcast.id, winner).await? else {
            return Ok(done("winning variant not found"));
        };

        let (sent, skipped) = self
            .deliver(broadcast.id, Some(winner), &variant.content, &payload.contact_ids)
            .await?;
        self.complete_if_done(broadcast.id).await?;
        Ok(JobResult::output(json!({ "sent": sent, "skipped": skipped, "winner": winner })))
    }

    /// Record the variant with the best engagement. A recorded winner is kept.
    pub async fn pick_winner(&self, payload: PickWinner) -> Result<JobResult, JobError> {
        let Some(broadcast) = self.stores.broadcasts.get_broadcast(payload.broadcast_id).await?
        else {
            return Ok(done("broadcast not found"));
        };
        if let Some(winner) = broadcast.winning_variant_id {
            return Ok(JobResult::output(json!({ "winner": winner })));
        }
        if !broadcast.is_ab_test {
            return Ok(done("not an AB test"));
        }

        let variants = self.stores.broadcasts.variants(broadcast.id).await?;
        let engagement = self
            .stores
            .engagement
            .variant_engagement(broadcast.id, &variants)
            .await?;
        let Some(winner) = pick_winner(&engagement) else {
            return Ok(done("no variants"));
        };

        if !self.stores.broadcasts.record_winner(broadcast.id, winner).await? {
            // Another run recorded first; report the stored choice.
            let stored = self
                .stores
                .broadcasts
                .get_broadcast(broadcast.id)
                .await?
                .and_then(|b| b.winning_variant_id);
            return Ok(JobResult::output(json!({ "winner": stored })));
        }

        info!(broadcast_id = %broadcast.id, winner = %winner, "AB test winner picked");
        Ok(JobResult::output(json!({ "winner": winner })))
    }

    async fn validate(&self, broadcast: &Broadcast) -> Result<(Predicate, Weights), BroadcastError> {
        let predicate = compile_optional(broadcast.filter.as_ref()).map_err(ValidationError::from)?;
        if !broadcast.is_ab_test {
            return Ok((predicate, vec![(None, 100)]));
        }
        let variants = self.stores.broadcasts.variants(broadcast.id).await?;
        validate_variants(&variants).map_err(ValidationError::from)?;
        let weights = variants.iter().map(|v| (Some(v.id), v.weight)).collect();
        Ok((predicate, weights))
    }

    async fn prepare(&self, broadcast: &Broadcast) -> Result<Prepared, BroadcastError> {
        let (predicate, weights) = self.validate(broadcast).await?;
        let contacts = self
            .stores
            .contacts
            .matching_contact_ids(broadcast.audience_id, &predicate)
            .await?;
        let plan = plan_partitions(&weights, contacts.len()).map_err(ValidationError::from)?;
        Ok(Prepared { contacts, plan })
    }

    fn send_jobs(
        &self,
        broadcast: &Broadcast,
        contacts: &[ContactId],
        plan: &PartitionPlan<Option<VariantId>>,
    ) -> Result<Vec<NewJob>, JobError> {
        let broadcast_id = broadcast.id;
        let batch_size = self.settings.batch_size;
        let mut jobs = Vec::new();

        for (variant_id, slice) in &plan.variants {
            for range in batches(*slice, batch_size) {
                jobs.push(
                    SendBatch {
                        broadcast_id,
                        variant_id: *variant_id,
                        contact_ids: contacts[range].to_vec(),
                    }
                    .job()?,
                );
            }
        }

        if broadcast.is_ab_test {
            let delay = broadcast.final_sample_delay(self.settings.winner_grace);
            for range in batches(plan.final_sample, batch_size) {
                jobs.push(
                    SendFinalSample {
                        broadcast_id,
                        contact_ids: contacts[range].to_vec(),
                    }
                    .job(delay)?,
                );
            }
            jobs.push(PickWinner { broadcast_id }.job(broadcast.winner_delay())?);
        }

        Ok(jobs)
    }

    async fn variant(
        &self,
        broadcast: BroadcastId,
        variant: VariantId,
    ) -> Result<Option<AbTestVariant>, StoreError> {
        Ok(self
            .stores
            .broadcasts
            .variants(broadcast)
            .await?
            .into_iter()
            .find(|v| v.id == variant))
    }

    /// Send `content` to every listed contact without a delivery row. Returns the
    /// number of messages sent and of contacts skipped.
    async fn deliver(
        &self,
        broadcast: BroadcastId,
        variant: Option<VariantId>,
        content: &EmailContent,
        contacts: &[ContactId],
    ) -> Result<(usize, usize), JobError> {
        let (mut sent, mut skipped) = (0, 0);
        for contact_id in contacts {
            if self.stores.broadcasts.has_delivery(broadcast, *contact_id).await? {
                continue;
            }
            let delivery = match self.stores.contacts.get_contact(*contact_id).await? {
                Some(contact) if contact.subscribed => {
                    let message_id = self
                        .mail
                        .send(&OutboundEmail::to_contact(content, &contact))
                        .await?;
                    sent += 1;
                    BroadcastDelivery::sent(broadcast, *contact_id, variant, message_id)
                }
                _ => {
                    skipped += 1;
                    BroadcastDelivery::skipped(broadcast, *contact_id, variant)
                }
            };
            self.stores.broadcasts.record_delivery(&delivery).await?;
        }
        Ok((sent, skipped))
    }

    /// Move a SENDING broadcast to SENT once every planned recipient has a delivery row.
    async fn complete_if_done(&self, broadcast_id: BroadcastId) -> Result<bool, StoreError> {
        let Some(mut broadcast) = self.stores.broadcasts.get_broadcast(broadcast_id).await? else {
            return Ok(false);
        };
        if broadcast.status != BroadcastStatus::Sending {
            return Ok(false);
        }
        let Some(planned) = broadcast.planned_recipients else {
            return Ok(false);
        };
        if self.stores.broadcasts.delivery_count(broadcast_id).await? < planned {
            return Ok(false);
        }

        if broadcast.transition(BroadcastStatus::Sent).is_err() {
            return Ok(false);
        }
        let moved = self
            .stores
            .broadcasts
            .update_status(&broadcast, BroadcastStatus::Sending)
            .await?;
        if moved {
            info!(broadcast_id = %broadcast_id, recipients = planned, "broadcast sent");
        }
        Ok(moved)
    }

    async fn mark_failed(&self, mut broadcast: Broadcast, reason: String) -> Result<bool, StoreError> {
        let expected = broadcast.status;
        if broadcast.transition(BroadcastStatus::Failed).is_err() {
            return Ok(false);
        }
        broadcast.failure_reason = Some(reason);
        self.stores
            .broadcasts
            .update_status(&broadcast, expected)
            .await
    }
}

fn domain(err: mailpulse_core::DomainError) -> JobError {
    JobError::Other(err.to_string())
}

impl std::fmt::Debug for BroadcastScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastScheduler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
