//! In-memory domain store for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use mailpulse_automations::{Automation, AutomationStep, ContactAutomationStep};
use mailpulse_broadcasts::{
    AbTestVariant, Broadcast, BroadcastDelivery, BroadcastStatus, VariantEngagement,
};
use mailpulse_core::{
    AudienceId, AutomationId, BroadcastId, Contact, ContactId, StepId, TagId, VariantId,
};
use mailpulse_segments::Predicate;

use super::{AutomationStore, BroadcastStore, ContactStore, EngagementMetrics, StoreError};

#[derive(Debug, Default)]
struct State {
    contacts: BTreeMap<ContactId, Contact>,
    automations: HashMap<AutomationId, Automation>,
    steps: HashMap<StepId, AutomationStep>,
    progress: HashMap<(ContactId, StepId), ContactAutomationStep>,
    broadcasts: HashMap<BroadcastId, Broadcast>,
    variants: HashMap<BroadcastId, Vec<AbTestVariant>>,
    deliveries: BTreeMap<(BroadcastId, ContactId), BroadcastDelivery>,
}

/// Implements every store trait over one lock.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryMarketingStore {
    state: RwLock<State>,
}

impl InMemoryMarketingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("store lock poisoned".to_string()))
    }

    pub fn insert_contact(&self, contact: Contact) -> Result<(), StoreError> {
        self.write()?.contacts.insert(contact.id, contact);
        Ok(())
    }

    pub fn insert_automation(&self, automation: Automation) -> Result<(), StoreError> {
        self.write()?.automations.insert(automation.id, automation);
        Ok(())
    }

    pub fn insert_steps(&self, steps: impl IntoIterator<Item = AutomationStep>) -> Result<(), StoreError> {
        let mut state = self.write()?;
        for step in steps {
            state.steps.insert(step.id, step);
        }
        Ok(())
    }

    pub fn insert_broadcast(&self, broadcast: Broadcast) -> Result<(), StoreError> {
        self.write()?.broadcasts.insert(broadcast.id, broadcast);
        Ok(())
    }

    pub fn insert_variant(&self, variant: AbTestVariant) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let variants = state.variants.entry(variant.broadcast_id).or_default();
        variants.push(variant);
        variants.sort_by_key(|v| v.position);
        Ok(())
    }

    /// Deliveries of a broadcast, ascending by contact id.
    pub fn deliveries(&self, broadcast: BroadcastId) -> Result<Vec<BroadcastDelivery>, StoreError> {
        Ok(self
            .read()?
            .deliveries
            .range((broadcast, ContactId::from_uuid(uuid::Uuid::nil()))..)
            .take_while(|((b, _), _)| *b == broadcast)
            .map(|(_, d)| d.clone())
            .collect())
    }

    /// Contacts with a completion row at `step`.
    pub fn completed_at(&self, step: StepId) -> Result<Vec<ContactId>, StoreError> {
        let mut contacts: Vec<ContactId> = self
            .read()?
            .progress
            .keys()
            .filter(|(_, s)| *s == step)
            .map(|(c, _)| *c)
            .collect();
        contacts.sort();
        Ok(contacts)
    }

    pub fn mark_opened(&self, broadcast: BroadcastId, contact: ContactId) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let delivery = state
            .deliveries
            .get_mut(&(broadcast, contact))
            .ok_or_else(|| StoreError::NotFound(format!("delivery {broadcast}/{contact}")))?;
        delivery.opened_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    pub fn mark_clicked(&self, broadcast: BroadcastId, contact: ContactId) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let delivery = state
            .deliveries
            .get_mut(&(broadcast, contact))
            .ok_or_else(|| StoreError::NotFound(format!("delivery {broadcast}/{contact}")))?;
        delivery.clicked_at.get_or_insert_with(Utc::now);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ContactStore for InMemoryMarketingStore {
    async fn get_contact(&self, id: ContactId) -> Result<Option<Contact>, StoreError> {
        Ok(self.read()?.contacts.get(&id).cloned())
    }

    async fn add_tag(&self, contact: ContactId, tag: TagId) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let contact = state
            .contacts
            .get_mut(&contact)
            .ok_or_else(|| StoreError::NotFound(format!("contact {contact}")))?;
        Ok(contact.add_tag(tag))
    }

    async fn remove_tag(&self, contact: ContactId, tag: TagId) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let contact = state
            .contacts
            .get_mut(&contact)
            .ok_or_else(|| StoreError::NotFound(format!("contact {contact}")))?;
        Ok(contact.remove_tag(&tag))
    }

    async fn page_audience(
        &self,
        audience: AudienceId,
        filter: &Predicate,
        after: Option<ContactId>,
        limit: usize,
    ) -> Result<Vec<Contact>, StoreError> {
        let state = self.read()?;
        Ok(state
            .contacts
            .values()
            .filter(|c| after.is_none_or(|a| c.id > a))
            .filter(|c| c.audience_id == audience && filter.matches(c))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn matching_contact_ids(
        &self,
        audience: AudienceId,
        filter: &Predicate,
    ) -> Result<Vec<ContactId>, StoreError> {
        let state = self.read()?;
        Ok(state
            .contacts
            .values()
            .filter(|c| c.audience_id == audience && c.subscribed && filter.matches(c))
            .map(|c| c.id)
            .collect())
    }
}

#[async_trait::async_trait]
impl AutomationStore for InMemoryMarketingStore {
    async fn get_automation(&self, id: AutomationId) -> Result<Option<Automation>, StoreError> {
        Ok(self.read()?.automations.get(&id).cloned())
    }

    async fn get_step(&self, id: StepId) -> Result<Option<AutomationStep>, StoreError> {
        Ok(self.read()?.steps.get(&id).cloned())
    }

    async fn trigger_step(
        &self,
        automation: AutomationId,
    ) -> Result<Option<AutomationStep>, StoreError> {
        Ok(self
            .read()?
            .steps
            .values()
            .find(|s| s.automation_id == automation && s.is_trigger())
            .cloned())
    }

    async fn steps(&self, automation: AutomationId) -> Result<Vec<AutomationStep>, StoreError> {
        let mut steps: Vec<AutomationStep> = self
            .read()?
            .steps
            .values()
            .filter(|s| s.automation_id == automation)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.id);
        Ok(steps)
    }

    async fn children(&self, step: StepId) -> Result<Vec<AutomationStep>, StoreError> {
        let mut children: Vec<AutomationStep> = self
            .read()?
            .steps
            .values()
            .filter(|s| s.parent_id == Some(step))
            .cloned()
            .collect();
        children.sort_by_key(|s| (s.branch_index, s.id));
        Ok(children)
    }

    async fn progress(
        &self,
        contact: ContactId,
        step: StepId,
    ) -> Result<Option<ContactAutomationStep>, StoreError> {
        Ok(self.read()?.progress.get(&(contact, step)).cloned())
    }

    async fn record_completion(
        &self,
        contact: ContactId,
        step: StepId,
        branch: Option<u32>,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        if state.progress.contains_key(&(contact, step)) {
            return Ok(false);
        }
        state.progress.insert(
            (contact, step),
            ContactAutomationStep::completed(contact, step, branch),
        );
        Ok(true)
    }

    async fn pending_at_step(
        &self,
        parent: StepId,
        branch: u32,
        step: StepId,
        after: Option<ContactId>,
        limit: usize,
    ) -> Result<Vec<ContactId>, StoreError> {
        let state = self.read()?;
        let mut contacts: Vec<ContactId> = state
            .progress
            .values()
            .filter(|p| p.step_id == parent && p.branch == Some(branch))
            .map(|p| p.contact_id)
            .filter(|c| after.is_none_or(|a| *c > a))
            .filter(|c| !state.progress.contains_key(&(*c, step)))
            .collect();
        contacts.sort();
        contacts.truncate(limit);
        Ok(contacts)
    }
}

#[async_trait::async_trait]
impl BroadcastStore for InMemoryMarketingStore {
    async fn get_broadcast(&self, id: BroadcastId) -> Result<Option<Broadcast>, StoreError> {
        Ok(self.read()?.broadcasts.get(&id).cloned())
    }

    async fn update_status(
        &self,
        broadcast: &Broadcast,
        expected: BroadcastStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        match state.broadcasts.get_mut(&broadcast.id) {
            Some(stored) if stored.status == expected => {
                stored.status = broadcast.status;
                stored.planned_recipients = broadcast.planned_recipients;
                stored.failure_reason = broadcast.failure_reason.clone();
                stored.updated_at = broadcast.updated_at;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("broadcast {}", broadcast.id))),
        }
    }

    async fn record_winner(
        &self,
        broadcast: BroadcastId,
        variant: VariantId,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let stored = state
            .broadcasts
            .get_mut(&broadcast)
            .ok_or_else(|| StoreError::NotFound(format!("broadcast {broadcast}")))?;
        if stored.winning_variant_id.is_some() {
            return Ok(false);
        }
        stored.winning_variant_id = Some(variant);
        stored.updated_at = Utc::now();
        Ok(true)
    }

    async fn variants(&self, broadcast: BroadcastId) -> Result<Vec<AbTestVariant>, StoreError> {
        Ok(self
            .read()?
            .variants
            .get(&broadcast)
            .cloned()
            .unwrap_or_default())
    }

    async fn has_delivery(
        &self,
        broadcast: BroadcastId,
        contact: ContactId,
    ) -> Result<bool, StoreError> {
        Ok(self.read()?.deliveries.contains_key(&(broadcast, contact)))
    }

    async fn record_delivery(&self, delivery: &BroadcastDelivery) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let key = (delivery.broadcast_id, delivery.contact_id);
        if state.deliveries.contains_key(&key) {
            return Ok(false);
        }
        state.deliveries.insert(key, delivery.clone());
        Ok(true)
    }

    async fn delivery_count(&self, broadcast: BroadcastId) -> Result<u64, StoreError> {
        Ok(self
            .read()?
            .deliveries
            .keys()
            .filter(|(b, _)| *b == broadcast)
            .count() as u64)
    }
}

#[async_trait::async_trait]
impl EngagementMetrics for InMemoryMarketingStore {
    async fn variant_engagement(
        &self,
        broadcast: BroadcastId,
        variants: &[AbTestVariant],
    ) -> Result<Vec<VariantEngagement>, StoreError> {
        let state = self.read()?;
        Ok(variants
            .iter()
            .map(|variant| {
                let sent: Vec<&BroadcastDelivery> = state
                    .deliveries
                    .values()
                    .filter(|d| {
                        d.broadcast_id == broadcast && d.variant_id == Some(variant.id) && d.is_sent()
                    })
                    .collect();
                VariantEngagement {
                    variant_id: variant.id,
                    position: variant.position,
                    delivered: sent.len() as u64,
                    opened: sent.iter().filter(|d| d.opened_at.is_some()).count() as u64,
                    clicked: sent.iter().filter(|d| d.clicked_at.is_some()).count() as u64,
                }
            })
            .collect())
    }
}
