//! Postgres implementation of the domain stores.
//!
//! Inserts made by handlers use `ON CONFLICT DO NOTHING` and report whether a row
//! was written, which is what makes re-delivered jobs harmless.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;
use uuid::Uuid;

use mailpulse_automations::{
    Automation, AutomationStep, ContactAutomationStep, ContactStepStatus, StepType,
};
use mailpulse_broadcasts::{
    AbTestVariant, Broadcast, BroadcastDelivery, BroadcastStatus, EmailContent, VariantEngagement,
};
use mailpulse_core::{
    AudienceId, AutomationId, BroadcastId, Contact, ContactId, StepId, TagId, VariantId,
};
use mailpulse_segments::{FilterGroups, Predicate};

use super::segment_sql::push_predicate;
use super::{
    map_sqlx_error, AutomationStore, BroadcastStore, ContactStore, EngagementMetrics, StoreError,
};

const CONTACT_COLUMNS: &str =
    "id, audience_id, email, first_name, last_name, attributes, tags, subscribed, created_at";

const STEP_COLUMNS: &str = "id, automation_id, type, subtype, parent_id, branch_index, config";

const BROADCAST_COLUMNS: &str = r#"
    id, audience_id, filter, is_ab_test, waiting_time_to_pick_winner, status,
    from_address, subject, html, text, planned_recipients, winning_variant_id,
    failure_reason, created_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresMarketingStore {
    pool: Arc<PgPool>,
}

impl PostgresMarketingStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// `SELECT columns` over the audience's contacts matching `filter`, by id.
    fn select_audience(
        columns: &str,
        audience: AudienceId,
        filter: &Predicate,
        after: Option<ContactId>,
        subscribed_only: bool,
    ) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new(format!("SELECT {columns} FROM contacts WHERE audience_id = "));
        builder.push_bind(*audience.as_uuid()).push(" AND ");
        if subscribed_only {
            builder.push("subscribed AND ");
        }
        push_predicate(&mut builder, filter);
        if let Some(after) = after {
            builder.push(" AND id > ").push_bind(*after.as_uuid());
        }
        builder.push(" ORDER BY id ASC");
        builder
    }

    async fn ensure_contact(&self, id: ContactId) -> Result<(), StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM contacts WHERE id = $1)")
            .bind(*id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_contact", e))?;
        if exists {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("contact {id}")))
        }
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn branch_param(branch: u32) -> i32 {
    i32::try_from(branch).unwrap_or(i32::MAX)
}

#[async_trait::async_trait]
impl ContactStore for PostgresMarketingStore {
    #[instrument(skip(self), fields(contact_id = %id), err)]
    async fn get_contact(&self, id: ContactId) -> Result<Option<Contact>, StoreError> {
        let row = sqlx::query(&format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_contact", e))?;

        row.map(|r| decode::<ContactRow, _>(&r)).transpose()
    }

    #[instrument(skip(self), fields(contact_id = %contact, tag_id = %tag), err)]
    async fn add_tag(&self, contact: ContactId, tag: TagId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE contacts SET tags = array_append(tags, $2) WHERE id = $1 AND NOT ($2 = ANY(tags))",
        )
        .bind(*contact.as_uuid())
        .bind(*tag.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("add_tag", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.ensure_contact(contact).await?;
        Ok(false)
    }

    #[instrument(skip(self), fields(contact_id = %contact, tag_id = %tag), err)]
    async fn remove_tag(&self, contact: ContactId, tag: TagId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE contacts SET tags = array_remove(tags, $2) WHERE id = $1 AND $2 = ANY(tags)",
        )
        .bind(*contact.as_uuid())
        .bind(*tag.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("remove_tag", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.ensure_contact(contact).await?;
        Ok(false)
    }

    #[instrument(skip(self, filter), fields(audience_id = %audience), err)]
    async fn page_audience(
        &self,
        audience: AudienceId,
        filter: &Predicate,
        after: Option<ContactId>,
        limit: usize,
    ) -> Result<Vec<Contact>, StoreError> {
        let mut builder = Self::select_audience(CONTACT_COLUMNS, audience, filter, after, false);
        builder.push(" LIMIT ").push_bind(limit_param(limit));

        let rows = builder
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("page_audience", e))?;

        rows.iter().map(decode::<ContactRow, _>).collect()
    }

    #[instrument(skip(self, filter), fields(audience_id = %audience), err)]
    async fn matching_contact_ids(
        &self,
        audience: AudienceId,
        filter: &Predicate,
    ) -> Result<Vec<ContactId>, StoreError> {
        let mut builder = Self::select_audience("id", audience, filter, None, true);
        let ids: Vec<Uuid> = builder
            .build_query_scalar::<Uuid>()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("matching_contact_ids", e))?;

        Ok(ids.into_iter().map(ContactId::from_uuid).collect())
    }
}

#[async_trait::async_trait]
impl AutomationStore for PostgresMarketingStore {
    #[instrument(skip(self), fields(automation_id = %id), err)]
    async fn get_automation(&self, id: AutomationId) -> Result<Option<Automation>, StoreError> {
        let row = sqlx::query(
            "SELECT id, audience_id, name, active, created_at FROM automations WHERE id = $1",
        )
        .bind(*id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_automation", e))?;

        row.map(|r| decode::<AutomationRow, _>(&r)).transpose()
    }

    #[instrument(skip(self), fields(step_id = %id), err)]
    async fn get_step(&self, id: StepId) -> Result<Option<AutomationStep>, StoreError> {
        let row = sqlx::query(&format!("SELECT {STEP_COLUMNS} FROM automation_steps WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_step", e))?;

        row.map(|r| decode::<StepRow, _>(&r)).transpose()
    }

    #[instrument(skip(self), fields(automation_id = %automation), err)]
    async fn trigger_step(
        &self,
        automation: AutomationId,
    ) -> Result<Option<AutomationStep>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM automation_steps
            WHERE automation_id = $1 AND type = $2 AND parent_id IS NULL
            ORDER BY id ASC
            LIMIT 1
            "#
        ))
        .bind(*automation.as_uuid())
        .bind(StepType::Trigger.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("trigger_step", e))?;

        row.map(|r| decode::<StepRow, _>(&r)).transpose()
    }

    #[instrument(skip(self), fields(automation_id = %automation), err)]
    async fn steps(&self, automation: AutomationId) -> Result<Vec<AutomationStep>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM automation_steps WHERE automation_id = $1 ORDER BY id ASC"
        ))
        .bind(*automation.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("steps", e))?;

        rows.iter().map(decode::<StepRow, _>).collect()
    }

    #[instrument(skip(self), fields(step_id = %step), err)]
    async fn children(&self, step: StepId) -> Result<Vec<AutomationStep>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM automation_steps WHERE parent_id = $1 ORDER BY branch_index ASC, id ASC"
        ))
        .bind(*step.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("children", e))?;

        rows.iter().map(decode::<StepRow, _>).collect()
    }

    #[instrument(skip(self), fields(contact_id = %contact, step_id = %step), err)]
    async fn progress(
        &self,
        contact: ContactId,
        step: StepId,
    ) -> Result<Option<ContactAutomationStep>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT contact_id, step_id, status, branch, created_at, updated_at
            FROM contact_automation_steps
            WHERE contact_id = $1 AND step_id = $2
            "#,
        )
        .bind(*contact.as_uuid())
        .bind(*step.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("progress", e))?;

        row.map(|r| decode::<ProgressRow, _>(&r)).transpose()
    }

    #[instrument(skip(self), fields(contact_id = %contact, step_id = %step), err)]
    async fn record_completion(
        &self,
        contact: ContactId,
        step: StepId,
        branch: Option<u32>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO contact_automation_steps (contact_id, step_id, status, branch, created_at, updated_at)
            VALUES ($1, $2, $3, $4, now(), now())
            ON CONFLICT (contact_id, step_id) DO NOTHING
            "#,
        )
        .bind(*contact.as_uuid())
        .bind(*step.as_uuid())
        .bind(ContactStepStatus::Completed.as_str())
        .bind(branch.map(branch_param))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_completion", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(parent_id = %parent, step_id = %step), err)]
    async fn pending_at_step(
        &self,
        parent: StepId,
        branch: u32,
        step: StepId,
        after: Option<ContactId>,
        limit: usize,
    ) -> Result<Vec<ContactId>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT p.contact_id
            FROM contact_automation_steps AS p
            WHERE p.step_id = $1
              AND p.status = $3
              AND p.branch = $6
              AND ($4::uuid IS NULL OR p.contact_id > $4)
              AND NOT EXISTS (
                  SELECT 1 FROM contact_automation_steps AS c
                  WHERE c.contact_id = p.contact_id AND c.step_id = $2
              )
            ORDER BY p.contact_id ASC
            LIMIT $5
            "#,
        )
        .bind(*parent.as_uuid())
        .bind(*step.as_uuid())
        .bind(ContactStepStatus::Completed.as_str())
        .bind(after.map(|a| *a.as_uuid()))
        .bind(limit_param(limit))
        .bind(branch_param(branch))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_at_step", e))?;

        Ok(ids.into_iter().map(ContactId::from_uuid).collect())
    }
}

#[async_trait::async_trait]
impl BroadcastStore for PostgresMarketingStore {
    #[instrument(skip(self), fields(broadcast_id = %id), err)]
    async fn get_broadcast(&self, id: BroadcastId) -> Result<Option<Broadcast>, StoreError> {
        let row = sqlx::query(&format!("SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_broadcast", e))?;

        row.map(|r| decode::<BroadcastRow, _>(&r)).transpose()
    }

    #[instrument(
        skip(self, broadcast),
        fields(broadcast_id = %broadcast.id, status = broadcast.status.as_str(), expected = expected.as_str()),
        err
    )]
    async fn update_status(
        &self,
        broadcast: &Broadcast,
        expected: BroadcastStatus,
    ) -> Result<bool, StoreError> {
        let planned = broadcast
            .planned_recipients
            .map(|n| i64::try_from(n).unwrap_or(i64::MAX));
        let result = sqlx::query(
            r#"
            UPDATE broadcasts
            SET status = $3,
                planned_recipients = $4,
                failure_reason = $5,
                updated_at = $6
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(*broadcast.id.as_uuid())
        .bind(expected.as_str())
        .bind(broadcast.status.as_str())
        .bind(planned)
        .bind(broadcast.failure_reason.as_deref())
        .bind(broadcast.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(broadcast_id = %broadcast, variant_id = %variant), err)]
    async fn record_winner(
        &self,
        broadcast: BroadcastId,
        variant: VariantId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE broadcasts
            SET winning_variant_id = $2, updated_at = now()
            WHERE id = $1 AND winning_variant_id IS NULL
            "#,
        )
        .bind(*broadcast.as_uuid())
        .bind(*variant.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_winner", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(broadcast_id = %broadcast), err)]
    async fn variants(&self, broadcast: BroadcastId) -> Result<Vec<AbTestVariant>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, broadcast_id, weight, position, from_address, subject, html, text
            FROM ab_test_variants
            WHERE broadcast_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(*broadcast.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("variants", e))?;

        rows.iter().map(decode::<VariantRow, _>).collect()
    }

    #[instrument(skip(self), fields(broadcast_id = %broadcast, contact_id = %contact), err)]
    async fn has_delivery(
        &self,
        broadcast: BroadcastId,
        contact: ContactId,
    ) -> Result<bool, StoreError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM broadcast_deliveries WHERE broadcast_id = $1 AND contact_id = $2)",
        )
        .bind(*broadcast.as_uuid())
        .bind(*contact.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_delivery", e))
    }

    #[instrument(
        skip(self, delivery),
        fields(broadcast_id = %delivery.broadcast_id, contact_id = %delivery.contact_id),
        err
    )]
    async fn record_delivery(&self, delivery: &BroadcastDelivery) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO broadcast_deliveries
                (broadcast_id, contact_id, variant_id, message_id, sent_at, opened_at, clicked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (broadcast_id, contact_id) DO NOTHING
            "#,
        )
        .bind(*delivery.broadcast_id.as_uuid())
        .bind(*delivery.contact_id.as_uuid())
        .bind(delivery.variant_id.map(|v| *v.as_uuid()))
        .bind(delivery.message_id.as_deref())
        .bind(delivery.sent_at)
        .bind(delivery.opened_at)
        .bind(delivery.clicked_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_delivery", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(broadcast_id = %broadcast), err)]
    async fn delivery_count(&self, broadcast: BroadcastId) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM broadcast_deliveries WHERE broadcast_id = $1")
            .bind(*broadcast.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delivery_count", e))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

#[async_trait::async_trait]
impl EngagementMetrics for PostgresMarketingStore {
    #[instrument(skip(self, variants), fields(broadcast_id = %broadcast), err)]
    async fn variant_engagement(
        &self,
        broadcast: BroadcastId,
        variants: &[AbTestVariant],
    ) -> Result<Vec<VariantEngagement>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT variant_id,
                   COUNT(*) AS delivered,
                   COUNT(opened_at) AS opened,
                   COUNT(clicked_at) AS clicked
            FROM broadcast_deliveries
            WHERE broadcast_id = $1 AND variant_id IS NOT NULL AND message_id IS NOT NULL
            GROUP BY variant_id
            "#,
        )
        .bind(*broadcast.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("variant_engagement", e))?;

        let mut counts: HashMap<Uuid, (u64, u64, u64)> = HashMap::new();
        for row in &rows {
            let get = |name: &str| -> Result<u64, StoreError> {
                let n: i64 = row.try_get(name).map_err(|e| StoreError::Decode(e.to_string()))?;
                Ok(u64::try_from(n).unwrap_or(0))
            };
            let id: Uuid = row
                .try_get("variant_id")
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            counts.insert(id, (get("delivered")?, get("opened")?, get("clicked")?));
        }

        Ok(variants
            .iter()
            .map(|variant| {
                let (delivered, opened, clicked) =
                    counts.get(variant.id.as_uuid()).copied().unwrap_or_default();
                VariantEngagement {
                    variant_id: variant.id,
                    position: variant.position,
                    delivered,
                    opened,
                    clicked,
                }
            })
            .collect())
    }
}

/// Decode a row into its domain value.
fn decode<R, T>(row: &PgRow) -> Result<T, StoreError>
where
    R: for<'r> FromRow<'r, PgRow> + TryInto<T, Error = StoreError>,
{
    R::from_row(row)
        .map_err(|e| StoreError::Decode(format!("failed to decode row: {}", e)))?
        .try_into()
}

fn non_negative(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Decode(format!("{column} is negative: {value}")))
}

struct ContactRow {
    id: Uuid,
    audience_id: Uuid,
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    attributes: serde_json::Value,
    tags: Vec<Uuid>,
    subscribed: bool,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ContactRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ContactRow {
            id: row.try_get("id")?,
            audience_id: row.try_get("audience_id")?,
            email: row.try_get("email")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            attributes: row.try_get("attributes")?,
            tags: row.try_get("tags")?,
            subscribed: row.try_get("subscribed")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<ContactRow> for Contact {
    type Error = StoreError;

    fn try_from(row: ContactRow) -> Result<Self, Self::Error> {
        let attributes: BTreeMap<String, String> = serde_json::from_value(row.attributes)
            .map_err(|e| StoreError::Decode(format!("attributes of contact {}: {}", row.id, e)))?;
        Ok(Contact {
            id: ContactId::from_uuid(row.id),
            audience_id: AudienceId::from_uuid(row.audience_id),
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            attributes,
            tags: row.tags.into_iter().map(TagId::from_uuid).collect::<BTreeSet<_>>(),
            subscribed: row.subscribed,
            created_at: row.created_at,
        })
    }
}

struct AutomationRow {
    id: Uuid,
    audience_id: Uuid,
    name: String,
    active: bool,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AutomationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AutomationRow {
            id: row.try_get("id")?,
            audience_id: row.try_get("audience_id")?,
            name: row.try_get("name")?,
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<AutomationRow> for Automation {
    type Error = StoreError;

    fn try_from(row: AutomationRow) -> Result<Self, Self::Error> {
        Ok(Automation {
            id: AutomationId::from_uuid(row.id),
            audience_id: AudienceId::from_uuid(row.audience_id),
            name: row.name,
            active: row.active,
            created_at: row.created_at,
        })
    }
}

struct StepRow {
    id: Uuid,
    automation_id: Uuid,
    step_type: String,
    subtype: String,
    parent_id: Option<Uuid>,
    branch_index: i32,
    config: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, PgRow> for StepRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StepRow {
            id: row.try_get("id")?,
            automation_id: row.try_get("automation_id")?,
            step_type: row.try_get("type")?,
            subtype: row.try_get("subtype")?,
            parent_id: row.try_get("parent_id")?,
            branch_index: row.try_get("branch_index")?,
            config: row.try_get("config")?,
        })
    }
}

impl TryFrom<StepRow> for AutomationStep {
    type Error = StoreError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let step_type = StepType::parse(&row.step_type).ok_or_else(|| {
            StoreError::Decode(format!("unknown step type {} on step {}", row.step_type, row.id))
        })?;
        Ok(AutomationStep {
            id: StepId::from_uuid(row.id),
            automation_id: AutomationId::from_uuid(row.automation_id),
            step_type,
            subtype: row.subtype,
            parent_id: row.parent_id.map(StepId::from_uuid),
            branch_index: non_negative(row.branch_index, "branch_index")?,
            config: row.config,
        })
    }
}

struct ProgressRow {
    contact_id: Uuid,
    step_id: Uuid,
    status: String,
    branch: Option<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ProgressRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProgressRow {
            contact_id: row.try_get("contact_id")?,
            step_id: row.try_get("step_id")?,
            status: row.try_get("status")?,
            branch: row.try_get("branch")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ProgressRow> for ContactAutomationStep {
    type Error = StoreError;

    fn try_from(row: ProgressRow) -> Result<Self, Self::Error> {
        let status = match row.status.as_str() {
            "COMPLETED" => ContactStepStatus::Completed,
            other => {
                return Err(StoreError::Decode(format!("unknown progress status {other}")));
            }
        };
        Ok(ContactAutomationStep {
            contact_id: ContactId::from_uuid(row.contact_id),
            step_id: StepId::from_uuid(row.step_id),
            status,
            branch: row.branch.map(|b| non_negative(b, "branch")).transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

struct BroadcastRow {
    id: Uuid,
    audience_id: Uuid,
    filter: Option<serde_json::Value>,
    is_ab_test: bool,
    waiting_time_to_pick_winner: i32,
    status: String,
    content: EmailContent,
    planned_recipients: Option<i64>,
    winning_variant_id: Option<Uuid>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn content_from_row(row: &PgRow) -> Result<EmailContent, sqlx::Error> {
    Ok(EmailContent {
        from: row.try_get("from_address")?,
        subject: row.try_get("subject")?,
        html: row.try_get("html")?,
        text: row.try_get("text")?,
    })
}

impl<'r> sqlx::FromRow<'r, PgRow> for BroadcastRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BroadcastRow {
            id: row.try_get("id")?,
            audience_id: row.try_get("audience_id")?,
            filter: row.try_get("filter")?,
            is_ab_test: row.try_get("is_ab_test")?,
            waiting_time_to_pick_winner: row.try_get("waiting_time_to_pick_winner")?,
            status: row.try_get("status")?,
            content: content_from_row(row)?,
            planned_recipients: row.try_get("planned_recipients")?,
            winning_variant_id: row.try_get("winning_variant_id")?,
            failure_reason: row.try_get("failure_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<BroadcastRow> for Broadcast {
    type Error = StoreError;

    fn try_from(row: BroadcastRow) -> Result<Self, Self::Error> {
        let status = BroadcastStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Decode(format!("unknown status {} on broadcast {}", row.status, row.id))
        })?;
        let filter = row
            .filter
            .filter(|f| !f.is_null())
            .map(serde_json::from_value::<FilterGroups>)
            .transpose()
            .map_err(|e| StoreError::Decode(format!("filter of broadcast {}: {}", row.id, e)))?;
        Ok(Broadcast {
            id: BroadcastId::from_uuid(row.id),
            audience_id: AudienceId::from_uuid(row.audience_id),
            filter,
            is_ab_test: row.is_ab_test,
            waiting_time_to_pick_winner: non_negative(
                row.waiting_time_to_pick_winner,
                "waiting_time_to_pick_winner",
            )?,
            status,
            content: row.content,
            planned_recipients: row.planned_recipients.map(|n| u64::try_from(n).unwrap_or(0)),
            winning_variant_id: row.winning_variant_id.map(VariantId::from_uuid),
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

struct VariantRow {
    id: Uuid,
    broadcast_id: Uuid,
    weight: i32,
    position: i32,
    content: EmailContent,
}

impl<'r> sqlx::FromRow<'r, PgRow> for VariantRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(VariantRow {
            id: row.try_get("id")?,
            broadcast_id: row.try_get("broadcast_id")?,
            weight: row.try_get("weight")?,
            position: row.try_get("position")?,
            content: content_from_row(row)?,
        })
    }
}

impl TryFrom<VariantRow> for AbTestVariant {
    type Error = StoreError;

    fn try_from(row: VariantRow) -> Result<Self, Self::Error> {
        Ok(AbTestVariant {
            id: VariantId::from_uuid(row.id),
            broadcast_id: BroadcastId::from_uuid(row.broadcast_id),
            weight: non_negative(row.weight, "weight")?,
            position: non_negative(row.position, "position")?,
            content: row.content,
        })
    }
}
