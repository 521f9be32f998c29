//! Table definitions for the Postgres backends.
//!
//! Statements are idempotent and run at worker start-up.

use sqlx::PgPool;
use tracing::info;

use super::{map_sqlx_error, StoreError};

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        job_type TEXT NOT NULL,
        queue TEXT NOT NULL,
        payload JSONB NOT NULL,
        dispatched_at TIMESTAMPTZ NOT NULL,
        locked_at TIMESTAMPTZ,
        timeout_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        dead_lettered_at TIMESTAMPTZ,
        attempts_count INTEGER NOT NULL DEFAULT 0,
        attempt_logs JSONB NOT NULL DEFAULT '[]'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_pending_idx
        ON jobs (queue, dispatched_at, id)
        WHERE completed_at IS NULL AND dead_lettered_at IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS contacts (
        id UUID PRIMARY KEY,
        audience_id UUID NOT NULL,
        email TEXT NOT NULL,
        first_name TEXT,
        last_name TEXT,
        attributes JSONB NOT NULL DEFAULT '{}'::jsonb,
        tags UUID[] NOT NULL DEFAULT '{}',
        subscribed BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS contacts_audience_idx ON contacts (audience_id, id)",
    r#"
    CREATE TABLE IF NOT EXISTS automations (
        id UUID PRIMARY KEY,
        audience_id UUID NOT NULL,
        name TEXT NOT NULL,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS automation_steps (
        id UUID PRIMARY KEY,
        automation_id UUID NOT NULL REFERENCES automations (id),
        type TEXT NOT NULL,
        subtype TEXT NOT NULL,
        parent_id UUID REFERENCES automation_steps (id),
        branch_index INTEGER NOT NULL DEFAULT 0,
        config JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
    "CREATE INDEX IF NOT EXISTS automation_steps_parent_idx ON automation_steps (parent_id, branch_index)",
    r#"
    CREATE TABLE IF NOT EXISTS contact_automation_steps (
        contact_id UUID NOT NULL,
        step_id UUID NOT NULL REFERENCES automation_steps (id),
        status TEXT NOT NULL,
        branch INTEGER,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (contact_id, step_id)
    )
    "#,
    "ALTER TABLE contact_automation_steps ADD COLUMN IF NOT EXISTS branch INTEGER",
    "CREATE INDEX IF NOT EXISTS contact_automation_steps_step_idx ON contact_automation_steps (step_id, contact_id)",
    r#"
    CREATE TABLE IF NOT EXISTS broadcasts (
        id UUID PRIMARY KEY,
        audience_id UUID NOT NULL,
        filter JSONB,
        is_ab_test BOOLEAN NOT NULL DEFAULT FALSE,
        waiting_time_to_pick_winner INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        from_address TEXT NOT NULL,
        subject TEXT NOT NULL,
        html TEXT NOT NULL,
        text TEXT,
        planned_recipients BIGINT,
        winning_variant_id UUID,
        failure_reason TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ab_test_variants (
        id UUID PRIMARY KEY,
        broadcast_id UUID NOT NULL REFERENCES broadcasts (id),
        weight INTEGER NOT NULL,
        position INTEGER NOT NULL,
        from_address TEXT NOT NULL,
        subject TEXT NOT NULL,
        html TEXT NOT NULL,
        text TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS broadcast_deliveries (
        broadcast_id UUID NOT NULL REFERENCES broadcasts (id),
        contact_id UUID NOT NULL,
        variant_id UUID,
        message_id TEXT,
        sent_at TIMESTAMPTZ NOT NULL,
        opened_at TIMESTAMPTZ,
        clicked_at TIMESTAMPTZ,
        PRIMARY KEY (broadcast_id, contact_id)
    )
    "#,
];

/// Create every table and index the workers use.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
    }
    info!(statements = STATEMENTS.len(), "schema ready");
    Ok(())
}
