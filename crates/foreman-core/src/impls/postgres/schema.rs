//! DDL for the PostgreSQL backend.
//!
//! Every table is append-only. The only `UPDATE` the engine ever issues is
//! the webhook correlation fix-up on `webhook_responses.provider_request_id`.

use sqlx::PgPool;

use crate::domain::{EngineError, WorkflowFamily};

use super::store_err;

/// Task store and webhook tables shared by all workflow families.
pub const CORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id           TEXT PRIMARY KEY,
    task_type    TEXT NOT NULL,
    payload      JSONB NOT NULL,
    enqueued_at  TIMESTAMPTZ NOT NULL,
    scheduled_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS tasks_schedule_idx ON tasks (scheduled_at, id);

CREATE TABLE IF NOT EXISTS task_leases (
    id         TEXT PRIMARY KEY,
    task_id    TEXT NOT NULL REFERENCES tasks (id),
    leased_at  TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS task_leases_task_idx ON task_leases (task_id, expires_at);

CREATE TABLE IF NOT EXISTS task_completions (
    task_id      TEXT PRIMARY KEY REFERENCES tasks (id),
    completed_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS task_errors (
    id         BIGSERIAL PRIMARY KEY,
    task_id    TEXT NOT NULL REFERENCES tasks (id),
    message    TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS task_errors_task_idx ON task_errors (task_id);

CREATE TABLE IF NOT EXISTS webhook_responses (
    id                  TEXT PRIMARY KEY,
    provider_request_id TEXT,
    raw_body            BYTEA NOT NULL,
    signature_header    BYTEA NOT NULL,
    received_at         TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS webhook_responses_request_idx
    ON webhook_responses (provider_request_id, received_at);

CREATE TABLE IF NOT EXISTS webhook_correlations (
    family              TEXT NOT NULL,
    root_id             TEXT NOT NULL,
    attempt_id          TEXT NOT NULL,
    provider_request_id TEXT NOT NULL,
    created_at          TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (family, attempt_id)
);
"#;

/// The roots / attempts / succeeded / failed / root_failures tables of one
/// family. Failure facts are keyed by attempt, like success facts.
pub fn family_schema(family: &WorkflowFamily) -> String {
    let f = family.as_str();
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {f}_roots (
    id            TEXT PRIMARY KEY,
    metadata      JSONB NOT NULL,
    parent_family TEXT,
    parent_id     TEXT,
    created_at    TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS {f}_roots_parent_idx ON {f}_roots (parent_family, parent_id);

CREATE TABLE IF NOT EXISTS {f}_attempts (
    id         TEXT PRIMARY KEY,
    root_id    TEXT NOT NULL REFERENCES {f}_roots (id),
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS {f}_attempts_root_idx ON {f}_attempts (root_id);

CREATE TABLE IF NOT EXISTS {f}_succeeded (
    attempt_id TEXT PRIMARY KEY REFERENCES {f}_attempts (id),
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS {f}_failed (
    attempt_id    TEXT PRIMARY KEY REFERENCES {f}_attempts (id),
    error_message TEXT NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS {f}_root_failures (
    root_id    TEXT PRIMARY KEY REFERENCES {f}_roots (id),
    message    TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
"#
    )
}

/// Idempotent. Not a migration tool; existing tables are left untouched.
pub async fn install_schema(pool: &PgPool, families: &[WorkflowFamily]) -> Result<(), EngineError> {
    sqlx::raw_sql(CORE_SCHEMA)
        .execute(pool)
        .await
        .map_err(store_err("install core schema"))?;
    for family in families {
        sqlx::raw_sql(&family_schema(family))
            .execute(pool)
            .await
            .map_err(store_err("install family schema"))?;
    }
    Ok(())
}
