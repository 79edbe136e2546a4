//! PostgreSQL stores (`postgres` feature).
//!
//! Ids are stored as ULID text, timestamps as `TIMESTAMPTZ`, payloads as
//! `JSONB`, webhook bodies and signature headers as `BYTEA` (byte-exact).
//! Timestamps come from the [`Clock`](crate::ports::Clock) port, not from
//! `now()`, so the in-memory and SQL backends agree on time.

pub mod schema;
pub mod task_store;
pub mod webhook_store;
pub mod workflow_store;

pub use self::schema::{CORE_SCHEMA, family_schema, install_schema};
pub use self::task_store::PgTaskStore;
pub use self::webhook_store::PgWebhookStore;
pub use self::workflow_store::PgWorkflowStore;

use std::str::FromStr;

use crate::domain::EngineError;
use crate::domain::ids::{Id, IdMarker};

fn store_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> EngineError {
    move |e| EngineError::Store(format!("{operation}: {e}"))
}

fn parse_id<T: IdMarker>(raw: &str) -> Result<Id<T>, EngineError> {
    Id::from_str(raw).map_err(|e| EngineError::Store(format!("corrupt id {raw:?}: {e}")))
}
