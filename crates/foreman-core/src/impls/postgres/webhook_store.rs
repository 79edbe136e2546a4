//! PostgreSQL webhook store.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::domain::{AttemptRef, EngineError, WebhookId, WebhookResponse};
use crate::ports::{Clock, IdGenerator, WebhookStore};

use super::{parse_id, store_err};

#[derive(Clone)]
pub struct PgWebhookStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl PgWebhookStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { pool, clock, ids }
    }
}

fn response_from_row(row: &PgRow) -> Result<WebhookResponse, EngineError> {
    let decode = || store_err("decode webhook response");
    let id: String = row.try_get("id").map_err(decode())?;
    Ok(WebhookResponse {
        id: parse_id(&id)?,
        provider_request_id: row.try_get("provider_request_id").map_err(decode())?,
        raw_body: row.try_get("raw_body").map_err(decode())?,
        signature_header: row.try_get("signature_header").map_err(decode())?,
        received_at: row.try_get("received_at").map_err(decode())?,
    })
}

#[async_trait]
impl WebhookStore for PgWebhookStore {
    async fn store(
        &self,
        provider_request_id: Option<String>,
        raw_body: Vec<u8>,
        signature_header: Vec<u8>,
    ) -> Result<WebhookResponse, EngineError> {
        let response = WebhookResponse {
            id: self.ids.webhook_id(),
            provider_request_id,
            raw_body,
            signature_header,
            received_at: self.clock.now(),
        };
        sqlx::query(
            r#"
            INSERT INTO webhook_responses
                (id, provider_request_id, raw_body, signature_header, received_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(response.id.as_ulid().to_string())
        .bind(&response.provider_request_id)
        .bind(&response.raw_body)
        .bind(&response.signature_header)
        .bind(response.received_at)
        .execute(&self.pool)
        .await
        .map_err(store_err("store webhook"))?;
        Ok(response)
    }

    async fn get(&self, id: WebhookId) -> Result<Option<WebhookResponse>, EngineError> {
        let row = sqlx::query(
            r#"
            SELECT id, provider_request_id, raw_body, signature_header, received_at
            FROM webhook_responses WHERE id = $1
            "#,
        )
        .bind(id.as_ulid().to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("get webhook"))?;
        row.as_ref().map(response_from_row).transpose()
    }

    async fn set_request_id(
        &self,
        id: WebhookId,
        provider_request_id: &str,
    ) -> Result<(), EngineError> {
        let done = sqlx::query("UPDATE webhook_responses SET provider_request_id = $2 WHERE id = $1")
            .bind(id.as_ulid().to_string())
            .bind(provider_request_id)
            .execute(&self.pool)
            .await
            .map_err(store_err("set webhook request id"))?;
        if done.rows_affected() == 0 {
            return Err(EngineError::Store(format!("webhook response {id} not found")));
        }
        Ok(())
    }

    async fn responses_for_request(
        &self,
        provider_request_id: &str,
    ) -> Result<Vec<WebhookResponse>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT id, provider_request_id, raw_body, signature_header, received_at
            FROM webhook_responses
            WHERE provider_request_id = $1
            ORDER BY received_at, id
            "#,
        )
        .bind(provider_request_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("responses for request"))?;
        rows.iter().map(response_from_row).collect()
    }

    async fn correlate(
        &self,
        provider_request_id: &str,
        attempt: &AttemptRef,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_correlations
                (family, root_id, attempt_id, provider_request_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (family, attempt_id) DO NOTHING
            "#,
        )
        .bind(attempt.family.as_str())
        .bind(attempt.root_id.as_ulid().to_string())
        .bind(attempt.attempt_id.as_ulid().to_string())
        .bind(provider_request_id)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await
        .map_err(store_err("correlate"))?;
        Ok(())
    }

    async fn request_for_attempt(
        &self,
        attempt: &AttemptRef,
    ) -> Result<Option<String>, EngineError> {
        let row = sqlx::query(
            "SELECT provider_request_id FROM webhook_correlations WHERE family = $1 AND attempt_id = $2",
        )
        .bind(attempt.family.as_str())
        .bind(attempt.attempt_id.as_ulid().to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("request for attempt"))?;
        row.map(|r| {
            r.try_get("provider_request_id")
                .map_err(store_err("decode correlation"))
        })
        .transpose()
    }
}
