//! In-memory webhook store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::{AttemptRef, EngineError, WebhookId, WebhookResponse};
use crate::ports::{Clock, IdGenerator, WebhookStore};

#[derive(Default)]
struct WebhookState {
    /// Insertion order is arrival order.
    responses: Vec<WebhookResponse>,
    correlations: HashMap<AttemptRef, String>,
}

pub struct InMemoryWebhookStore {
    state: Mutex<WebhookState>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryWebhookStore {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Mutex::new(WebhookState::default()),
            clock,
            ids,
        }
    }
}

#[async_trait]
impl WebhookStore for InMemoryWebhookStore {
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
        self.state.lock().await.responses.push(response.clone());
        Ok(response)
    }

    async fn get(&self, id: WebhookId) -> Result<Option<WebhookResponse>, EngineError> {
        let state = self.state.lock().await;
        Ok(state.responses.iter().find(|r| r.id == id).cloned())
    }

    async fn set_request_id(
        &self,
        id: WebhookId,
        provider_request_id: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let response = state
            .responses
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| EngineError::Store(format!("webhook response {id} not found")))?;
        response.provider_request_id = Some(provider_request_id.to_string());
        Ok(())
    }

    async fn responses_for_request(
        &self,
        provider_request_id: &str,
    ) -> Result<Vec<WebhookResponse>, EngineError> {
        let state = self.state.lock().await;
        Ok(state
            .responses
            .iter()
            .filter(|r| r.provider_request_id.as_deref() == Some(provider_request_id))
            .cloned()
            .collect())
    }

    async fn correlate(
        &self,
        provider_request_id: &str,
        attempt: &AttemptRef,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        match state.correlations.get(attempt) {
            Some(existing) if existing != provider_request_id => {
                warn!(
                    family = %attempt.family,
                    attempt_id = %attempt.attempt_id,
                    existing = %existing,
                    ignored = %provider_request_id,
                    "attempt already correlated; keeping first request id"
                );
            }
            Some(_) => {}
            None => {
                state
                    .correlations
                    .insert(attempt.clone(), provider_request_id.to_string());
            }
        }
        Ok(())
    }

    async fn request_for_attempt(
        &self,
        attempt: &AttemptRef,
    ) -> Result<Option<String>, EngineError> {
        Ok(self.state.lock().await.correlations.get(attempt).cloned())
    }
}
