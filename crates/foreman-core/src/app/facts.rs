//! Fact-recording handlers shipped with the engine.
//!
//! - `RecordSuccess` / `RecordFailure`: 汎用の success / error handler
//! - `CorrelateRequest`: webhook workflow 用の success handler。
//!   provider の request id を attempt に結び付けるだけで、success fact は
//!   書かない（検証済み webhook が届いてから supervisor が書く）
//!
//! いずれも冪等で、想定内の入力で Err を返しません。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::{EngineError, ErrorEnvelope, HandlerResult, SuccessEnvelope, WorkflowFamily};
use crate::ports::{WebhookStore, WorkflowStore};
use crate::typed::{ErrorHandler, SuccessHandler};

pub const RECORD_SUCCESS: &str = "engine.record_success";
pub const RECORD_FAILURE: &str = "engine.record_failure";

pub fn correlate_handler_name(family: &WorkflowFamily) -> String {
    format!("engine.correlate.{family}")
}

pub struct RecordSuccess {
    workflows: Arc<dyn WorkflowStore>,
}

impl RecordSuccess {
    pub fn new(workflows: Arc<dyn WorkflowStore>) -> Self {
        Self { workflows }
    }
}

#[async_trait]
impl SuccessHandler for RecordSuccess {
    async fn on_success(&self, envelope: &SuccessEnvelope) -> Result<HandlerResult, EngineError> {
        let attempt = &envelope.payload.attempt;
        let written = self.workflows.record_success(attempt).await?;
        debug!(family = %attempt.family, attempt_id = %attempt.attempt_id, written, "success fact");
        Ok(HandlerResult::ok())
    }
}

pub struct RecordFailure {
    workflows: Arc<dyn WorkflowStore>,
}

impl RecordFailure {
    pub fn new(workflows: Arc<dyn WorkflowStore>) -> Self {
        Self { workflows }
    }
}

#[async_trait]
impl ErrorHandler for RecordFailure {
    async fn on_error(&self, envelope: &ErrorEnvelope) -> Result<HandlerResult, EngineError> {
        let attempt = &envelope.payload.attempt;
        let message = format!("{}: {}", envelope.error_kind.as_str(), envelope.error_message);
        let written = self.workflows.record_failure(attempt, &message).await?;
        debug!(family = %attempt.family, attempt_id = %attempt.attempt_id, written, "failure fact");
        Ok(HandlerResult::ok())
    }
}

pub struct CorrelateRequest {
    webhooks: Arc<dyn WebhookStore>,
    workflows: Arc<dyn WorkflowStore>,
    pointer: String,
}

impl CorrelateRequest {
    /// `pointer` locates the provider request id in the provider result.
    pub fn new(
        webhooks: Arc<dyn WebhookStore>,
        workflows: Arc<dyn WorkflowStore>,
        pointer: impl Into<String>,
    ) -> Self {
        Self {
            webhooks,
            workflows,
            pointer: pointer.into(),
        }
    }
}

#[async_trait]
impl SuccessHandler for CorrelateRequest {
    async fn on_success(&self, envelope: &SuccessEnvelope) -> Result<HandlerResult, EngineError> {
        let attempt = &envelope.payload.attempt;
        let request_id = match envelope.provider_result.pointer(&self.pointer) {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let Some(request_id) = request_id else {
            // Nothing will ever correlate with this attempt.
            let message = format!("provider result has no request id at {}", self.pointer);
            warn!(family = %attempt.family, attempt_id = %attempt.attempt_id, "{message}");
            self.workflows.record_failure(attempt, &message).await?;
            return Ok(HandlerResult::validation(message));
        };

        self.webhooks.correlate(&request_id, attempt).await?;
        debug!(
            family = %attempt.family,
            attempt_id = %attempt.attempt_id,
            provider_request_id = %request_id,
            "awaiting webhook"
        );
        Ok(HandlerResult::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttemptRef, ChannelPayload, FailureKind, WorkflowFamily};
    use crate::impls::{InMemoryTaskStore, InMemoryWebhookStore, InMemoryWorkflowStore};
    use crate::ports::{Clock, FixedClock, IdGenerator, UlidGenerator};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        workflows: Arc<InMemoryWorkflowStore>,
        webhooks: Arc<InMemoryWebhookStore>,
        payload: ChannelPayload,
    }

    async fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let tasks = Arc::new(InMemoryTaskStore::new(
            clock.clone(),
            ids.clone(),
            Duration::from_secs(300),
        ));
        let workflows = Arc::new(InMemoryWorkflowStore::new(tasks, clock.clone(), ids.clone()));
        let webhooks = Arc::new(InMemoryWebhookStore::new(clock, ids));

        let family = WorkflowFamily::new("transcription").unwrap();
        let root = workflows.create_root(&family, json!({}), None).await.unwrap();
        let mut tx = workflows.lock_root(&root.root_ref()).await.unwrap();
        let attempt = tx.create_attempt().await.unwrap();
        tx.commit().await.unwrap();

        Fixture {
            workflows,
            webhooks,
            payload: ChannelPayload {
                before_handler: "b".into(),
                success_handler: RECORD_SUCCESS.into(),
                error_handler: RECORD_FAILURE.into(),
                attempt: AttemptRef {
                    family,
                    root_id: root.id,
                    attempt_id: attempt.id,
                },
                data: json!({}),
            },
        }
    }

    #[tokio::test]
    async fn record_success_is_idempotent() {
        let f = fixture().await;
        let handler = RecordSuccess::new(f.workflows.clone());
        let envelope = SuccessEnvelope {
            payload: f.payload.clone(),
            provider_result: json!({}),
        };

        assert!(handler.on_success(&envelope).await.unwrap().is_ok());
        assert!(handler.on_success(&envelope).await.unwrap().is_ok());

        let summary = f.workflows.summary(&f.payload.attempt.root()).await.unwrap();
        assert!(summary.succeeded);
        assert_eq!(summary.attempts, 1);
    }

    #[tokio::test]
    async fn record_failure_keeps_first_message() {
        let f = fixture().await;
        let handler = RecordFailure::new(f.workflows.clone());
        for message in ["timeout", "again"] {
            let envelope = ErrorEnvelope {
                payload: f.payload.clone(),
                error_kind: FailureKind::Provider,
                error_message: message.into(),
            };
            assert!(handler.on_error(&envelope).await.unwrap().is_ok());
        }

        let facts = f.workflows.attempts(&f.payload.attempt.root()).await.unwrap();
        assert_eq!(facts[0].failed.as_ref().unwrap().error_message, "provider: timeout");
        let summary = f.workflows.summary(&f.payload.attempt.root()).await.unwrap();
        assert_eq!(summary.failed_count, 1);
    }

    #[tokio::test]
    async fn correlate_binds_request_without_success() {
        let f = fixture().await;
        let handler = CorrelateRequest::new(f.webhooks.clone(), f.workflows.clone(), "/job/id");
        let envelope = SuccessEnvelope {
            payload: f.payload.clone(),
            provider_result: json!({ "job": { "id": "job-77" } }),
        };

        assert!(handler.on_success(&envelope).await.unwrap().is_ok());
        assert_eq!(
            f.webhooks
                .request_for_attempt(&f.payload.attempt)
                .await
                .unwrap()
                .as_deref(),
            Some("job-77")
        );
        let summary = f.workflows.summary(&f.payload.attempt.root()).await.unwrap();
        assert!(!summary.succeeded);
        assert_eq!(summary.outstanding, 1);
    }

    #[tokio::test]
    async fn correlate_without_request_id_fails_the_attempt() {
        let f = fixture().await;
        let handler = CorrelateRequest::new(f.webhooks.clone(), f.workflows.clone(), "/job/id");
        let envelope = SuccessEnvelope {
            payload: f.payload.clone(),
            provider_result: json!({ "job": {} }),
        };

        let result = handler.on_success(&envelope).await.unwrap();
        assert_eq!(result.error_kind, Some(FailureKind::Validation));
        let summary = f.workflows.summary(&f.payload.attempt.root()).await.unwrap();
        assert_eq!(summary.failed_count, 1);
    }
}
