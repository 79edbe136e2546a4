//! WebhookStore port - 未認証コールバックの保存先
//!
//! ingress は検証せずに生バイトと署名ヘッダをそのまま保存します。
//! 検証は後で supervisor が行います。

use async_trait::async_trait;

use crate::domain::{AttemptRef, EngineError, WebhookId, WebhookResponse};

#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Blind store. Never rejects a body.
    async fn store(
        &self,
        provider_request_id: Option<String>,
        raw_body: Vec<u8>,
        signature_header: Vec<u8>,
    ) -> Result<WebhookResponse, EngineError>;

    async fn get(&self, id: WebhookId) -> Result<Option<WebhookResponse>, EngineError>;

    /// Correct correlation metadata. The only mutation a response ever sees.
    async fn set_request_id(
        &self,
        id: WebhookId,
        provider_request_id: &str,
    ) -> Result<(), EngineError>;

    /// All responses for a provider request, oldest first.
    async fn responses_for_request(
        &self,
        provider_request_id: &str,
    ) -> Result<Vec<WebhookResponse>, EngineError>;

    /// Bind a provider request id to the attempt that started it.
    async fn correlate(
        &self,
        provider_request_id: &str,
        attempt: &AttemptRef,
    ) -> Result<(), EngineError>;

    async fn request_for_attempt(
        &self,
        attempt: &AttemptRef,
    ) -> Result<Option<String>, EngineError>;
}
