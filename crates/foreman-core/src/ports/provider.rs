//! Provider port - channel processor が持つ外部呼び出し
//!
//! messaging provider, storage-signing service, transcription API など。
//! 失敗は task レベルのエラーであり、エンジンのエラーではありません。

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// `request` is the payload produced by the before handler.
    async fn call(&self, request: &serde_json::Value) -> Result<serde_json::Value, ProviderError>;
}
