//! Stored webhook responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::WebhookId;

/// An unauthenticated callback exactly as it arrived.
///
/// `raw_body` and `signature_header` are byte-exact; re-serializing either
/// would break signature matching. Only `provider_request_id` may change
/// afterwards (correlation fix-ups).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub id: WebhookId,
    pub provider_request_id: Option<String>,
    pub raw_body: Vec<u8>,
    pub signature_header: Vec<u8>,
    pub received_at: DateTime<Utc>,
}
