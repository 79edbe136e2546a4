//! Webhook store-and-verify
//!
//! - **WebhookIngress**: 検証せずに生バイトと署名ヘッダを保存して即 ack
//! - **WebhookVerifier**: HMAC-SHA256 署名と timestamp 許容幅のチェック
//! - **WebhookCommit**: 検証済み payload をドメインに反映する
//!
//! 検証と commit は supervisor が root lock の中で行います
//! （[`Supervisor`](super::supervisor::Supervisor) の reconcile）。
//!
//! # 署名形式
//! `t=<unix seconds>,v1=<hex HMAC-SHA256("<t>." ++ raw_body)>`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::domain::{AttemptRef, EngineError, HandlerResult, WebhookResponse};
use crate::ports::WebhookStore;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("malformed signature header: {0}")]
    MalformedHeader(String),

    #[error("signature timestamp {signed_at} is {skew_secs}s away from arrival (tolerance {tolerance_secs}s)")]
    OutsideTolerance {
        signed_at: i64,
        skew_secs: u64,
        tolerance_secs: u64,
    },

    #[error("signature mismatch")]
    Mismatch,

    #[error("unusable signing key")]
    Key,
}

/// Blind ingress. Never rejects a body and never looks at the signature.
pub struct WebhookIngress {
    store: Arc<dyn WebhookStore>,
    /// JSON pointer to the provider request id inside the body, e.g. `/request_id`.
    request_id_pointer: Option<String>,
}

impl WebhookIngress {
    pub fn new(store: Arc<dyn WebhookStore>, request_id_pointer: Option<String>) -> Self {
        Self {
            store,
            request_id_pointer,
        }
    }

    /// Best effort; `None` if the body is not JSON or has no id at the pointer.
    pub fn extract_request_id(&self, raw_body: &[u8]) -> Option<String> {
        let pointer = self.request_id_pointer.as_deref()?;
        let body: serde_json::Value = serde_json::from_slice(raw_body).ok()?;
        match body.pointer(pointer)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub async fn receive(
        &self,
        raw_body: Vec<u8>,
        signature_header: Vec<u8>,
    ) -> Result<WebhookResponse, EngineError> {
        let request_id = self.extract_request_id(&raw_body);
        let stored = self.store.store(request_id, raw_body, signature_header).await?;
        debug!(
            webhook_id = %stored.id,
            provider_request_id = ?stored.provider_request_id,
            bytes = stored.raw_body.len(),
            "webhook stored"
        );
        Ok(stored)
    }
}

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"<redacted>")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    fn mac(&self, signed_at: i64, body: &[u8]) -> Result<HmacSha256, VerifyError> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.secret).map_err(|_| VerifyError::Key)?;
        mac.update(signed_at.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(mac)
    }

    /// Header value for `body` signed at `signed_at` (unix seconds).
    pub fn sign(&self, body: &[u8], signed_at: i64) -> Result<String, VerifyError> {
        let tag = self.mac(signed_at, body)?.finalize().into_bytes();
        Ok(format!("t={signed_at},v1={}", hex::encode(tag)))
    }

    /// Checks the stored bytes exactly as received. Constant-time compare.
    pub fn verify(&self, response: &WebhookResponse) -> Result<(), VerifyError> {
        let (signed_at, signature) = parse_header(&response.signature_header)?;

        // t= は送信者が自由に決められるので差は u64 で取る
        let skew_secs = response.received_at.timestamp().abs_diff(signed_at);
        if skew_secs > self.tolerance.as_secs() {
            return Err(VerifyError::OutsideTolerance {
                signed_at,
                skew_secs,
                tolerance_secs: self.tolerance.as_secs(),
            });
        }

        self.mac(signed_at, &response.raw_body)?
            .verify_slice(&signature)
            .map_err(|_| VerifyError::Mismatch)
    }
}

fn parse_header(raw: &[u8]) -> Result<(i64, Vec<u8>), VerifyError> {
    let header = std::str::from_utf8(raw)
        .map_err(|_| VerifyError::MalformedHeader("not utf-8".into()))?;

    let mut signed_at = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => {
                signed_at = Some(v.parse::<i64>().map_err(|_| {
                    VerifyError::MalformedHeader(format!("bad timestamp {v:?}"))
                })?);
            }
            Some(("v1", v)) => {
                signature = Some(
                    hex::decode(v)
                        .map_err(|_| VerifyError::MalformedHeader("v1 is not hex".into()))?,
                );
            }
            _ => {}
        }
    }

    match (signed_at, signature) {
        (Some(t), Some(sig)) => Ok((t, sig)),
        (None, _) => Err(VerifyError::MalformedHeader("missing t=".into())),
        (_, None) => Err(VerifyError::MalformedHeader("missing v1=".into())),
    }
}

/// Applies a verified webhook body to the business domain.
///
/// Runs under the root lock, so it must be quick and must not call out to
/// providers. A non-ok result becomes a failure fact on the attempt.
#[async_trait]
pub trait WebhookCommit: Send + Sync {
    async fn commit(
        &self,
        attempt: &AttemptRef,
        body: serde_json::Value,
    ) -> Result<HandlerResult, EngineError>;
}

/// Attaches store-and-verify to a channel workflow.
#[derive(Clone)]
pub struct WebhookBinding {
    pub verifier: WebhookVerifier,
    pub commit: Arc<dyn WebhookCommit>,
    /// JSON pointer to the provider request id inside the provider result.
    pub provider_request_pointer: String,
}

impl WebhookBinding {
    pub fn new(
        verifier: WebhookVerifier,
        commit: Arc<dyn WebhookCommit>,
        provider_request_pointer: impl Into<String>,
    ) -> Self {
        Self {
            verifier,
            commit,
            provider_request_pointer: provider_request_pointer.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WebhookId;
    use crate::impls::InMemoryWebhookStore;
    use crate::ports::{Clock, FixedClock, UlidGenerator};
    use chrono::{DateTime, TimeZone, Utc};
    use ulid::Ulid;

    const SECRET: &[u8] = b"whsec_test";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap()
    }

    fn response(body: &[u8], header: String, received_at: DateTime<Utc>) -> WebhookResponse {
        WebhookResponse {
            id: WebhookId::from_ulid(Ulid::new()),
            provider_request_id: Some("req-1".into()),
            raw_body: body.to_vec(),
            signature_header: header.into_bytes(),
            received_at,
        }
    }

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(SECRET, Duration::from_secs(300))
    }

    #[test]
    fn correctly_signed_body_verifies() {
        let body = br#"{"request_id":"req-1","status":"done"}"#;
        let header = verifier().sign(body, t0().timestamp()).unwrap();
        assert!(verifier().verify(&response(body, header, t0())).is_ok());
    }

    #[test]
    fn flipping_one_byte_breaks_the_signature() {
        let body = br#"{"request_id":"req-1","status":"done"}"#;
        let header = verifier().sign(body, t0().timestamp()).unwrap();

        let mut tampered = body.to_vec();
        tampered[5] ^= 0x01;
        assert_eq!(
            verifier().verify(&response(&tampered, header, t0())),
            Err(VerifyError::Mismatch)
        );
    }

    #[test]
    fn reserialized_json_does_not_verify() {
        let body = br#"{ "b": 1, "a": 2 }"#;
        let header = verifier().sign(body, t0().timestamp()).unwrap();
        let normalized =
            serde_json::to_vec(&serde_json::from_slice::<serde_json::Value>(body).unwrap())
                .unwrap();
        assert_eq!(
            verifier().verify(&response(&normalized, header, t0())),
            Err(VerifyError::Mismatch)
        );
    }

    #[test]
    fn wrong_secret_does_not_verify() {
        let body = b"{}";
        let header = WebhookVerifier::new("other", Duration::from_secs(300))
            .sign(body, t0().timestamp()).unwrap();
        assert_eq!(
            verifier().verify(&response(body, header, t0())),
            Err(VerifyError::Mismatch)
        );
    }

    #[test]
    fn timestamp_outside_tolerance_is_rejected() {
        let body = b"{}";
        let signed_at = t0().timestamp() - 301;
        let header = verifier().sign(body, signed_at).unwrap();
        let err = verifier().verify(&response(body, header, t0())).unwrap_err();
        assert!(matches!(err, VerifyError::OutsideTolerance { skew_secs: 301, .. }));

        let header = verifier().sign(body, t0().timestamp() - 300).unwrap();
        assert!(verifier().verify(&response(body, header, t0())).is_ok());
    }

    #[test]
    fn extreme_timestamps_are_outside_tolerance() {
        for signed_at in [i64::MIN, i64::MAX] {
            let header = format!("t={signed_at},v1=00");
            let err = verifier()
                .verify(&response(b"{}", header, t0()))
                .unwrap_err();
            assert!(matches!(err, VerifyError::OutsideTolerance { .. }), "{signed_at}");
        }
    }

    #[test]
    fn malformed_headers_are_rejected() {
        for header in ["", "t=abc,v1=00", "t=1", "v1=00", "t=1,v1=zz"] {
            let err = verifier()
                .verify(&response(b"{}", header.to_string(), t0()))
                .unwrap_err();
            assert!(matches!(err, VerifyError::MalformedHeader(_)), "{header:?}");
        }
    }

    #[tokio::test]
    async fn ingress_stores_without_verifying() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(t0()));
        let store = Arc::new(InMemoryWebhookStore::new(
            clock.clone(),
            Arc::new(UlidGenerator::new(clock)),
        ));
        let ingress = WebhookIngress::new(store.clone(), Some("/request_id".into()));

        let stored = ingress
            .receive(br#"{"request_id":"req-9"}"#.to_vec(), b"garbage".to_vec())
            .await
            .unwrap();
        assert_eq!(stored.provider_request_id.as_deref(), Some("req-9"));

        let unparsable = ingress.receive(b"\xff\xfe".to_vec(), vec![]).await.unwrap();
        assert_eq!(unparsable.provider_request_id, None);
        assert_eq!(
            store.get(unparsable.id).await.unwrap().unwrap().raw_body,
            b"\xff\xfe"
        );
    }

    #[test]
    fn numeric_request_ids_are_extracted() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(t0()));
        let store = Arc::new(InMemoryWebhookStore::new(
            clock.clone(),
            Arc::new(UlidGenerator::new(clock)),
        ));
        let ingress = WebhookIngress::new(store, Some("/data/id".into()));
        assert_eq!(
            ingress.extract_request_id(br#"{"data":{"id":42}}"#).as_deref(),
            Some("42")
        );
        assert_eq!(ingress.extract_request_id(br#"{"data":{}}"#), None);
    }
}
