//! PayloadCodec - JSON payload と Rust 型の相互変換
//!
//! デコード失敗は呼び出し側のバグ（validation failure）として扱い、
//! `HandlerResult` の値に変換します。エンジンのエラーにはしません。

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::domain::HandlerResult;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("decode {target}: {source}")]
    Decode {
        target: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode: {0}")]
    Encode(#[source] serde_json::Error),
}

impl From<CodecError> for HandlerResult {
    fn from(e: CodecError) -> Self {
        HandlerResult::validation(e.to_string())
    }
}

pub struct PayloadCodec;

impl PayloadCodec {
    pub fn decode<T: DeserializeOwned>(value: &serde_json::Value) -> Result<T, CodecError> {
        T::deserialize(value).map_err(|source| CodecError::Decode {
            target: short_type_name::<T>(),
            source,
        })
    }

    pub fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, CodecError> {
        serde_json::to_value(value).map_err(CodecError::Encode)
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, ResultStatus};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct MessageRef {
        message_id: u64,
    }

    #[test]
    fn decode_success() {
        let decoded: MessageRef = PayloadCodec::decode(&json!({ "message_id": 7 })).unwrap();
        assert_eq!(decoded, MessageRef { message_id: 7 });
    }

    #[test]
    fn decode_failure_becomes_validation_result() {
        let err = PayloadCodec::decode::<MessageRef>(&json!({ "msg": 7 })).unwrap_err();
        assert!(err.to_string().starts_with("decode MessageRef:"));

        let result: HandlerResult = err.into();
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.error_kind, Some(FailureKind::Validation));
        assert!(result.message.unwrap().contains("message_id"));
    }
}
