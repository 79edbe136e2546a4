//! Envelopes exchanged between processors and named handlers.
//!
//! Every named function (before / success / error / business function)
//! answers with the same tagged [`HandlerResult`]. Expected failures are
//! values here, not errors.

use serde::{Deserialize, Serialize};

use super::facts::AttemptRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    Error,
}

/// Why a handler reported `status = error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Missing or malformed identifiers. Not retried by the engine.
    Validation,
    /// The external call failed. Retried through a new Attempt.
    Provider,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Provider => "provider",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerResult {
    pub status: ResultStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl HandlerResult {
    pub fn ok() -> Self {
        Self {
            status: ResultStatus::Ok,
            error_kind: None,
            message: None,
            payload: None,
        }
    }

    pub fn ok_with(payload: serde_json::Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::ok()
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::failure(FailureKind::Validation, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::failure(FailureKind::Provider, message)
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Error,
            error_kind: Some(kind),
            message: Some(message.into()),
            payload: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }

    /// Message suitable for an error entry or failure fact.
    pub fn describe(&self) -> String {
        match (self.error_kind, &self.message) {
            (Some(kind), Some(msg)) => format!("{}: {msg}", kind.as_str()),
            (None, Some(msg)) => msg.clone(),
            (Some(kind), None) => kind.as_str().to_string(),
            (None, None) => format!("handler returned status {:?}", self.status),
        }
    }
}

/// Payload of an `engine.function` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub function: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Payload of a channel task, as written by a supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub before_handler: String,
    pub success_handler: String,
    pub error_handler: String,
    pub attempt: AttemptRef,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Input of a success handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessEnvelope {
    pub payload: ChannelPayload,
    pub provider_result: serde_json::Value,
}

/// Input of an error handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub payload: ChannelPayload,
    pub error_kind: FailureKind,
    pub error_message: String,
}
