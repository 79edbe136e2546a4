//! Processors - task_type ごとの実行ロジック
//!
//! - **FunctionProcessor**: `engine.function` task。名前付き business function を呼ぶ
//! - **ChannelProcessor**: before → provider → success / error の 3 段階
//!
//! Processor の戻り値は dispatcher が Error entry を書くかどうかの判断にだけ
//! 使われます。task は結果に関係なく必ず complete されます。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::domain::{
    ChannelPayload, EngineError, ErrorEnvelope, FailureKind, FunctionCall, HandlerResult,
    SuccessEnvelope, Task, TaskType,
};
use crate::ports::{Provider, ProviderError};
use crate::typed::{HandlerRegistry, PayloadCodec};

/// Task type of business-function tasks (supervisors included).
pub const FUNCTION_TASK_TYPE: &str = "engine.function";

#[async_trait]
pub trait Processor: Send + Sync {
    /// `Ok` with a non-ok result is an expected failure; `Err` is reserved
    /// for invariant and infrastructure failures.
    async fn process(&self, task: &Task) -> Result<HandlerResult, EngineError>;
}

#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<TaskType, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_type: TaskType,
        processor: Arc<dyn Processor>,
    ) -> Result<(), EngineError> {
        if self.processors.contains_key(&task_type) {
            return Err(EngineError::DuplicateProcessor(task_type));
        }
        self.processors.insert(task_type, processor);
        Ok(())
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn Processor>> {
        self.processors.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.processors.contains_key(task_type)
    }
}

pub struct FunctionProcessor {
    registry: Arc<HandlerRegistry>,
}

impl FunctionProcessor {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Processor for FunctionProcessor {
    async fn process(&self, task: &Task) -> Result<HandlerResult, EngineError> {
        let call: FunctionCall = match PayloadCodec::decode(&task.payload) {
            Ok(call) => call,
            Err(e) => return Ok(e.into()),
        };
        let function = self.registry.function(&call.function)?;
        debug!(function = %call.function, "calling business function");
        function.call(call.args).await
    }
}

/// One processor per channel task type, each owning one provider.
#[derive(Clone)]
pub struct ChannelProcessor {
    registry: Arc<HandlerRegistry>,
    provider: Arc<dyn Provider>,
    timeout: Duration,
}

/// Outcome of before -> provider -> success for one attempt.
enum Delivery {
    /// The success handler accepted the provider result.
    Recorded(HandlerResult),
    /// Needs the error handler.
    Failed(HandlerResult),
}

impl ChannelProcessor {
    pub fn new(registry: Arc<HandlerRegistry>, provider: Arc<dyn Provider>, timeout: Duration) -> Self {
        Self {
            registry,
            provider,
            timeout,
        }
    }

    async fn call_provider(&self, request: &serde_json::Value) -> Result<serde_json::Value, ProviderError> {
        match tokio::time::timeout(self.timeout, self.provider.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::new(format!(
                "provider call timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    async fn deliver(&self, payload: &ChannelPayload) -> Result<Delivery, EngineError> {
        let before = self.registry.before(&payload.before_handler)?;
        let prepared = before.before(payload).await?;
        if !prepared.is_ok() {
            debug!(handler = %payload.before_handler, "before handler aborted the provider call");
            return Ok(Delivery::Failed(prepared));
        }
        let request = prepared.payload.unwrap_or(serde_json::Value::Null);

        let provider_result = match self.call_provider(&request).await {
            Ok(provider_result) => provider_result,
            Err(e) => {
                debug!(error = %e, "provider call failed");
                return Ok(Delivery::Failed(HandlerResult::provider(e.message)));
            }
        };

        let handler = self.registry.success(&payload.success_handler)?;
        let envelope = SuccessEnvelope {
            payload: payload.clone(),
            provider_result,
        };
        let recorded = handler.on_success(&envelope).await?;
        if recorded.is_ok() {
            Ok(Delivery::Recorded(recorded))
        } else {
            Ok(Delivery::Failed(recorded))
        }
    }

    /// Runs the error handler and returns the failure that triggered it.
    async fn fail(
        &self,
        payload: ChannelPayload,
        failure: HandlerResult,
    ) -> Result<HandlerResult, EngineError> {
        let handler = self.registry.error(&payload.error_handler)?;
        let envelope = ErrorEnvelope {
            error_kind: failure.error_kind.unwrap_or(FailureKind::Provider),
            error_message: failure.message.clone().unwrap_or_else(|| failure.describe()),
            payload,
        };
        let recorded = handler.on_error(&envelope).await?;
        if !recorded.is_ok() {
            warn!(
                handler = %envelope.payload.error_handler,
                result = %recorded.describe(),
                "error handler did not record the failure"
            );
        }
        Ok(failure)
    }
}

#[async_trait]
impl Processor for ChannelProcessor {
    async fn process(&self, task: &Task) -> Result<HandlerResult, EngineError> {
        let payload: ChannelPayload = match PayloadCodec::decode(&task.payload) {
            Ok(payload) => payload,
            Err(e) => return Ok(e.into()),
        };

        // 失敗は panic も Err も必ず error handler まで届ける
        let this = self.clone();
        let attempt = payload.clone();
        let joined = tokio::spawn(async move { this.deliver(&attempt).await }).await;
        match joined {
            Ok(Ok(Delivery::Recorded(result))) => Ok(result),
            Ok(Ok(Delivery::Failed(failure))) => self.fail(payload, failure).await,
            Ok(Err(e)) => {
                warn!(error = %e, kind = ?e.kind(), "channel call failed");
                self.fail(payload, HandlerResult::provider(e.to_string())).await?;
                Err(e)
            }
            Err(join_error) => {
                error!(error = %join_error, "channel call panicked");
                self.fail(
                    payload,
                    HandlerResult::provider(format!("channel call panicked: {join_error}")),
                )
                .await
            }
        }
    }
}
