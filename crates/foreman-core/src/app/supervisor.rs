//! Supervisor - facts → decide → effects
//!
//! 1 回の run は 1 つの root lock の中で完結します。
//! 1. run_count が max_runs を超えていたら RunLimitExceeded（ロジックの欠陥）
//! 2. root を lock（fact はこの後でしか読まない）
//! 3. webhook workflow なら保存済み response を検証して commit
//! 4. 古すぎる outstanding attempt に failure fact を書く
//! 5. summary から Decision を出して effects を書く
//! 6. terminal でなければ自分を re-enqueue（triggered run は除く）
//! 7. terminal なら parent を triggered run として enqueue
//! 8. commit
//!
//! provider 呼び出しは lock の外（channel task）で行われます。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::facts::{RECORD_FAILURE, RECORD_SUCCESS, correlate_handler_name};
use super::processors::FUNCTION_TASK_TYPE;
use super::webhook::WebhookBinding;
use crate::domain::{
    AttemptRecord, AttemptRef, ChannelPayload, Decider, Decision, DefaultDecider, EngineError,
    FunctionCall, HandlerResult, NewTask, RootId, RootRef, SupervisorPolicy, TaskType, Terminal,
    WorkflowFamily, WorkflowRoot,
};
use crate::ports::{Clock, RootTx, WebhookStore, WorkflowStore};
use crate::typed::{BusinessFunction, PayloadCodec};

pub const ATTEMPT_TIMED_OUT: &str = "attempt timed out";

/// Args of a `supervise.<family>` function task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperviseArgs {
    pub root_id: RootId,
    #[serde(default)]
    pub run_count: u32,
    /// Enqueued by a child. Acts on current facts but never re-enqueues.
    #[serde(default)]
    pub triggered: bool,
}

impl SuperviseArgs {
    pub fn first(root_id: RootId) -> Self {
        Self {
            root_id,
            run_count: 1,
            triggered: false,
        }
    }

    pub fn next(&self) -> Self {
        Self {
            root_id: self.root_id,
            run_count: self.run_count.saturating_add(1),
            triggered: false,
        }
    }

    pub fn trigger(root_id: RootId) -> Self {
        Self {
            root_id,
            run_count: 0,
            triggered: true,
        }
    }
}

pub fn supervisor_function_name(family: &WorkflowFamily) -> String {
    format!("supervise.{family}")
}

pub fn supervise_task(
    family: &WorkflowFamily,
    args: &SuperviseArgs,
    at: DateTime<Utc>,
) -> Result<NewTask, EngineError> {
    let call = FunctionCall {
        function: supervisor_function_name(family),
        args: serde_json::to_value(args)?,
    };
    Ok(NewTask::new(FUNCTION_TASK_TYPE, serde_json::to_value(call)?, at))
}

/// `now + delay`, saturating at the far end of the calendar.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn check_run_limit(
    family: &WorkflowFamily,
    args: &SuperviseArgs,
    max_runs: u32,
) -> Result<(), EngineError> {
    if args.run_count <= max_runs {
        return Ok(());
    }
    error!(
        family = %family,
        root_id = %args.root_id,
        run_count = args.run_count,
        max_runs,
        "supervisor exceeded its run limit"
    );
    Err(EngineError::RunLimitExceeded {
        family: family.clone(),
        root_id: args.root_id,
        run_count: args.run_count,
        max_runs,
    })
}

/// Enqueues a triggered run of the parent, if there is one.
pub(crate) async fn notify_parent(
    tx: &mut dyn RootTx,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let Some(parent) = tx.root().parent.clone() else {
        return Ok(());
    };
    let task = supervise_task(&parent.family, &SuperviseArgs::trigger(parent.root_id), now)?;
    tx.enqueue(task).await?;
    debug!(parent = %parent, "parent triggered");
    Ok(())
}

/// A retryable process whose attempts are channel tasks.
#[derive(Clone)]
pub struct ChannelWorkflow {
    pub family: WorkflowFamily,
    pub channel: TaskType,
    pub before_handler: String,
    pub success_handler: String,
    pub error_handler: String,
    /// `None` falls back to the engine-wide policy.
    pub policy: Option<SupervisorPolicy>,
    pub webhook: Option<WebhookBinding>,
}

impl ChannelWorkflow {
    pub fn new(
        family: WorkflowFamily,
        channel: impl Into<TaskType>,
        before_handler: impl Into<String>,
    ) -> Self {
        Self {
            family,
            channel: channel.into(),
            before_handler: before_handler.into(),
            success_handler: RECORD_SUCCESS.to_string(),
            error_handler: RECORD_FAILURE.to_string(),
            policy: None,
            webhook: None,
        }
    }

    pub fn with_success_handler(mut self, name: impl Into<String>) -> Self {
        self.success_handler = name.into();
        self
    }

    pub fn with_error_handler(mut self, name: impl Into<String>) -> Self {
        self.error_handler = name.into();
        self
    }

    pub fn with_policy(mut self, policy: SupervisorPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Success of the channel call only correlates the request; the attempt
    /// succeeds once a verified webhook has been committed.
    pub fn with_webhook(mut self, binding: WebhookBinding) -> Self {
        self.success_handler = correlate_handler_name(&self.family);
        self.webhook = Some(binding);
        self
    }

    fn payload_for(&self, root: &WorkflowRoot, attempt: &AttemptRecord) -> ChannelPayload {
        ChannelPayload {
            before_handler: self.before_handler.clone(),
            success_handler: self.success_handler.clone(),
            error_handler: self.error_handler.clone(),
            attempt: AttemptRef {
                family: self.family.clone(),
                root_id: root.id,
                attempt_id: attempt.id,
            },
            data: root.metadata.clone(),
        }
    }
}

pub struct Supervisor {
    workflow: ChannelWorkflow,
    policy: SupervisorPolicy,
    decider: DefaultDecider,
    workflows: Arc<dyn WorkflowStore>,
    webhooks: Arc<dyn WebhookStore>,
    clock: Arc<dyn Clock>,
}

impl Supervisor {
    pub fn new(
        workflow: ChannelWorkflow,
        policy: SupervisorPolicy,
        workflows: Arc<dyn WorkflowStore>,
        webhooks: Arc<dyn WebhookStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            workflow,
            policy,
            decider: DefaultDecider::new(policy),
            workflows,
            webhooks,
            clock,
        }
    }

    pub fn family(&self) -> &WorkflowFamily {
        &self.workflow.family
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.policy
    }

    #[instrument(
        name = "supervise",
        skip_all,
        fields(
            family = %self.workflow.family,
            root_id = %args.root_id,
            run_count = args.run_count,
            triggered = args.triggered,
        )
    )]
    pub async fn run(&self, args: SuperviseArgs) -> Result<HandlerResult, EngineError> {
        check_run_limit(&self.workflow.family, &args, self.policy.max_runs)?;

        let root_ref = RootRef::new(self.workflow.family.clone(), args.root_id);
        let mut tx = self.workflows.lock_root(&root_ref).await?;
        let now = self.clock.now();

        if let Some(binding) = &self.workflow.webhook {
            self.reconcile_webhooks(tx.as_mut(), binding).await?;
        }
        self.expire_attempts(tx.as_mut(), now).await?;

        let summary = tx.summary().await?;
        let decision = self.decider.decide(&summary);
        debug!(?summary, ?decision, "decided");

        match decision {
            Decision::ScheduleAttempt { .. } => {
                let attempt = tx.create_attempt().await?;
                let payload = self.workflow.payload_for(tx.root(), &attempt);
                let task = NewTask::new(
                    self.workflow.channel.clone(),
                    serde_json::to_value(&payload)?,
                    now,
                );
                tx.enqueue(task).await?;
                info!(
                    attempt_id = %attempt.id,
                    attempt = summary.attempts + 1,
                    failed_count = summary.failed_count,
                    "attempt scheduled"
                );
            }
            Decision::Wait { .. } => {}
            Decision::Stop(Terminal::Succeeded) => {
                info!(attempts = summary.attempts, "workflow succeeded");
            }
            Decision::Stop(Terminal::Exhausted { failed_count }) => {
                tx.record_root_failure(&format!(
                    "attempts exhausted after {failed_count} failures"
                ))
                .await?;
                warn!(failed_count, "workflow failed");
            }
        }

        match decision.next_check() {
            Some(delay) if !args.triggered => {
                let task = supervise_task(&self.workflow.family, &args.next(), after(now, delay))?;
                tx.enqueue(task).await?;
                debug!(next_check_ms = delay.as_millis() as u64, "re-enqueued");
            }
            Some(_) => {}
            None if self.policy.notify_parent => notify_parent(tx.as_mut(), now).await?,
            None => {}
        }

        tx.commit().await?;
        Ok(HandlerResult::ok())
    }

    async fn expire_attempts(
        &self,
        tx: &mut dyn RootTx,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let Some(timeout) = self.policy.attempt_timeout() else {
            return Ok(());
        };
        for facts in tx.attempts().await? {
            if !facts.is_outstanding() {
                continue;
            }
            let age = (now - facts.attempt.created_at).to_std().unwrap_or_default();
            if age >= timeout {
                warn!(
                    attempt_id = %facts.attempt.id,
                    age_ms = age.as_millis() as u64,
                    "outstanding attempt timed out"
                );
                tx.record_failure(facts.attempt.id, ATTEMPT_TIMED_OUT).await?;
            }
        }
        Ok(())
    }

    /// Verify stored responses of every correlated outstanding attempt and
    /// commit the first one that passes.
    async fn reconcile_webhooks(
        &self,
        tx: &mut dyn RootTx,
        binding: &WebhookBinding,
    ) -> Result<(), EngineError> {
        let root_id = tx.root().id;
        for facts in tx.attempts().await? {
            if !facts.is_outstanding() {
                continue;
            }
            let attempt = AttemptRef {
                family: self.workflow.family.clone(),
                root_id,
                attempt_id: facts.attempt.id,
            };
            let Some(request_id) = self.webhooks.request_for_attempt(&attempt).await? else {
                continue;
            };
            let responses = self.webhooks.responses_for_request(&request_id).await?;
            if responses.is_empty() {
                continue;
            }

            let mut rejection = None;
            let mut verified = None;
            for response in responses {
                match binding.verifier.verify(&response) {
                    Ok(()) => {
                        verified = Some(response);
                        break;
                    }
                    Err(e) => {
                        warn!(
                            webhook_id = %response.id,
                            attempt_id = %attempt.attempt_id,
                            error = %e,
                            "webhook rejected"
                        );
                        rejection = Some(e);
                    }
                }
            }

            let Some(response) = verified else {
                let reason = rejection.map(|e| e.to_string()).unwrap_or_default();
                tx.record_failure(
                    attempt.attempt_id,
                    &format!("webhook verification failed: {reason}"),
                )
                .await?;
                continue;
            };

            let body = match serde_json::from_slice::<serde_json::Value>(&response.raw_body) {
                Ok(body) => body,
                Err(e) => {
                    tx.record_failure(attempt.attempt_id, &format!("webhook body is not JSON: {e}"))
                        .await?;
                    continue;
                }
            };
            let result = binding.commit.commit(&attempt, body).await?;
            if result.is_ok() {
                tx.record_success(attempt.attempt_id).await?;
                info!(webhook_id = %response.id, attempt_id = %attempt.attempt_id, "webhook committed");
            } else {
                tx.record_failure(attempt.attempt_id, &result.describe()).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BusinessFunction for Supervisor {
    async fn call(&self, args: serde_json::Value) -> Result<HandlerResult, EngineError> {
        match PayloadCodec::decode::<SuperviseArgs>(&args) {
            Ok(args) => self.run(args).await,
            Err(e) => Ok(e.into()),
        }
    }
}
