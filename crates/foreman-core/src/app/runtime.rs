//! Runtime - 構築済みエンジンの表面
//!
//! - workflow の開始と status クエリ
//! - business function / 任意 task の enqueue
//! - dispatcher と worker group の生成
//! - webhook ingress の生成

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::builder::Stores;
use super::processors::{FUNCTION_TASK_TYPE, ProcessorRegistry};
use super::status::WorkflowStatus;
use super::supervisor::{SuperviseArgs, supervise_task};
use super::webhook::WebhookIngress;
use super::worker_loop::{Dispatcher, WorkerGroup};
use crate::config::EngineConfig;
use crate::domain::{
    EngineError, FunctionCall, NewTask, RootRef, SupervisorPolicy, TaskId, TaskType,
    WorkflowFamily,
};
use crate::ports::{Clock, QueueCounts, TaskStore, WebhookStore, WorkflowStore};
use crate::typed::{Args, HandlerKind, HandlerRegistry, PayloadCodec};

pub struct Runtime {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    stores: Stores,
    handlers: Arc<HandlerRegistry>,
    processors: Arc<ProcessorRegistry>,
    policies: HashMap<WorkflowFamily, SupervisorPolicy>,
    tree_children: HashMap<WorkflowFamily, Vec<WorkflowFamily>>,
}

impl Runtime {
    pub(crate) fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        stores: Stores,
        handlers: Arc<HandlerRegistry>,
        processors: Arc<ProcessorRegistry>,
        policies: HashMap<WorkflowFamily, SupervisorPolicy>,
        tree_children: HashMap<WorkflowFamily, Vec<WorkflowFamily>>,
    ) -> Self {
        Self {
            config,
            clock,
            stores,
            handlers,
            processors,
            policies,
            tree_children,
        }
    }

    /// Creates a root and enqueues the first supervisor run for now.
    pub async fn start_workflow(
        &self,
        family: &WorkflowFamily,
        metadata: serde_json::Value,
    ) -> Result<RootRef, EngineError> {
        if !self.policies.contains_key(family) {
            return Err(EngineError::UnknownWorkflow(family.clone()));
        }
        let root = self.stores.workflows.create_root(family, metadata, None).await?;
        let task = supervise_task(family, &SuperviseArgs::first(root.id), self.clock.now())?;
        self.stores.tasks.enqueue(task).await?;
        info!(family = %family, root_id = %root.id, "workflow started");
        Ok(root.root_ref())
    }

    pub async fn enqueue(
        &self,
        task_type: impl Into<TaskType>,
        payload: serde_json::Value,
        scheduled_at: DateTime<Utc>,
    ) -> Result<TaskId, EngineError> {
        self.stores
            .tasks
            .enqueue(NewTask::new(task_type, payload, scheduled_at))
            .await
    }

    /// Enqueues an `engine.function` task for `A::NAME`.
    pub async fn call_function<A: Args>(
        &self,
        args: &A,
        scheduled_at: DateTime<Utc>,
    ) -> Result<TaskId, EngineError> {
        if !self.handlers.contains(HandlerKind::Function, A::NAME) {
            return Err(EngineError::HandlerNotFound(format!(
                "{}:{}",
                HandlerKind::Function,
                A::NAME
            )));
        }
        let call = FunctionCall {
            function: A::NAME.to_string(),
            args: PayloadCodec::encode(args)
                .map_err(|e| EngineError::InvalidPayload(e.to_string()))?,
        };
        let id = self
            .enqueue(FUNCTION_TASK_TYPE, serde_json::to_value(call)?, scheduled_at)
            .await?;
        debug!(task_id = %id, function = A::NAME, "function enqueued");
        Ok(id)
    }

    pub async fn status(&self, root: &RootRef) -> Result<WorkflowStatus, EngineError> {
        let policy = self
            .policies
            .get(&root.family)
            .ok_or_else(|| EngineError::UnknownWorkflow(root.family.clone()))?;
        let record = self
            .stores
            .workflows
            .get_root(root)
            .await?
            .ok_or_else(|| EngineError::RootNotFound {
                family: root.family.clone(),
                root_id: root.root_id,
            })?;
        let attempts = self.stores.workflows.attempts(root).await?;
        let failure = self.stores.workflows.root_failure(root).await?;
        Ok(WorkflowStatus::project(
            &record,
            &attempts,
            failure.as_ref(),
            policy.max_attempts,
        ))
    }

    /// Status of every child of a tree root. Empty for channel workflows.
    pub async fn children_status(&self, root: &RootRef) -> Result<Vec<WorkflowStatus>, EngineError> {
        let Some(families) = self.tree_children.get(&root.family) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for family in families {
            for child in self.stores.workflows.children(root, family).await? {
                out.push(self.status(&child.root_ref()).await?);
            }
        }
        Ok(out)
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, EngineError> {
        self.stores.tasks.counts(self.clock.now()).await
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.stores.tasks.clone(),
            self.processors.clone(),
            self.config.idle_min(),
            self.config.idle_max(),
        )
    }

    /// Dispatch until nothing is eligible. Returns the processed task ids.
    pub async fn run_until_idle(&self) -> Result<Vec<TaskId>, EngineError> {
        let dispatcher = self.dispatcher();
        let mut processed = Vec::new();
        while let Some(id) = dispatcher.run_once().await? {
            processed.push(id);
        }
        Ok(processed)
    }

    /// `config.workers` dispatcher loops.
    pub fn spawn_workers(&self) -> WorkerGroup {
        WorkerGroup::spawn(self.config.workers, self.dispatcher())
    }

    pub fn webhook_ingress(&self, request_id_pointer: Option<String>) -> WebhookIngress {
        WebhookIngress::new(self.stores.webhooks.clone(), request_id_pointer)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn tasks(&self) -> &Arc<dyn TaskStore> {
        &self.stores.tasks
    }

    pub fn workflows(&self) -> &Arc<dyn WorkflowStore> {
        &self.stores.workflows
    }

    pub fn webhooks(&self) -> &Arc<dyn WebhookStore> {
        &self.stores.webhooks
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }
}
