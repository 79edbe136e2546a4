//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! - handler / processor / workflow は登録時に重複を弾く
//! - `build()` で「workflow が参照する名前 ⊆ 登録済みの名前」をチェック
//! - engine 同梱の handler と supervisor はここで登録する
//!
//! 実行時に名前解決で失敗するのは、外部から投入された task だけです。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::info;

use super::facts::{
    CorrelateRequest, RECORD_FAILURE, RECORD_SUCCESS, RecordFailure, RecordSuccess,
    correlate_handler_name,
};
use super::processors::{
    ChannelProcessor, FUNCTION_TASK_TYPE, FunctionProcessor, Processor, ProcessorRegistry,
};
use super::runtime::Runtime;
use super::supervisor::{ChannelWorkflow, Supervisor, supervisor_function_name};
use super::tree::{TreeSupervisor, TreeWorkflow};
use crate::config::{EngineConfig, validate_policy};
use crate::domain::{EngineError, SupervisorPolicy, TaskType, WorkflowFamily};
use crate::impls::{InMemoryTaskStore, InMemoryWebhookStore, InMemoryWorkflowStore};
use crate::ports::{
    Clock, IdGenerator, Provider, SystemClock, TaskStore, UlidGenerator, WebhookStore,
    WorkflowStore,
};
use crate::typed::{
    Args, BeforeHandler, BusinessFunction, ErrorHandler, Function, HandlerKind, HandlerRegistry,
    Prepare, SuccessHandler,
};

/// Persistence used by one engine. All three must point at the same backend.
#[derive(Clone)]
pub struct Stores {
    pub tasks: Arc<dyn TaskStore>,
    pub workflows: Arc<dyn WorkflowStore>,
    pub webhooks: Arc<dyn WebhookStore>,
}

impl Stores {
    pub fn in_memory(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>, config: &EngineConfig) -> Self {
        let tasks: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new(
            clock.clone(),
            ids.clone(),
            config.lease_ttl(),
        ));
        let workflows = Arc::new(InMemoryWorkflowStore::new(tasks.clone(), clock.clone(), ids.clone()));
        let webhooks = Arc::new(InMemoryWebhookStore::new(clock, ids));
        Self {
            tasks,
            workflows,
            webhooks,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Missing processors for task types: {0:?}. These channels are used by workflows but have no provider.")]
    MissingProcessors(Vec<String>),

    #[error("Missing handlers: {0:?}. These names are bound by workflows but not registered.")]
    MissingHandlers(Vec<String>),

    #[error("Unknown child families: {0:?}. Every child of a tree must be a registered workflow.")]
    UnknownChildFamilies(Vec<String>),

    #[error("Trees without children: {0:?}. A tree needs at least one child family.")]
    EmptyTrees(Vec<String>),

    #[error(transparent)]
    Registration(#[from] EngineError),
}

/// # 使用例
/// ```ignore
/// let runtime = EngineBuilder::new(config)
///     .register_prepare::<Message, _>("prepare_message", PrepareMessage)?
///     .channel("channel.message", Arc::new(MessagingProvider::new()))?
///     .workflow(ChannelWorkflow::new(family, "channel.message", "prepare_message"))?
///     .build()?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    stores: Option<Stores>,
    handlers: HandlerRegistry,
    processors: ProcessorRegistry,
    channels: Vec<(TaskType, Arc<dyn Provider>)>,
    workflows: Vec<ChannelWorkflow>,
    trees: Vec<TreeWorkflow>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: None,
            ids: None,
            stores: None,
            handlers: HandlerRegistry::new(),
            processors: ProcessorRegistry::new(),
            channels: Vec::new(),
            workflows: Vec::new(),
            trees: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Defaults to in-memory stores.
    pub fn with_stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn register_function<A, F>(mut self, function: F) -> Result<Self, EngineError>
    where
        A: Args,
        F: Function<A> + 'static,
    {
        self.handlers.register_function::<A, F>(function)?;
        Ok(self)
    }

    pub fn register_function_dyn(
        mut self,
        name: impl Into<String>,
        function: Arc<dyn BusinessFunction>,
    ) -> Result<Self, EngineError> {
        self.handlers.register_function_dyn(name, function)?;
        Ok(self)
    }

    pub fn register_prepare<T, P>(mut self, name: impl Into<String>, prepare: P) -> Result<Self, EngineError>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        P: Prepare<T> + 'static,
    {
        self.handlers.register_prepare::<T, P>(name, prepare)?;
        Ok(self)
    }

    pub fn register_before(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn BeforeHandler>,
    ) -> Result<Self, EngineError> {
        self.handlers.register_before(name, handler)?;
        Ok(self)
    }

    pub fn register_success(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn SuccessHandler>,
    ) -> Result<Self, EngineError> {
        self.handlers.register_success(name, handler)?;
        Ok(self)
    }

    pub fn register_error(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn ErrorHandler>,
    ) -> Result<Self, EngineError> {
        self.handlers.register_error(name, handler)?;
        Ok(self)
    }

    /// A channel task type served by a [`ChannelProcessor`] owning `provider`.
    pub fn channel(
        mut self,
        task_type: impl Into<TaskType>,
        provider: Arc<dyn Provider>,
    ) -> Result<Self, EngineError> {
        let task_type = task_type.into();
        if self.has_processor(&task_type) {
            return Err(EngineError::DuplicateProcessor(task_type));
        }
        self.channels.push((task_type, provider));
        Ok(self)
    }

    /// A hand-written processor for any other task type.
    pub fn processor(
        mut self,
        task_type: impl Into<TaskType>,
        processor: Arc<dyn Processor>,
    ) -> Result<Self, EngineError> {
        let task_type = task_type.into();
        if self.has_processor(&task_type) {
            return Err(EngineError::DuplicateProcessor(task_type));
        }
        self.processors.register(task_type, processor)?;
        Ok(self)
    }

    pub fn workflow(mut self, workflow: ChannelWorkflow) -> Result<Self, EngineError> {
        self.ensure_new_family(&workflow.family)?;
        self.workflows.push(workflow);
        Ok(self)
    }

    pub fn tree(mut self, tree: TreeWorkflow) -> Result<Self, EngineError> {
        self.ensure_new_family(&tree.family)?;
        self.trees.push(tree);
        Ok(self)
    }

    fn has_processor(&self, task_type: &TaskType) -> bool {
        task_type.as_str() == FUNCTION_TASK_TYPE
            || self.processors.contains(task_type)
            || self.channels.iter().any(|(t, _)| t == task_type)
    }

    fn ensure_new_family(&self, family: &WorkflowFamily) -> Result<(), EngineError> {
        let taken = self.workflows.iter().any(|w| &w.family == family)
            || self.trees.iter().any(|t| &t.family == family);
        if taken {
            return Err(EngineError::DuplicateWorkflow(family.clone()));
        }
        Ok(())
    }

    fn resolve_policy(&self, policy: Option<SupervisorPolicy>) -> Result<SupervisorPolicy, BuildError> {
        let policy = policy.unwrap_or(self.config.supervisor);
        validate_policy(&policy).map_err(|e| BuildError::Config(e.to_string()))?;
        Ok(policy)
    }

    fn check_channels(&self) -> Result<(), BuildError> {
        let missing: BTreeSet<String> = self
            .workflows
            .iter()
            .filter(|w| !self.has_processor(&w.channel))
            .map(|w| w.channel.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingProcessors(missing.into_iter().collect()));
        }
        Ok(())
    }

    /// Runs after the engine handlers are registered.
    fn check_handlers(&self) -> Result<(), BuildError> {
        let mut missing = BTreeSet::new();
        for w in &self.workflows {
            for (kind, name) in [
                (HandlerKind::Before, &w.before_handler),
                (HandlerKind::Success, &w.success_handler),
                (HandlerKind::Error, &w.error_handler),
            ] {
                if !self.handlers.contains(kind, name) {
                    missing.insert(format!("{kind}:{name}"));
                }
            }
        }
        if !missing.is_empty() {
            return Err(BuildError::MissingHandlers(missing.into_iter().collect()));
        }
        Ok(())
    }

    fn check_children(&self) -> Result<(), BuildError> {
        let empty: BTreeSet<String> = self
            .trees
            .iter()
            .filter(|t| t.children.is_empty())
            .map(|t| t.family.to_string())
            .collect();
        if !empty.is_empty() {
            return Err(BuildError::EmptyTrees(empty.into_iter().collect()));
        }

        let missing: BTreeSet<String> = self
            .trees
            .iter()
            .flat_map(|t| t.children.iter())
            .filter(|child| {
                !self.workflows.iter().any(|w| &w.family == *child)
                    && !self.trees.iter().any(|t| &t.family == *child)
            })
            .map(|child| child.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::UnknownChildFamilies(missing.into_iter().collect()));
        }
        Ok(())
    }

    pub fn build(mut self) -> Result<Runtime, BuildError> {
        self.config
            .validate()
            .map_err(|e| BuildError::Config(e.to_string()))?;
        self.check_channels()?;
        self.check_children()?;

        let clock: Arc<dyn Clock> = self.clock.take().unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .take()
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let stores = self
            .stores
            .take()
            .unwrap_or_else(|| Stores::in_memory(clock.clone(), ids, &self.config));

        self.handlers.register_success(RECORD_SUCCESS, Arc::new(RecordSuccess::new(stores.workflows.clone())))?;
        self.handlers.register_error(RECORD_FAILURE, Arc::new(RecordFailure::new(stores.workflows.clone())))?;
        for w in &self.workflows {
            if let Some(binding) = &w.webhook {
                self.handlers.register_success(
                    correlate_handler_name(&w.family),
                    Arc::new(CorrelateRequest::new(
                        stores.webhooks.clone(),
                        stores.workflows.clone(),
                        binding.provider_request_pointer.clone(),
                    )),
                )?;
            }
        }
        self.check_handlers()?;

        let mut policies = HashMap::new();
        for w in &self.workflows {
            policies.insert(w.family.clone(), self.resolve_policy(w.policy)?);
        }
        for t in &self.trees {
            policies.insert(t.family.clone(), self.resolve_policy(t.policy)?);
        }

        let workflows = std::mem::take(&mut self.workflows);
        for w in workflows {
            let policy = policies.get(&w.family).copied().unwrap_or(self.config.supervisor);
            let name = supervisor_function_name(&w.family);
            let supervisor = Supervisor::new(
                w,
                policy,
                stores.workflows.clone(),
                stores.webhooks.clone(),
                clock.clone(),
            );
            self.handlers.register_function_dyn(name, Arc::new(supervisor))?;
        }

        let child_max_attempts: HashMap<WorkflowFamily, u32> = policies
            .iter()
            .map(|(family, policy)| (family.clone(), policy.max_attempts))
            .collect();
        let mut tree_children = HashMap::new();
        let trees = std::mem::take(&mut self.trees);
        for t in trees {
            let policy = policies.get(&t.family).copied().unwrap_or(self.config.supervisor);
            let name = supervisor_function_name(&t.family);
            tree_children.insert(t.family.clone(), t.children.clone());
            let supervisor = TreeSupervisor::new(
                t,
                policy,
                child_max_attempts.clone(),
                stores.workflows.clone(),
                clock.clone(),
            );
            self.handlers.register_function_dyn(name, Arc::new(supervisor))?;
        }

        let handlers = Arc::new(self.handlers);
        let mut processors = self.processors;
        processors.register(
            TaskType::new(FUNCTION_TASK_TYPE),
            Arc::new(FunctionProcessor::new(handlers.clone())),
        )?;
        for (task_type, provider) in self.channels {
            processors.register(
                task_type,
                Arc::new(ChannelProcessor::new(
                    handlers.clone(),
                    provider,
                    self.config.provider_timeout(),
                )),
            )?;
        }

        info!(
            workflows = policies.len(),
            functions = handlers.function_names().len(),
            "engine built"
        );

        Ok(Runtime::new(
            self.config,
            clock,
            stores,
            handlers,
            Arc::new(processors),
            policies,
            tree_children,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChannelPayload, HandlerResult};
    use crate::ports::ProviderError;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl BeforeHandler for Noop {
        async fn before(&self, _payload: &ChannelPayload) -> Result<HandlerResult, EngineError> {
            Ok(HandlerResult::ok())
        }
    }

    struct Null;

    #[async_trait]
    impl Provider for Null {
        async fn call(&self, _request: &serde_json::Value) -> Result<serde_json::Value, ProviderError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn family(name: &str) -> WorkflowFamily {
        WorkflowFamily::new(name).unwrap()
    }

    #[test]
    fn test_build_success() {
        let runtime = EngineBuilder::new(EngineConfig::default())
            .register_before("noop", Arc::new(Noop))
            .unwrap()
            .channel("channel.null", Arc::new(Null))
            .unwrap()
            .workflow(ChannelWorkflow::new(family("message_send"), "channel.null", "noop"))
            .unwrap()
            .build();
        assert!(runtime.is_ok());
    }

    #[test]
    fn test_build_missing_processor() {
        let result = EngineBuilder::new(EngineConfig::default())
            .register_before("noop", Arc::new(Noop))
            .unwrap()
            .workflow(ChannelWorkflow::new(family("message_send"), "channel.sms", "noop"))
            .unwrap()
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingProcessors(missing)) if missing == vec!["channel.sms".to_string()]
        ));
    }

    #[test]
    fn test_build_missing_handlers() {
        let result = EngineBuilder::new(EngineConfig::default())
            .channel("channel.null", Arc::new(Null))
            .unwrap()
            .workflow(
                ChannelWorkflow::new(family("message_send"), "channel.null", "prepare")
                    .with_error_handler("custom_error"),
            )
            .unwrap()
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingHandlers(missing))
                if missing == vec!["before:prepare".to_string(), "error:custom_error".to_string()]
        ));
    }

    #[test]
    fn test_build_unknown_child_family() {
        let result = EngineBuilder::new(EngineConfig::default())
            .tree(TreeWorkflow::new(family("account_delete"), vec![family("auth_delete")]))
            .unwrap()
            .build();
        assert!(matches!(
            result,
            Err(BuildError::UnknownChildFamilies(missing)) if missing == vec!["auth_delete".to_string()]
        ));
    }

    #[test]
    fn test_build_tree_without_children() {
        let result = EngineBuilder::new(EngineConfig::default())
            .tree(TreeWorkflow::new(family("account_delete"), vec![]))
            .unwrap()
            .build();
        assert!(matches!(
            result,
            Err(BuildError::EmptyTrees(empty)) if empty == vec!["account_delete".to_string()]
        ));
    }

    #[test]
    fn test_duplicate_family_is_rejected() {
        let err = EngineBuilder::new(EngineConfig::default())
            .tree(TreeWorkflow::new(family("account_delete"), vec![]))
            .unwrap()
            .workflow(ChannelWorkflow::new(family("account_delete"), "channel.null", "noop"))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::DuplicateWorkflow(_)));
    }

    #[test]
    fn test_duplicate_channel_is_rejected() {
        let err = EngineBuilder::new(EngineConfig::default())
            .channel("channel.null", Arc::new(Null))
            .unwrap()
            .channel("channel.null", Arc::new(Null))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::DuplicateProcessor(_)));

        let err = EngineBuilder::new(EngineConfig::default())
            .channel(FUNCTION_TASK_TYPE, Arc::new(Null))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::DuplicateProcessor(_)));
    }

    #[test]
    fn test_invalid_workflow_policy_is_a_config_error() {
        let result = EngineBuilder::new(EngineConfig::default())
            .register_before("noop", Arc::new(Noop))
            .unwrap()
            .channel("channel.null", Arc::new(Null))
            .unwrap()
            .workflow(
                ChannelWorkflow::new(family("message_send"), "channel.null", "noop")
                    .with_policy(SupervisorPolicy::default().with_max_attempts(0)),
            )
            .unwrap()
            .build();
        assert!(matches!(result, Err(BuildError::Config(m)) if m.contains("max_attempts")));
    }

    #[test]
    fn test_engine_handler_names_are_reserved() {
        struct Swallow;

        #[async_trait]
        impl SuccessHandler for Swallow {
            async fn on_success(
                &self,
                _envelope: &crate::domain::SuccessEnvelope,
            ) -> Result<HandlerResult, EngineError> {
                Ok(HandlerResult::ok())
            }
        }

        let result = EngineBuilder::new(EngineConfig::default())
            .register_success(RECORD_SUCCESS, Arc::new(Swallow))
            .unwrap()
            .build();
        assert!(matches!(
            result,
            Err(BuildError::Registration(EngineError::DuplicateHandler(_)))
        ));
    }
}
