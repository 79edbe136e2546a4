//! Supervision tree - 子 supervisor を polling だけで束ねる parent
//!
//! 最初の run で orchestration attempt を 1 つ作り、子 family ごとに
//! child root を作って子 supervisor を enqueue します。
//! 以降の run は子の derived state を読むだけです。
//! - 全員 TerminalSuccess → 自分の attempt に success fact
//! - 誰か TerminalFailure → failure fact + root failure
//! - それ以外 → backoff 後にもう一度見る
//!
//! 子からの trigger は「今見て」という合図でしかなく、
//! 判断は毎回 fact から出し直します。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use super::supervisor::{SuperviseArgs, after, check_run_limit, notify_parent, supervise_task};
use crate::domain::{
    AttemptRecord, EngineError, HandlerResult, RootRef, SupervisorPolicy, WorkflowFamily,
    WorkflowState,
};
use crate::ports::{Clock, RootTx, WorkflowStore};
use crate::typed::{BusinessFunction, PayloadCodec};

#[derive(Debug, Clone)]
pub struct TreeWorkflow {
    pub family: WorkflowFamily,
    /// One child root per family, created on the first run.
    pub children: Vec<WorkflowFamily>,
    /// Only `backoff`, `max_runs` and `notify_parent` apply to a tree.
    pub policy: Option<SupervisorPolicy>,
}

impl TreeWorkflow {
    pub fn new(family: WorkflowFamily, children: Vec<WorkflowFamily>) -> Self {
        Self {
            family,
            children,
            policy: None,
        }
    }

    pub fn with_policy(mut self, policy: SupervisorPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Derived state of one child as seen by its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildState {
    pub root: RootRef,
    pub state: WorkflowState,
}

pub struct TreeSupervisor {
    workflow: TreeWorkflow,
    policy: SupervisorPolicy,
    /// max_attempts of every child family, used to derive their state.
    child_max_attempts: HashMap<WorkflowFamily, u32>,
    workflows: Arc<dyn WorkflowStore>,
    clock: Arc<dyn Clock>,
}

impl TreeSupervisor {
    pub fn new(
        workflow: TreeWorkflow,
        policy: SupervisorPolicy,
        child_max_attempts: HashMap<WorkflowFamily, u32>,
        workflows: Arc<dyn WorkflowStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            workflow,
            policy,
            child_max_attempts,
            workflows,
            clock,
        }
    }

    pub fn family(&self) -> &WorkflowFamily {
        &self.workflow.family
    }

    #[instrument(
        name = "supervise_tree",
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

        let summary = tx.summary().await?;
        if summary.succeeded || summary.root_failed {
            debug!("already terminal");
            return Ok(HandlerResult::ok());
        }

        let attempts = tx.attempts().await?;
        match attempts.first() {
            None if args.triggered => {
                // Children do not exist before the first untriggered run.
                debug!("triggered before start, ignoring");
                return Ok(HandlerResult::ok());
            }
            None => self.start(tx.as_mut(), &root_ref).await?,
            Some(orchestration) => {
                let orchestration = orchestration.attempt.clone();
                if self.evaluate(tx.as_mut(), &root_ref, &orchestration).await? {
                    if self.policy.notify_parent {
                        notify_parent(tx.as_mut(), self.clock.now()).await?;
                    }
                    tx.commit().await?;
                    return Ok(HandlerResult::ok());
                }
            }
        }

        if !args.triggered {
            // 初回 run_count=1 で base_delay
            let delay = self.policy.backoff.delay(args.run_count.saturating_sub(1));
            let task = supervise_task(
                &self.workflow.family,
                &args.next(),
                after(self.clock.now(), delay),
            )?;
            tx.enqueue(task).await?;
        }
        tx.commit().await?;
        Ok(HandlerResult::ok())
    }

    async fn start(&self, tx: &mut dyn RootTx, root_ref: &RootRef) -> Result<(), EngineError> {
        let orchestration = tx.create_attempt().await?;
        let metadata = tx.root().metadata.clone();
        let now = self.clock.now();
        for family in &self.workflow.children {
            let child = tx
                .create_root(family, metadata.clone(), Some(root_ref.clone()))
                .await?;
            tx.enqueue(supervise_task(family, &SuperviseArgs::first(child.id), now)?)
                .await?;
            debug!(child = %child.root_ref(), "child started");
        }
        info!(
            attempt_id = %orchestration.id,
            children = self.workflow.children.len(),
            "tree started"
        );
        Ok(())
    }

    /// Returns true once the root turned terminal in this run.
    async fn evaluate(
        &self,
        tx: &mut dyn RootTx,
        root_ref: &RootRef,
        orchestration: &AttemptRecord,
    ) -> Result<bool, EngineError> {
        let children = self.child_states(root_ref).await?;

        if let Some(failed) = children
            .iter()
            .find(|c| c.state == WorkflowState::TerminalFailure)
        {
            let message = format!("child {} failed", failed.root);
            tx.record_failure(orchestration.id, &message).await?;
            tx.record_root_failure(&message).await?;
            warn!(child = %failed.root, "tree failed");
            return Ok(true);
        }

        if children
            .iter()
            .all(|c| c.state == WorkflowState::TerminalSuccess)
        {
            tx.record_success(orchestration.id).await?;
            info!(children = children.len(), "tree succeeded");
            return Ok(true);
        }

        let pending = children.iter().filter(|c| !c.state.is_terminal()).count();
        debug!(pending, "children still running");
        Ok(false)
    }

    /// Unlocked reads: a parent only observes its children.
    pub async fn child_states(&self, root_ref: &RootRef) -> Result<Vec<ChildState>, EngineError> {
        let mut states = Vec::new();
        for family in &self.workflow.children {
            let roots = self.workflows.children(root_ref, family).await?;
            if roots.is_empty() {
                let err = EngineError::Invariant(format!(
                    "{root_ref} has no child root in family {family}"
                ));
                error!(error = %err, "child root missing");
                return Err(err);
            }
            let max_attempts = self.child_max_attempts.get(family).copied().ok_or_else(|| {
                EngineError::Invariant(format!("child family {family} is not registered"))
            })?;
            for child in roots {
                let child_ref = child.root_ref();
                let summary = self.workflows.summary(&child_ref).await?;
                states.push(ChildState {
                    state: WorkflowState::derive(&summary, max_attempts),
                    root: child_ref,
                });
            }
        }
        Ok(states)
    }
}

#[async_trait]
impl BusinessFunction for TreeSupervisor {
    async fn call(&self, args: serde_json::Value) -> Result<HandlerResult, EngineError> {
        match PayloadCodec::decode::<SuperviseArgs>(&args) {
            Ok(args) => self.run(args).await,
            Err(e) => Ok(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::processors::FUNCTION_TASK_TYPE;
    use crate::impls::{InMemoryTaskStore, InMemoryWorkflowStore};
    use crate::ports::{FixedClock, IdGenerator, TaskStore, UlidGenerator};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        tasks: Arc<InMemoryTaskStore>,
        workflows: Arc<InMemoryWorkflowStore>,
        tree: TreeSupervisor,
        storage: WorkflowFamily,
        auth: WorkflowFamily,
    }

    fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let tasks = Arc::new(InMemoryTaskStore::new(
            clock.clone(),
            ids.clone(),
            Duration::from_secs(300),
        ));
        let workflows = Arc::new(InMemoryWorkflowStore::new(tasks.clone(), clock.clone(), ids));
        let storage = WorkflowFamily::new("storage_delete").unwrap();
        let auth = WorkflowFamily::new("auth_delete").unwrap();
        let tree = TreeSupervisor::new(
            TreeWorkflow::new(
                WorkflowFamily::new("account_delete").unwrap(),
                vec![storage.clone(), auth.clone()],
            ),
            SupervisorPolicy::default().with_max_runs(5),
            HashMap::from([(storage.clone(), 2), (auth.clone(), 2)]),
            workflows.clone(),
            clock,
        );
        Fixture {
            tasks,
            workflows,
            tree,
            storage,
            auth,
        }
    }

    impl Fixture {
        async fn start(&self) -> RootRef {
            let root = self
                .workflows
                .create_root(self.tree.family(), json!({ "account_id": 42 }), None)
                .await
                .unwrap();
            self.tree.run(SuperviseArgs::first(root.id)).await.unwrap();
            root.root_ref()
        }

        async fn child(&self, parent: &RootRef, family: &WorkflowFamily) -> RootRef {
            self.workflows.children(parent, family).await.unwrap()[0].root_ref()
        }

        async fn finish(&self, child: &RootRef, succeed: bool) {
            let mut tx = self.workflows.lock_root(child).await.unwrap();
            let attempt = tx.create_attempt().await.unwrap();
            if succeed {
                tx.record_success(attempt.id).await.unwrap();
            } else {
                tx.record_failure(attempt.id, "provider: gone").await.unwrap();
                tx.record_root_failure("attempts exhausted").await.unwrap();
            }
            tx.commit().await.unwrap();
        }
    }

    #[tokio::test]
    async fn first_run_creates_children_and_polls() {
        let f = fixture();
        let root = f.start().await;

        for family in [&f.storage, &f.auth] {
            let children = f.workflows.children(&root, family).await.unwrap();
            assert_eq!(children.len(), 1);
            assert_eq!(children[0].metadata, json!({ "account_id": 42 }));
            assert_eq!(children[0].parent.as_ref(), Some(&root));
        }

        let functions: Vec<String> = f
            .tasks
            .pending()
            .await
            .unwrap()
            .iter()
            .filter(|t| t.task_type.as_str() == FUNCTION_TASK_TYPE)
            .map(|t| t.payload["function"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(functions.len(), 3);
        assert!(functions.contains(&"supervise.storage_delete".to_string()));
        assert!(functions.contains(&"supervise.auth_delete".to_string()));
        assert!(functions.contains(&"supervise.account_delete".to_string()));
    }

    #[tokio::test]
    async fn succeeds_only_when_every_child_succeeded() {
        let f = fixture();
        let root = f.start().await;
        let storage = f.child(&root, &f.storage).await;
        let auth = f.child(&root, &f.auth).await;

        f.finish(&storage, true).await;
        f.tree.run(SuperviseArgs::trigger(root.root_id)).await.unwrap();
        assert!(!f.workflows.summary(&root).await.unwrap().succeeded);

        f.finish(&auth, true).await;
        f.tree.run(SuperviseArgs::trigger(root.root_id)).await.unwrap();
        let summary = f.workflows.summary(&root).await.unwrap();
        assert!(summary.succeeded);
        assert_eq!(summary.attempts, 1);
    }

    #[tokio::test]
    async fn any_failed_child_fails_the_tree() {
        let f = fixture();
        let root = f.start().await;
        let auth = f.child(&root, &f.auth).await;

        f.finish(&auth, false).await;
        f.tree
            .run(SuperviseArgs::first(root.root_id).next())
            .await
            .unwrap();

        let failure = f.workflows.root_failure(&root).await.unwrap().unwrap();
        assert!(failure.message.contains("auth_delete"));
    }

    #[tokio::test]
    async fn duplicate_triggers_after_terminal_are_no_ops() {
        let f = fixture();
        let root = f.start().await;
        f.finish(&f.child(&root, &f.storage).await, true).await;
        f.finish(&f.child(&root, &f.auth).await, true).await;

        let before = f.tasks.pending().await.unwrap().len();
        for _ in 0..3 {
            f.tree.run(SuperviseArgs::trigger(root.root_id)).await.unwrap();
        }
        assert_eq!(f.tasks.pending().await.unwrap().len(), before);
        assert_eq!(f.workflows.summary(&root).await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn triggered_run_before_start_does_nothing() {
        let f = fixture();
        let root = f
            .workflows
            .create_root(f.tree.family(), json!({}), None)
            .await
            .unwrap();

        f.tree.run(SuperviseArgs::trigger(root.id)).await.unwrap();

        assert!(f.tasks.pending().await.unwrap().is_empty());
        assert!(f.workflows.children(&root.root_ref(), &f.auth).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_child_is_an_invariant_violation() {
        let f = fixture();
        let root = f
            .workflows
            .create_root(f.tree.family(), json!({}), None)
            .await
            .unwrap();
        // orchestration attempt without children
        let mut tx = f.workflows.lock_root(&root.root_ref()).await.unwrap();
        tx.create_attempt().await.unwrap();
        tx.commit().await.unwrap();

        let err = f
            .tree
            .run(SuperviseArgs::first(root.id).next())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Invariant(_)));
    }
}
