//! WorkflowStore port - ワークフローごとの fact テーブル
//!
//! family ごとに roots / attempts / succeeded / failed (+ root_failures) を持ちます。
//! テーブルはすべて append-only で、状態は常に [`FactSummary`] として再計算します。
//!
//! # 排他制御
//! supervisor は fact を読む前に `lock_root()` で root を排他ロックします。
//! ロックを取る前に読んだ fact は古い可能性があります（stale-read race）。
//! ロックは [`RootTx`] が生きている間だけ保持され、effects は `commit()` で
//! まとめて見えるようになります。

use async_trait::async_trait;

use crate::domain::{
    AttemptFacts, AttemptId, AttemptRecord, AttemptRef, EngineError, FactSummary, NewTask,
    RootFailure, RootRef, WorkflowFamily, WorkflowRoot,
};

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn create_root(
        &self,
        family: &WorkflowFamily,
        metadata: serde_json::Value,
        parent: Option<RootRef>,
    ) -> Result<WorkflowRoot, EngineError>;

    async fn get_root(&self, root: &RootRef) -> Result<Option<WorkflowRoot>, EngineError>;

    /// Roots of `family` whose parent is `parent`, oldest first.
    async fn children(
        &self,
        parent: &RootRef,
        family: &WorkflowFamily,
    ) -> Result<Vec<WorkflowRoot>, EngineError>;

    async fn attempts(&self, root: &RootRef) -> Result<Vec<AttemptFacts>, EngineError>;

    async fn root_failure(&self, root: &RootRef) -> Result<Option<RootFailure>, EngineError>;

    /// Unlocked read. Fine for observers (parents, status queries); a
    /// supervisor acting on its own root must use [`RootTx::summary`].
    async fn summary(&self, root: &RootRef) -> Result<FactSummary, EngineError> {
        let attempts = self.attempts(root).await?;
        let failure = self.root_failure(root).await?;
        Ok(FactSummary::from_facts(&attempts, failure.as_ref()))
    }

    /// Idempotent; returns whether a new fact was written.
    async fn record_success(&self, attempt: &AttemptRef) -> Result<bool, EngineError>;

    /// Idempotent per attempt; returns whether a new fact was written.
    async fn record_failure(&self, attempt: &AttemptRef, message: &str)
    -> Result<bool, EngineError>;

    /// Exclusive lock on a root. `RootNotFound` if it does not exist.
    async fn lock_root(&self, root: &RootRef) -> Result<Box<dyn RootTx>, EngineError>;
}

/// One locked supervisor run. Dropping without `commit()` discards effects.
#[async_trait]
pub trait RootTx: Send {
    fn root(&self) -> &WorkflowRoot;

    /// Includes effects written earlier in this transaction.
    async fn attempts(&mut self) -> Result<Vec<AttemptFacts>, EngineError>;

    async fn root_failure(&mut self) -> Result<Option<RootFailure>, EngineError>;

    async fn summary(&mut self) -> Result<FactSummary, EngineError> {
        let attempts = self.attempts().await?;
        let failure = self.root_failure().await?;
        Ok(FactSummary::from_facts(&attempts, failure.as_ref()))
    }

    async fn create_attempt(&mut self) -> Result<AttemptRecord, EngineError>;

    async fn record_success(&mut self, attempt_id: AttemptId) -> Result<(), EngineError>;

    async fn record_failure(&mut self, attempt_id: AttemptId, message: &str)
    -> Result<(), EngineError>;

    /// No-op if the root already has a failure recorded.
    async fn record_root_failure(&mut self, message: &str) -> Result<(), EngineError>;

    /// Create a root (usually a child of this one) as part of this run.
    async fn create_root(
        &mut self,
        family: &WorkflowFamily,
        metadata: serde_json::Value,
        parent: Option<RootRef>,
    ) -> Result<WorkflowRoot, EngineError>;

    /// Enqueue a task as part of this run.
    async fn enqueue(&mut self, task: NewTask) -> Result<(), EngineError>;

    async fn commit(self: Box<Self>) -> Result<(), EngineError>;
}
