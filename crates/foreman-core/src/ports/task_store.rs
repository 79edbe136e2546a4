//! TaskStore port - 永続化されたワークキュー
//!
//! TaskStore は以下を管理します：
//! - tasks（生成後は不変）
//! - task_leases（append-only、期限付きの排他 claim）
//! - task_completions（task ごとに 1 行、冪等）
//! - task_errors（append-only、観測用）
//!
//! # 設計原則
//! - 「live な lease を持つ task は 2 人目に渡さない」はストアの責務
//! - リトライは同じ task の再配送ではなく、supervisor が新しい task を作ること
//! - ワーカーがクラッシュした場合は lease が期限切れになるだけ（唯一の回復手段）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EngineError, ErrorEntry, Lease, LeasedTask, NewTask, Task, TaskId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Not completed and not under a live lease (includes future-scheduled).
    pub waiting: usize,
    /// Not completed, under a live lease.
    pub leased: usize,
    pub completed: usize,
    pub errors: usize,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, EngineError>;

    /// Claim the next eligible task, ordered by `(scheduled_at, id)`.
    ///
    /// Eligible: `scheduled_at <= now`, no completion, no lease with
    /// `expires_at > now`. Returns `Ok(None)` when nothing is eligible.
    async fn dequeue(&self) -> Result<Option<LeasedTask>, EngineError>;

    /// Idempotent.
    async fn complete(&self, task_id: TaskId) -> Result<(), EngineError>;

    async fn record_error(&self, task_id: TaskId, message: &str) -> Result<(), EngineError>;

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, EngineError>;

    async fn is_completed(&self, task_id: TaskId) -> Result<bool, EngineError>;

    async fn leases(&self, task_id: TaskId) -> Result<Vec<Lease>, EngineError>;

    async fn errors(&self, task_id: TaskId) -> Result<Vec<ErrorEntry>, EngineError>;

    /// Tasks not yet completed, in dequeue order.
    async fn pending(&self) -> Result<Vec<Task>, EngineError>;

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts, EngineError>;
}
