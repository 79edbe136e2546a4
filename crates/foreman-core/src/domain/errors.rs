//! Errors - エラー型と分類
//!
//! 期待される失敗（validation / provider）は `HandlerResult` の値として返し、
//! `EngineError` は不変条件違反とインフラ障害だけに使います。

use thiserror::Error;

use super::facts::WorkflowFamily;
use super::ids::{AttemptId, RootId};
use super::task::TaskType;

/// ErrorKind は運用上の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 呼び出し側のバグ（ペイロード不正など）。リトライしない。
    Validation,
    /// 外部呼び出しの失敗。supervisor が新しい Attempt で再試行する。
    Operational,
    /// 起きてはいけない状態。現在の実行を止めて調査する。
    Invariant,
    /// self re-enqueue が上限を超えた（ロジックの欠陥）。
    RunLimit,
    /// ストアや設定の障害。
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("handler not found: {0}")]
    HandlerNotFound(String),

    #[error("duplicate handler: {0}")]
    DuplicateHandler(String),

    #[error("processor not found for task_type={0}")]
    ProcessorNotFound(TaskType),

    #[error("duplicate processor for task_type={0}")]
    DuplicateProcessor(TaskType),

    #[error("duplicate workflow family: {0}")]
    DuplicateWorkflow(WorkflowFamily),

    #[error("unknown workflow family: {0}")]
    UnknownWorkflow(WorkflowFamily),

    #[error("workflow root {root_id} not found in family {family}")]
    RootNotFound {
        family: WorkflowFamily,
        root_id: RootId,
    },

    #[error("attempt {attempt_id} not found in family {family}")]
    AttemptNotFound {
        family: WorkflowFamily,
        attempt_id: AttemptId,
    },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("run limit exceeded for {family}/{root_id}: run {run_count} > max {max_runs}")]
    RunLimitExceeded {
        family: WorkflowFamily,
        root_id: RootId,
        run_count: u32,
        max_runs: u32,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid workflow family name: {0:?}")]
    InvalidFamily(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidPayload(_) | EngineError::InvalidFamily(_) => ErrorKind::Validation,
            EngineError::HandlerNotFound(_)
            | EngineError::DuplicateHandler(_)
            | EngineError::ProcessorNotFound(_)
            | EngineError::DuplicateProcessor(_)
            | EngineError::DuplicateWorkflow(_)
            | EngineError::UnknownWorkflow(_)
            | EngineError::RootNotFound { .. }
            | EngineError::AttemptNotFound { .. }
            | EngineError::Invariant(_) => ErrorKind::Invariant,
            EngineError::RunLimitExceeded { .. } => ErrorKind::RunLimit,
            EngineError::Store(_) | EngineError::Config(_) => ErrorKind::Infrastructure,
        }
    }

    /// Fatal errors stop the current unit of work and are reported loudly.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Invariant | ErrorKind::RunLimit)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::InvalidPayload(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn run_limit_is_fatal() {
        let err = EngineError::RunLimitExceeded {
            family: WorkflowFamily::new("message_send").unwrap(),
            root_id: RootId::from_ulid(Ulid::new()),
            run_count: 51,
            max_runs: 50,
        };
        assert_eq!(err.kind(), ErrorKind::RunLimit);
        assert!(err.is_fatal());
        assert!(err.to_string().contains("run 51 > max 50"));
    }

    #[test]
    fn store_errors_are_not_fatal() {
        let err = EngineError::Store("connection reset".into());
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(!err.is_fatal());
    }
}
