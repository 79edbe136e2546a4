//! Status - 「いまどうなっているか」のクエリ
//!
//! fact から毎回計算します。保存された status はありません。

use serde::Serialize;

use crate::domain::{
    AttemptFacts, FactSummary, RootFailure, RootRef, WorkflowRoot, WorkflowState,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptStatus {
    pub attempt_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStatus {
    pub root: RootRef,
    pub parent: Option<RootRef>,
    pub state: WorkflowState,
    pub attempts: u32,
    pub succeeded: bool,
    pub failed_count: u32,
    pub outstanding: u32,
    pub root_failure: Option<String>,
    pub history: Vec<AttemptStatus>,
}

impl WorkflowStatus {
    pub fn project(
        root: &WorkflowRoot,
        attempts: &[AttemptFacts],
        root_failure: Option<&RootFailure>,
        max_attempts: u32,
    ) -> Self {
        let summary = FactSummary::from_facts(attempts, root_failure);
        Self {
            root: root.root_ref(),
            parent: root.parent.clone(),
            state: WorkflowState::derive(&summary, max_attempts),
            attempts: summary.attempts,
            succeeded: summary.succeeded,
            failed_count: summary.failed_count,
            outstanding: summary.outstanding,
            root_failure: root_failure.map(|f| f.message.clone()),
            history: attempts
                .iter()
                .map(|facts| AttemptStatus {
                    attempt_id: facts.attempt.id.as_ulid().to_string(),
                    created_at: facts.attempt.created_at,
                    succeeded: facts.succeeded.is_some(),
                    error_message: facts.failed.as_ref().map(|f| f.error_message.clone()),
                })
                .collect(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
