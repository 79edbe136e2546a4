//! Workflow state projection.

use serde::{Deserialize, Serialize};

use super::facts::FactSummary;

/// Derived state of one workflow root.
///
/// - NoAttempt -> AttemptOutstanding -> TerminalSuccess
/// - AttemptOutstanding -> (failure) -> NoAttempt ... -> TerminalFailure
///
/// `NoAttempt` also covers "every attempt so far has failed and we are
/// waiting for the next one". Never stored; always recomputed from facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    NoAttempt,
    AttemptOutstanding,
    TerminalSuccess,
    TerminalFailure,
}

impl WorkflowState {
    pub fn derive(summary: &FactSummary, max_attempts: u32) -> Self {
        if summary.succeeded {
            WorkflowState::TerminalSuccess
        } else if summary.root_failed || summary.failed_count >= max_attempts {
            WorkflowState::TerminalFailure
        } else if summary.outstanding > 0 {
            WorkflowState::AttemptOutstanding
        } else {
            WorkflowState::NoAttempt
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::TerminalSuccess | WorkflowState::TerminalFailure
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_wins_over_failures() {
        let summary = FactSummary {
            attempts: 3,
            succeeded: true,
            failed_count: 2,
            ..Default::default()
        };
        assert_eq!(
            WorkflowState::derive(&summary, 2),
            WorkflowState::TerminalSuccess
        );
    }

    #[test]
    fn exhausted_failures_are_terminal() {
        let summary = FactSummary {
            attempts: 2,
            failed_count: 2,
            ..Default::default()
        };
        let state = WorkflowState::derive(&summary, 2);
        assert_eq!(state, WorkflowState::TerminalFailure);
        assert!(state.is_terminal());
    }

    #[test]
    fn outstanding_attempt_is_not_terminal() {
        let summary = FactSummary {
            attempts: 1,
            outstanding: 1,
            ..Default::default()
        };
        let state = WorkflowState::derive(&summary, 5);
        assert_eq!(state, WorkflowState::AttemptOutstanding);
        assert!(!state.is_terminal());
        assert_eq!(
            WorkflowState::derive(&FactSummary::default(), 5),
            WorkflowState::NoAttempt
        );
    }
}
