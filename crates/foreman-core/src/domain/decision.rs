//! Decision model: what one supervisor run does next.
//!
//! The Decider is a pure function from a [`FactSummary`] to a [`Decision`].
//! Executing the decision (creating attempts, enqueueing, recording a root
//! failure) is left to the supervisor.

use std::time::Duration;

use super::facts::FactSummary;
use super::retry::SupervisorPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Succeeded,
    Exhausted { failed_count: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Stop: no new attempt, no re-enqueue.
    Stop(Terminal),

    /// Create a new attempt, then check again after `next_check`.
    ScheduleAttempt { next_check: Duration },

    /// An attempt is in flight; check again after `next_check`.
    Wait { next_check: Duration },
}

impl Decision {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Decision::Stop(_))
    }

    pub fn next_check(&self) -> Option<Duration> {
        match self {
            Decision::Stop(_) => None,
            Decision::ScheduleAttempt { next_check } | Decision::Wait { next_check } => {
                Some(*next_check)
            }
        }
    }
}

pub trait Decider: Send + Sync {
    fn decide(&self, summary: &FactSummary) -> Decision;
}

/// Attempt-based retry with exponential backoff:
/// - any success -> Stop(Succeeded)
/// - failed_count >= max_attempts -> Stop(Exhausted)
/// - nothing outstanding -> ScheduleAttempt
/// - otherwise -> Wait
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    policy: SupervisorPolicy,
}

impl DefaultDecider {
    pub fn new(policy: SupervisorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.policy
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, summary: &FactSummary) -> Decision {
        if summary.succeeded {
            return Decision::Stop(Terminal::Succeeded);
        }
        if summary.root_failed || summary.failed_count >= self.policy.max_attempts {
            return Decision::Stop(Terminal::Exhausted {
                failed_count: summary.failed_count,
            });
        }
        let next_check = self.policy.next_check(summary.failed_count);
        if summary.outstanding == 0 {
            Decision::ScheduleAttempt { next_check }
        } else {
            Decision::Wait { next_check }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::retry::Backoff;

    fn decider(max_attempts: u32) -> DefaultDecider {
        DefaultDecider::new(
            SupervisorPolicy::default()
                .with_max_attempts(max_attempts)
                .with_backoff(Backoff::new(
                    Duration::from_secs(5),
                    Duration::from_secs(60),
                )),
        )
    }

    #[test]
    fn schedules_last_attempt_before_exhaustion() {
        let summary = FactSummary {
            attempts: 2,
            failed_count: 2,
            ..Default::default()
        };
        assert_eq!(
            decider(3).decide(&summary),
            Decision::ScheduleAttempt {
                next_check: Duration::from_secs(20)
            }
        );
    }

    #[test]
    fn stops_when_attempts_exhausted() {
        let summary = FactSummary {
            attempts: 3,
            failed_count: 3,
            ..Default::default()
        };
        let decision = decider(3).decide(&summary);
        assert_eq!(
            decision,
            Decision::Stop(Terminal::Exhausted { failed_count: 3 })
        );
        assert_eq!(decision.next_check(), None);
    }

    #[test]
    fn waits_while_attempt_outstanding() {
        let summary = FactSummary {
            attempts: 2,
            failed_count: 1,
            outstanding: 1,
            ..Default::default()
        };
        assert_eq!(
            decider(3).decide(&summary),
            Decision::Wait {
                next_check: Duration::from_secs(10)
            }
        );
    }

    #[test]
    fn success_stops_even_with_outstanding_attempts() {
        let summary = FactSummary {
            attempts: 2,
            succeeded: true,
            outstanding: 1,
            ..Default::default()
        };
        assert!(decider(3).decide(&summary).is_terminal());
    }
}
