//! Workflow facts: roots, attempts and the append-only outcome records.
//!
//! Each workflow family owns its own quadruple of tables
//! (roots / attempts / succeeded / failed, plus root failures). Nothing here is
//! ever updated in place; "current state" is always the projection in
//! [`FactSummary`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::EngineError;
use super::ids::{AttemptId, RootId};

const MAX_FAMILY_LEN: usize = 48;

/// Name of a workflow family, e.g. `message_send`.
///
/// Restricted to `[a-z][a-z0-9_]*` because SQL backends derive table names
/// from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkflowFamily(String);

impl WorkflowFamily {
    pub fn new(name: impl Into<String>) -> Result<Self, EngineError> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_head = chars.next().is_some_and(|c| c.is_ascii_lowercase());
        let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid_head || !valid_tail || name.len() > MAX_FAMILY_LEN {
            return Err(EngineError::InvalidFamily(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for WorkflowFamily {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WorkflowFamily> for String {
    fn from(value: WorkflowFamily) -> Self {
        value.0
    }
}

/// Points at one root of one family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RootRef {
    pub family: WorkflowFamily,
    pub root_id: RootId,
}

impl RootRef {
    pub fn new(family: WorkflowFamily, root_id: RootId) -> Self {
        Self { family, root_id }
    }
}

impl fmt::Display for RootRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family, self.root_id)
    }
}

/// Points at the attempt a channel task was scheduled for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptRef {
    pub family: WorkflowFamily,
    pub root_id: RootId,
    pub attempt_id: AttemptId,
}

impl AttemptRef {
    pub fn root(&self) -> RootRef {
        RootRef::new(self.family.clone(), self.root_id)
    }
}

/// One logical process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRoot {
    pub id: RootId,
    pub family: WorkflowFamily,
    /// Business data handed to channel tasks as `data`.
    pub metadata: serde_json::Value,
    pub parent: Option<RootRef>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRoot {
    pub fn root_ref(&self) -> RootRef {
        RootRef::new(self.family.clone(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: AttemptId,
    pub root_id: RootId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SucceededFact {
    pub attempt_id: AttemptId,
    pub created_at: DateTime<Utc>,
}

/// At most one per attempt; duplicate inserts are no-ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedFact {
    pub attempt_id: AttemptId,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

/// Recorded once when a root exhausts its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFailure {
    pub root_id: RootId,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// An attempt joined with whatever outcome facts exist for it.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFacts {
    pub attempt: AttemptRecord,
    pub succeeded: Option<SucceededFact>,
    pub failed: Option<FailedFact>,
}

impl AttemptFacts {
    pub fn is_outstanding(&self) -> bool {
        self.succeeded.is_none() && self.failed.is_none()
    }
}

/// Projection of a root's facts. Computed, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactSummary {
    pub attempts: u32,
    pub succeeded: bool,
    pub failed_count: u32,
    pub outstanding: u32,
    pub root_failed: bool,
    pub oldest_outstanding_at: Option<DateTime<Utc>>,
}

impl FactSummary {
    pub fn from_facts(attempts: &[AttemptFacts], root_failure: Option<&RootFailure>) -> Self {
        let mut summary = FactSummary {
            attempts: attempts.len() as u32,
            root_failed: root_failure.is_some(),
            ..FactSummary::default()
        };
        for facts in attempts {
            if facts.succeeded.is_some() {
                summary.succeeded = true;
            } else if facts.failed.is_some() {
                summary.failed_count += 1;
            } else {
                summary.outstanding += 1;
                let created_at = facts.attempt.created_at;
                summary.oldest_outstanding_at = Some(match summary.oldest_outstanding_at {
                    Some(prev) if prev <= created_at => prev,
                    _ => created_at,
                });
            }
        }
        summary
    }
}
