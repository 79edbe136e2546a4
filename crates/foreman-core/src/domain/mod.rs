//! Domain model (ids, tasks, facts, envelopes, policies, decisions, errors).

pub mod decision;
pub mod envelope;
pub mod errors;
pub mod facts;
pub mod ids;
pub mod retry;
pub mod state;
pub mod task;
pub mod webhook;

pub use decision::{Decider, Decision, DefaultDecider, Terminal};
pub use envelope::{
    ChannelPayload, ErrorEnvelope, FailureKind, FunctionCall, HandlerResult, ResultStatus,
    SuccessEnvelope,
};
pub use errors::{EngineError, ErrorKind};
pub use facts::{
    AttemptFacts, AttemptRecord, AttemptRef, FactSummary, FailedFact, RootFailure, RootRef,
    SucceededFact, WorkflowFamily, WorkflowRoot,
};
pub use ids::{AttemptId, LeaseId, RootId, TaskId, WebhookId};
pub use retry::{Backoff, SupervisorPolicy};
pub use state::WorkflowState;
pub use task::{Completion, ErrorEntry, Lease, LeasedTask, NewTask, Task, TaskType};
pub use webhook::WebhookResponse;
