//! App - アプリケーション層
//!
//! ports を組み合わせてエンジンの振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: 登録と起動時検証（Fail-fast）
//! - **Runtime**: workflow の開始、enqueue、status
//! - **Dispatcher / WorkerGroup**: dequeue → route → complete のループ
//! - **Processors**: business function と channel（before → provider → success / error）
//! - **Supervisor**: facts → decide → effects の state machine
//! - **TreeSupervisor**: 子 supervisor を polling で束ねる parent
//! - **Webhook**: store-and-verify
//! - **Facts**: engine 同梱の success / error handler

pub mod builder;
pub mod facts;
pub mod processors;
pub mod runtime;
pub mod status;
pub mod supervisor;
pub mod tree;
pub mod webhook;
pub mod worker_loop;

pub use self::builder::{BuildError, EngineBuilder, Stores};
pub use self::facts::{CorrelateRequest, RECORD_FAILURE, RECORD_SUCCESS, RecordFailure, RecordSuccess};
pub use self::processors::{
    ChannelProcessor, FUNCTION_TASK_TYPE, FunctionProcessor, Processor, ProcessorRegistry,
};
pub use self::runtime::Runtime;
pub use self::status::{AttemptStatus, WorkflowStatus};
pub use self::supervisor::{ChannelWorkflow, SuperviseArgs, Supervisor, supervisor_function_name};
pub use self::tree::{ChildState, TreeSupervisor, TreeWorkflow};
pub use self::webhook::{
    VerifyError, WebhookBinding, WebhookCommit, WebhookIngress, WebhookVerifier,
};
pub use self::worker_loop::{Dispatcher, WorkerGroup};
