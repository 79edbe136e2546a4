//! foreman-core
//!
//! Durable task engine: task store with leasing, dispatcher, handler
//! contract, supervisors and supervision trees, webhook store-and-verify.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, facts, envelope, retry, decision, state, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, WorkflowStore, WebhookStore, Clock, Provider など）
//! - **typed**: 型付き handler API（Args, Function, Prepare, HandlerRegistry, PayloadCodec）
//! - **impls**: ストア実装（in-memory、`postgres` feature で PostgreSQL）
//! - **app**: builder, runtime, dispatcher, processors, supervisor, tree, webhook
//! - **config**: エンジン設定（JSON）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{BuildError, EngineBuilder, Runtime};
pub use config::EngineConfig;
pub use domain::EngineError;
