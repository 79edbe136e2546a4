//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。
//! 各 trait は永続化（in-memory / PostgreSQL）や外部 provider への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - ストアが source of truth（プロセス内シングルトンは持たない）
//! - 協調はすべてストアのトランザクション保証を通して行う

pub mod clock;
pub mod id_generator;
pub mod provider;
pub mod task_store;
pub mod webhook_store;
pub mod workflow_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::provider::{Provider, ProviderError};
pub use self::task_store::{QueueCounts, TaskStore};
pub use self::webhook_store::WebhookStore;
pub use self::workflow_store::{RootTx, WorkflowStore};
