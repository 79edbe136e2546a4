//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore / InMemoryWorkflowStore / InMemoryWebhookStore**:
//!   開発・テスト用。単一プロセス内でのみ排他が効く
//! - **postgres** (`postgres` feature): 本番用。排他は行ロックで行う

pub mod inmem_task_store;
pub mod inmem_webhook_store;
pub mod inmem_workflow_store;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use self::inmem_task_store::InMemoryTaskStore;
pub use self::inmem_webhook_store::InMemoryWebhookStore;
pub use self::inmem_workflow_store::InMemoryWorkflowStore;
