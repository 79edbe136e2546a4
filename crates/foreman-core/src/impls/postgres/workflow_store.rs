//! PostgreSQL workflow store.
//!
//! `lock_root()` opens a transaction and takes `SELECT ... FOR UPDATE` on the
//! root row. Every read and write of the returned [`RootTx`] goes through that
//! transaction, including enqueued tasks, so facts and follow-up tasks commit
//! together.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use crate::domain::{
    AttemptFacts, AttemptId, AttemptRecord, AttemptRef, EngineError, FailedFact, NewTask,
    RootFailure, RootId, RootRef, SucceededFact, WorkflowFamily, WorkflowRoot,
};
use crate::ports::{Clock, IdGenerator, RootTx, WorkflowStore};

use super::{parse_id, store_err};

#[derive(Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { pool, clock, ids }
    }
}

fn root_from_row(family: &WorkflowFamily, row: &PgRow) -> Result<WorkflowRoot, EngineError> {
    let decode = || store_err("decode root");
    let id: String = row.try_get("id").map_err(decode())?;
    let parent_family: Option<String> = row.try_get("parent_family").map_err(decode())?;
    let parent_id: Option<String> = row.try_get("parent_id").map_err(decode())?;
    let parent = match (parent_family, parent_id) {
        (Some(f), Some(id)) => Some(RootRef::new(WorkflowFamily::new(f)?, parse_id(&id)?)),
        _ => None,
    };
    Ok(WorkflowRoot {
        id: parse_id(&id)?,
        family: family.clone(),
        metadata: row.try_get("metadata").map_err(decode())?,
        parent,
        created_at: row.try_get("created_at").map_err(decode())?,
    })
}

async fn insert_root<'e>(
    exec: impl PgExecutor<'e>,
    root: &WorkflowRoot,
) -> Result<(), EngineError> {
    let sql = format!(
        "INSERT INTO {}_roots (id, metadata, parent_family, parent_id, created_at) \
         VALUES ($1, $2, $3, $4, $5)",
        root.family
    );
    sqlx::query(&sql)
        .bind(root.id.as_ulid().to_string())
        .bind(&root.metadata)
        .bind(root.parent.as_ref().map(|p| p.family.as_str().to_string()))
        .bind(root.parent.as_ref().map(|p| p.root_id.as_ulid().to_string()))
        .bind(root.created_at)
        .execute(exec)
        .await
        .map_err(store_err("insert root"))?;
    Ok(())
}

async fn fetch_root<'e>(
    exec: impl PgExecutor<'e>,
    root: &RootRef,
    for_update: bool,
) -> Result<Option<WorkflowRoot>, EngineError> {
    let sql = format!(
        "SELECT id, metadata, parent_family, parent_id, created_at FROM {}_roots WHERE id = $1{}",
        root.family,
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query(&sql)
        .bind(root.root_id.as_ulid().to_string())
        .fetch_optional(exec)
        .await
        .map_err(store_err("fetch root"))?;
    row.map(|r| root_from_row(&root.family, &r)).transpose()
}

async fn fetch_attempts<'e>(
    exec: impl PgExecutor<'e>,
    root: &RootRef,
) -> Result<Vec<AttemptFacts>, EngineError> {
    let f = root.family.as_str();
    let sql = format!(
        r#"
        SELECT a.id, a.created_at,
               s.created_at AS succeeded_at,
               x.error_message, x.created_at AS failed_at
        FROM {f}_attempts a
        LEFT JOIN {f}_succeeded s ON s.attempt_id = a.id
        LEFT JOIN {f}_failed x ON x.attempt_id = a.id
        WHERE a.root_id = $1
        ORDER BY a.created_at, a.id
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(root.root_id.as_ulid().to_string())
        .fetch_all(exec)
        .await
        .map_err(store_err("fetch attempts"))?;

    rows.iter()
        .map(|row| {
            let decode = || store_err("decode attempt");
            let id: String = row.try_get("id").map_err(decode())?;
            let attempt_id: AttemptId = parse_id(&id)?;
            let succeeded_at: Option<chrono::DateTime<chrono::Utc>> =
                row.try_get("succeeded_at").map_err(decode())?;
            let error_message: Option<String> = row.try_get("error_message").map_err(decode())?;
            let failed_at: Option<chrono::DateTime<chrono::Utc>> =
                row.try_get("failed_at").map_err(decode())?;
            Ok(AttemptFacts {
                attempt: AttemptRecord {
                    id: attempt_id,
                    root_id: root.root_id,
                    created_at: row.try_get("created_at").map_err(decode())?,
                },
                succeeded: succeeded_at.map(|created_at| SucceededFact {
                    attempt_id,
                    created_at,
                }),
                failed: match (error_message, failed_at) {
                    (Some(error_message), Some(created_at)) => Some(FailedFact {
                        attempt_id,
                        error_message,
                        created_at,
                    }),
                    _ => None,
                },
            })
        })
        .collect()
}

async fn fetch_root_failure<'e>(
    exec: impl PgExecutor<'e>,
    root: &RootRef,
) -> Result<Option<RootFailure>, EngineError> {
    let sql = format!(
        "SELECT message, created_at FROM {}_root_failures WHERE root_id = $1",
        root.family
    );
    let row = sqlx::query(&sql)
        .bind(root.root_id.as_ulid().to_string())
        .fetch_optional(exec)
        .await
        .map_err(store_err("fetch root failure"))?;
    row.map(|row| {
        Ok(RootFailure {
            root_id: root.root_id,
            message: row.try_get("message").map_err(store_err("decode root failure"))?,
            created_at: row
                .try_get("created_at")
                .map_err(store_err("decode root failure"))?,
        })
    })
    .transpose()
}

async fn attempt_exists<'e>(
    exec: impl PgExecutor<'e>,
    family: &WorkflowFamily,
    root_id: RootId,
    attempt_id: AttemptId,
) -> Result<bool, EngineError> {
    let sql = format!("SELECT 1 FROM {family}_attempts WHERE id = $1 AND root_id = $2");
    let row = sqlx::query(&sql)
        .bind(attempt_id.as_ulid().to_string())
        .bind(root_id.as_ulid().to_string())
        .fetch_optional(exec)
        .await
        .map_err(store_err("attempt exists"))?;
    Ok(row.is_some())
}

async fn insert_success<'e>(
    exec: impl PgExecutor<'e>,
    family: &WorkflowFamily,
    attempt_id: AttemptId,
    at: chrono::DateTime<chrono::Utc>,
) -> Result<bool, EngineError> {
    let sql = format!(
        "INSERT INTO {family}_succeeded (attempt_id, created_at) VALUES ($1, $2) \
         ON CONFLICT (attempt_id) DO NOTHING"
    );
    let done = sqlx::query(&sql)
        .bind(attempt_id.as_ulid().to_string())
        .bind(at)
        .execute(exec)
        .await
        .map_err(store_err("insert success"))?;
    Ok(done.rows_affected() == 1)
}

async fn insert_failure<'e>(
    exec: impl PgExecutor<'e>,
    family: &WorkflowFamily,
    attempt_id: AttemptId,
    message: &str,
    at: chrono::DateTime<chrono::Utc>,
) -> Result<bool, EngineError> {
    let sql = format!(
        "INSERT INTO {family}_failed (attempt_id, error_message, created_at) VALUES ($1, $2, $3) \
         ON CONFLICT (attempt_id) DO NOTHING"
    );
    let done = sqlx::query(&sql)
        .bind(attempt_id.as_ulid().to_string())
        .bind(message)
        .bind(at)
        .execute(exec)
        .await
        .map_err(store_err("insert failure"))?;
    Ok(done.rows_affected() == 1)
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn create_root(
        &self,
        family: &WorkflowFamily,
        metadata: serde_json::Value,
        parent: Option<RootRef>,
    ) -> Result<WorkflowRoot, EngineError> {
        let root = WorkflowRoot {
            id: self.ids.root_id(),
            family: family.clone(),
            metadata,
            parent,
            created_at: self.clock.now(),
        };
        insert_root(&self.pool, &root).await?;
        Ok(root)
    }

    async fn get_root(&self, root: &RootRef) -> Result<Option<WorkflowRoot>, EngineError> {
        fetch_root(&self.pool, root, false).await
    }

    async fn children(
        &self,
        parent: &RootRef,
        family: &WorkflowFamily,
    ) -> Result<Vec<WorkflowRoot>, EngineError> {
        let sql = format!(
            "SELECT id, metadata, parent_family, parent_id, created_at FROM {family}_roots \
             WHERE parent_family = $1 AND parent_id = $2 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(parent.family.as_str())
            .bind(parent.root_id.as_ulid().to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("children"))?;
        rows.iter().map(|r| root_from_row(family, r)).collect()
    }

    async fn attempts(&self, root: &RootRef) -> Result<Vec<AttemptFacts>, EngineError> {
        fetch_attempts(&self.pool, root).await
    }

    async fn root_failure(&self, root: &RootRef) -> Result<Option<RootFailure>, EngineError> {
        fetch_root_failure(&self.pool, root).await
    }

    async fn record_success(&self, attempt: &AttemptRef) -> Result<bool, EngineError> {
        if !attempt_exists(&self.pool, &attempt.family, attempt.root_id, attempt.attempt_id).await? {
            return Err(EngineError::AttemptNotFound {
                family: attempt.family.clone(),
                attempt_id: attempt.attempt_id,
            });
        }
        insert_success(&self.pool, &attempt.family, attempt.attempt_id, self.clock.now()).await
    }

    async fn record_failure(
        &self,
        attempt: &AttemptRef,
        message: &str,
    ) -> Result<bool, EngineError> {
        if !attempt_exists(&self.pool, &attempt.family, attempt.root_id, attempt.attempt_id).await? {
            return Err(EngineError::AttemptNotFound {
                family: attempt.family.clone(),
                attempt_id: attempt.attempt_id,
            });
        }
        insert_failure(
            &self.pool,
            &attempt.family,
            attempt.attempt_id,
            message,
            self.clock.now(),
        )
        .await
    }

    #[instrument(skip(self), fields(family = %root.family, root_id = %root.root_id), err)]
    async fn lock_root(&self, root: &RootRef) -> Result<Box<dyn RootTx>, EngineError> {
        let mut tx = self.pool.begin().await.map_err(store_err("lock_root begin"))?;
        let record = fetch_root(&mut *tx, root, true)
            .await?
            .ok_or_else(|| EngineError::RootNotFound {
                family: root.family.clone(),
                root_id: root.root_id,
            })?;
        debug!("root locked");
        Ok(Box::new(PgRootTx {
            tx,
            root: record,
            clock: Arc::clone(&self.clock),
            ids: Arc::clone(&self.ids),
        }))
    }
}

struct PgRootTx {
    tx: Transaction<'static, Postgres>,
    root: WorkflowRoot,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl PgRootTx {
    async fn require_attempt(&mut self, attempt_id: AttemptId) -> Result<(), EngineError> {
        if attempt_exists(&mut *self.tx, &self.root.family, self.root.id, attempt_id).await? {
            Ok(())
        } else {
            Err(EngineError::AttemptNotFound {
                family: self.root.family.clone(),
                attempt_id,
            })
        }
    }
}

#[async_trait]
impl RootTx for PgRootTx {
    fn root(&self) -> &WorkflowRoot {
        &self.root
    }

    async fn attempts(&mut self) -> Result<Vec<AttemptFacts>, EngineError> {
        let root = self.root.root_ref();
        fetch_attempts(&mut *self.tx, &root).await
    }

    async fn root_failure(&mut self) -> Result<Option<RootFailure>, EngineError> {
        let root = self.root.root_ref();
        fetch_root_failure(&mut *self.tx, &root).await
    }

    async fn create_attempt(&mut self) -> Result<AttemptRecord, EngineError> {
        let attempt = AttemptRecord {
            id: self.ids.attempt_id(),
            root_id: self.root.id,
            created_at: self.clock.now(),
        };
        let sql = format!(
            "INSERT INTO {}_attempts (id, root_id, created_at) VALUES ($1, $2, $3)",
            self.root.family
        );
        sqlx::query(&sql)
            .bind(attempt.id.as_ulid().to_string())
            .bind(attempt.root_id.as_ulid().to_string())
            .bind(attempt.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(store_err("create attempt"))?;
        Ok(attempt)
    }

    async fn record_success(&mut self, attempt_id: AttemptId) -> Result<(), EngineError> {
        self.require_attempt(attempt_id).await?;
        let now = self.clock.now();
        insert_success(&mut *self.tx, &self.root.family, attempt_id, now).await?;
        Ok(())
    }

    async fn record_failure(
        &mut self,
        attempt_id: AttemptId,
        message: &str,
    ) -> Result<(), EngineError> {
        self.require_attempt(attempt_id).await?;
        let now = self.clock.now();
        insert_failure(&mut *self.tx, &self.root.family, attempt_id, message, now).await?;
        Ok(())
    }

    async fn record_root_failure(&mut self, message: &str) -> Result<(), EngineError> {
        let sql = format!(
            "INSERT INTO {}_root_failures (root_id, message, created_at) VALUES ($1, $2, $3) \
             ON CONFLICT (root_id) DO NOTHING",
            self.root.family
        );
        sqlx::query(&sql)
            .bind(self.root.id.as_ulid().to_string())
            .bind(message)
            .bind(self.clock.now())
            .execute(&mut *self.tx)
            .await
            .map_err(store_err("record root failure"))?;
        Ok(())
    }

    async fn create_root(
        &mut self,
        family: &WorkflowFamily,
        metadata: serde_json::Value,
        parent: Option<RootRef>,
    ) -> Result<WorkflowRoot, EngineError> {
        let root = WorkflowRoot {
            id: self.ids.root_id(),
            family: family.clone(),
            metadata,
            parent,
            created_at: self.clock.now(),
        };
        insert_root(&mut *self.tx, &root).await?;
        Ok(root)
    }

    async fn enqueue(&mut self, task: NewTask) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, payload, enqueued_at, scheduled_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(self.ids.task_id().as_ulid().to_string())
        .bind(task.task_type.as_str())
        .bind(&task.payload)
        .bind(self.clock.now())
        .bind(task.scheduled_at)
        .execute(&mut *self.tx)
        .await
        .map_err(store_err("enqueue in tx"))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), EngineError> {
        self.tx.commit().await.map_err(store_err("commit root tx"))
    }
}
