//! PostgreSQL task store.
//!
//! ## Dequeue
//!
//! Inside one transaction:
//! 1. pick the oldest eligible task with `FOR UPDATE SKIP LOCKED`
//! 2. insert the lease with a second statement guarded by `NOT EXISTS`
//!
//! Under READ COMMITTED the first statement may evaluate its lease filter
//! against a snapshot taken before a concurrent claimer committed, then lock
//! the task once that claimer releases it. The second statement takes a new
//! snapshot after the row lock is held, so it sees the competing lease and
//! inserts nothing. That candidate is then skipped and the next one tried.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use crate::domain::{
    EngineError, ErrorEntry, Lease, LeasedTask, NewTask, Task, TaskId, TaskType,
};
use crate::ports::{Clock, IdGenerator, QueueCounts, TaskStore};

use super::{parse_id, store_err};

/// Candidates rejected by the guarded insert before giving up for this call.
const MAX_CLAIM_RETRIES: usize = 8;

#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    lease_ttl: chrono::Duration,
}

impl PgTaskStore {
    pub fn new(
        pool: PgPool,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            pool,
            clock,
            ids,
            lease_ttl: chrono::Duration::from_std(lease_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
        }
    }
}

fn task_from_row(row: &sqlx::postgres::PgRow) -> Result<Task, EngineError> {
    let id: String = row.try_get("id").map_err(store_err("decode task"))?;
    let task_type: String = row.try_get("task_type").map_err(store_err("decode task"))?;
    Ok(Task {
        id: parse_id(&id)?,
        task_type: TaskType::new(task_type),
        payload: row.try_get("payload").map_err(store_err("decode task"))?,
        enqueued_at: row.try_get("enqueued_at").map_err(store_err("decode task"))?,
        scheduled_at: row.try_get("scheduled_at").map_err(store_err("decode task"))?,
    })
}

#[async_trait]
impl TaskStore for PgTaskStore {
    #[instrument(skip(self, new_task), fields(task_type = %new_task.task_type), err)]
    async fn enqueue(&self, new_task: NewTask) -> Result<TaskId, EngineError> {
        let task_id = self.ids.task_id();
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, payload, enqueued_at, scheduled_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(task_id.as_ulid().to_string())
        .bind(new_task.task_type.as_str())
        .bind(&new_task.payload)
        .bind(self.clock.now())
        .bind(new_task.scheduled_at)
        .execute(&self.pool)
        .await
        .map_err(store_err("enqueue"))?;
        Ok(task_id)
    }

    async fn dequeue(&self) -> Result<Option<LeasedTask>, EngineError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(store_err("dequeue begin"))?;
        let mut rejected: Vec<String> = Vec::new();

        for _ in 0..MAX_CLAIM_RETRIES {
            let row = sqlx::query(
                r#"
                SELECT t.id, t.task_type, t.payload, t.enqueued_at, t.scheduled_at
                FROM tasks t
                WHERE t.scheduled_at <= $1
                  AND NOT (t.id = ANY($2))
                  AND NOT EXISTS (SELECT 1 FROM task_completions c WHERE c.task_id = t.id)
                  AND NOT EXISTS (
                      SELECT 1 FROM task_leases l
                      WHERE l.task_id = t.id AND l.expires_at > $1
                  )
                ORDER BY t.scheduled_at, t.id
                LIMIT 1
                FOR UPDATE OF t SKIP LOCKED
                "#,
            )
            .bind(now)
            .bind(&rejected)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err("dequeue select"))?;

            let Some(row) = row else {
                tx.commit().await.map_err(store_err("dequeue commit"))?;
                return Ok(None);
            };
            let task = task_from_row(&row)?;
            let task_key = task.id.as_ulid().to_string();

            let lease = Lease {
                id: self.ids.lease_id(),
                task_id: task.id,
                leased_at: now,
                expires_at: now + self.lease_ttl,
            };
            let inserted = sqlx::query(
                r#"
                INSERT INTO task_leases (id, task_id, leased_at, expires_at)
                SELECT $1, $2, $3, $4
                WHERE NOT EXISTS (
                    SELECT 1 FROM task_leases WHERE task_id = $2 AND expires_at > $3
                )
                AND NOT EXISTS (SELECT 1 FROM task_completions WHERE task_id = $2)
                "#,
            )
            .bind(lease.id.as_ulid().to_string())
            .bind(&task_key)
            .bind(lease.leased_at)
            .bind(lease.expires_at)
            .execute(&mut *tx)
            .await
            .map_err(store_err("dequeue lease"))?
            .rows_affected();

            if inserted == 1 {
                tx.commit().await.map_err(store_err("dequeue commit"))?;
                debug!(task_id = %task.id, task_type = %task.task_type, "lease granted");
                return Ok(Some(LeasedTask { task, lease }));
            }
            debug!(task_id = %task.id, "lost claim race; trying next candidate");
            rejected.push(task_key);
        }

        tx.commit().await.map_err(store_err("dequeue commit"))?;
        Ok(None)
    }

    async fn complete(&self, task_id: TaskId) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO task_completions (task_id, completed_at)
            VALUES ($1, $2)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(task_id.as_ulid().to_string())
        .bind(self.clock.now())
        .execute(&self.pool)
        .await
        .map_err(store_err("complete"))?;
        Ok(())
    }

    async fn record_error(&self, task_id: TaskId, message: &str) -> Result<(), EngineError> {
        sqlx::query("INSERT INTO task_errors (task_id, message, created_at) VALUES ($1, $2, $3)")
            .bind(task_id.as_ulid().to_string())
            .bind(message)
            .bind(self.clock.now())
            .execute(&self.pool)
            .await
            .map_err(store_err("record_error"))?;
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, EngineError> {
        let row = sqlx::query(
            "SELECT id, task_type, payload, enqueued_at, scheduled_at FROM tasks WHERE id = $1",
        )
        .bind(task_id.as_ulid().to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("get task"))?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn is_completed(&self, task_id: TaskId) -> Result<bool, EngineError> {
        let row = sqlx::query("SELECT 1 FROM task_completions WHERE task_id = $1")
            .bind(task_id.as_ulid().to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("is_completed"))?;
        Ok(row.is_some())
    }

    async fn leases(&self, task_id: TaskId) -> Result<Vec<Lease>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT id, leased_at, expires_at FROM task_leases
            WHERE task_id = $1
            ORDER BY leased_at, id
            "#,
        )
        .bind(task_id.as_ulid().to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("leases"))?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(store_err("decode lease"))?;
                Ok(Lease {
                    id: parse_id(&id)?,
                    task_id,
                    leased_at: row.try_get("leased_at").map_err(store_err("decode lease"))?,
                    expires_at: row.try_get("expires_at").map_err(store_err("decode lease"))?,
                })
            })
            .collect()
    }

    async fn errors(&self, task_id: TaskId) -> Result<Vec<ErrorEntry>, EngineError> {
        let rows = sqlx::query(
            "SELECT message, created_at FROM task_errors WHERE task_id = $1 ORDER BY id",
        )
        .bind(task_id.as_ulid().to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("errors"))?;

        rows.iter()
            .map(|row| {
                Ok(ErrorEntry {
                    task_id,
                    message: row.try_get("message").map_err(store_err("decode error"))?,
                    created_at: row.try_get("created_at").map_err(store_err("decode error"))?,
                })
            })
            .collect()
    }

    async fn pending(&self) -> Result<Vec<Task>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.task_type, t.payload, t.enqueued_at, t.scheduled_at
            FROM tasks t
            WHERE NOT EXISTS (SELECT 1 FROM task_completions c WHERE c.task_id = t.id)
            ORDER BY t.scheduled_at, t.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("pending"))?;
        rows.iter().map(task_from_row).collect()
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts, EngineError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE c.task_id IS NULL AND NOT l.live) AS waiting,
                COUNT(*) FILTER (WHERE c.task_id IS NULL AND l.live)     AS leased,
                COUNT(c.task_id)                                         AS completed,
                (SELECT COUNT(*) FROM task_errors)                       AS errors
            FROM tasks t
            LEFT JOIN task_completions c ON c.task_id = t.id
            CROSS JOIN LATERAL (
                SELECT EXISTS (
                    SELECT 1 FROM task_leases x WHERE x.task_id = t.id AND x.expires_at > $1
                ) AS live
            ) l
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err("counts"))?;

        let count = |name: &str| -> Result<usize, EngineError> {
            let n: i64 = row.try_get(name).map_err(store_err("decode counts"))?;
            Ok(n.max(0) as usize)
        };
        Ok(QueueCounts {
            waiting: count("waiting")?,
            leased: count("leased")?,
            completed: count("completed")?,
            errors: count("errors")?,
        })
    }
}
