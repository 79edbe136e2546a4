//! In-memory task store.
//!
//! The single state mutex plays the role of `FOR UPDATE SKIP LOCKED`:
//! selecting a candidate and appending its lease happen under one lock, so
//! concurrent dequeuers never observe the same task as claimable.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{
    Completion, EngineError, ErrorEntry, Lease, LeasedTask, NewTask, Task, TaskId,
};
use crate::ports::{Clock, IdGenerator, QueueCounts, TaskStore};

#[derive(Default)]
struct TaskState {
    tasks: HashMap<TaskId, Task>,
    /// Not-yet-completed tasks in dequeue order.
    pending: BTreeSet<(DateTime<Utc>, TaskId)>,
    leases: HashMap<TaskId, Vec<Lease>>,
    completions: HashMap<TaskId, Completion>,
    errors: Vec<ErrorEntry>,
}

impl TaskState {
    fn has_live_lease(&self, task_id: TaskId, now: DateTime<Utc>) -> bool {
        self.leases
            .get(&task_id)
            .is_some_and(|leases| leases.iter().any(|l| l.is_live(now)))
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<TaskState>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    lease_ttl: chrono::Duration,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>, lease_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(TaskState::default()),
            clock,
            ids,
            lease_ttl: chrono::Duration::from_std(lease_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, new_task: NewTask) -> Result<TaskId, EngineError> {
        let task = Task {
            id: self.ids.task_id(),
            task_type: new_task.task_type,
            payload: new_task.payload,
            enqueued_at: self.clock.now(),
            scheduled_at: new_task.scheduled_at,
        };
        let task_id = task.id;

        let mut state = self.state.lock().await;
        state.pending.insert((task.scheduled_at, task_id));
        state.tasks.insert(task_id, task);
        Ok(task_id)
    }

    async fn dequeue(&self) -> Result<Option<LeasedTask>, EngineError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let candidate = state
            .pending
            .iter()
            .take_while(|(scheduled_at, _)| *scheduled_at <= now)
            .map(|(_, task_id)| *task_id)
            .find(|task_id| !state.has_live_lease(*task_id, now));

        let Some(task_id) = candidate else {
            return Ok(None);
        };

        let task = state
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| EngineError::Invariant(format!("pending index points at missing {task_id}")))?;

        let lease = Lease {
            id: self.ids.lease_id(),
            task_id,
            leased_at: now,
            expires_at: now + self.lease_ttl,
        };
        state.leases.entry(task_id).or_default().push(lease.clone());
        debug!(%task_id, task_type = %task.task_type, expires_at = %lease.expires_at, "lease granted");

        Ok(Some(LeasedTask { task, lease }))
    }

    async fn complete(&self, task_id: TaskId) -> Result<(), EngineError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get(&task_id) else {
            return Err(EngineError::Invariant(format!("complete() on unknown {task_id}")));
        };
        let key = (task.scheduled_at, task_id);
        if state.completions.contains_key(&task_id) {
            return Ok(());
        }
        state.pending.remove(&key);
        state.completions.insert(
            task_id,
            Completion {
                task_id,
                completed_at: now,
            },
        );
        Ok(())
    }

    async fn record_error(&self, task_id: TaskId, message: &str) -> Result<(), EngineError> {
        let entry = ErrorEntry {
            task_id,
            message: message.to_string(),
            created_at: self.clock.now(),
        };
        self.state.lock().await.errors.push(entry);
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, EngineError> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn is_completed(&self, task_id: TaskId) -> Result<bool, EngineError> {
        Ok(self.state.lock().await.completions.contains_key(&task_id))
    }

    async fn leases(&self, task_id: TaskId) -> Result<Vec<Lease>, EngineError> {
        Ok(self
            .state
            .lock()
            .await
            .leases
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn errors(&self, task_id: TaskId) -> Result<Vec<ErrorEntry>, EngineError> {
        let state = self.state.lock().await;
        Ok(state
            .errors
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn pending(&self) -> Result<Vec<Task>, EngineError> {
        let state = self.state.lock().await;
        Ok(state
            .pending
            .iter()
            .filter_map(|(_, task_id)| state.tasks.get(task_id).cloned())
            .collect())
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts, EngineError> {
        let state = self.state.lock().await;
        let leased = state
            .pending
            .iter()
            .filter(|(_, task_id)| state.has_live_lease(*task_id, now))
            .count();
        Ok(QueueCounts {
            waiting: state.pending.len() - leased,
            leased,
            completed: state.completions.len(),
            errors: state.errors.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn store() -> (Arc<InMemoryTaskStore>, FixedClock) {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let ids = Arc::new(UlidGenerator::new(clock_arc.clone()));
        let store = InMemoryTaskStore::new(clock_arc, ids, Duration::from_secs(300));
        (Arc::new(store), clock)
    }

    fn task_at(at: DateTime<Utc>) -> NewTask {
        NewTask::new("test", serde_json::json!({}), at)
    }

    #[tokio::test]
    async fn dequeue_returns_none_when_empty() {
        let (store, _) = store();
        assert!(store.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn future_tasks_are_not_eligible() {
        let (store, clock) = store();
        let id = store
            .enqueue(task_at(clock.now() + chrono::Duration::seconds(10)))
            .await
            .unwrap();

        assert!(store.dequeue().await.unwrap().is_none());

        clock.advance(Duration::from_secs(10));
        let leased = store.dequeue().await.unwrap().unwrap();
        assert_eq!(leased.task_id(), id);
    }

    #[tokio::test]
    async fn dequeue_orders_by_scheduled_at() {
        let (store, clock) = store();
        let now = clock.now();
        let later = store
            .enqueue(task_at(now - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        let earlier = store
            .enqueue(task_at(now - chrono::Duration::seconds(5)))
            .await
            .unwrap();

        assert_eq!(store.dequeue().await.unwrap().unwrap().task_id(), earlier);
        assert_eq!(store.dequeue().await.unwrap().unwrap().task_id(), later);
        assert!(store.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leased_task_is_not_handed_out_twice() {
        let (store, clock) = store();
        store.enqueue(task_at(clock.now())).await.unwrap();

        assert!(store.dequeue().await.unwrap().is_some());
        assert!(store.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_dequeuers_never_double_claim() {
        let (store, clock) = store();
        for _ in 0..50 {
            store.enqueue(task_at(clock.now())).await.unwrap();
        }

        let mut joins = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(leased) = store.dequeue().await.unwrap() {
                    claimed.push(leased.task_id());
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for join in joins {
            all.extend(join.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 50);
        assert_eq!(unique.len(), 50);

        // at most one live lease per task
        let now = clock.now();
        for task_id in unique {
            let live = store
                .leases(task_id)
                .await
                .unwrap()
                .iter()
                .filter(|l| l.is_live(now))
                .count();
            assert_eq!(live, 1);
        }
    }

    #[tokio::test]
    async fn expired_lease_makes_task_eligible_again() {
        let (store, clock) = store();
        let id = store.enqueue(task_at(clock.now())).await.unwrap();

        // worker "crashes" after leasing
        let first = store.dequeue().await.unwrap().unwrap();
        assert_eq!(first.task_id(), id);

        clock.advance(Duration::from_secs(299));
        assert!(store.dequeue().await.unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        let second = store.dequeue().await.unwrap().unwrap();
        assert_eq!(second.task_id(), id);
        assert_ne!(second.lease.id, first.lease.id);

        // both leases are kept as history
        assert_eq!(store.leases(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let (store, clock) = store();
        let id = store.enqueue(task_at(clock.now())).await.unwrap();
        store.dequeue().await.unwrap().unwrap();

        store.complete(id).await.unwrap();
        store.complete(id).await.unwrap();

        assert!(store.is_completed(id).await.unwrap());
        let counts = store.counts(clock.now()).await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.leased, 0);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn completed_task_is_never_dispatched_again() {
        let (store, clock) = store();
        let id = store.enqueue(task_at(clock.now())).await.unwrap();
        store.dequeue().await.unwrap().unwrap();
        store.complete(id).await.unwrap();

        clock.advance(Duration::from_secs(3600));
        assert!(store.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn errors_do_not_block_completion() {
        let (store, clock) = store();
        let id = store.enqueue(task_at(clock.now())).await.unwrap();
        store.dequeue().await.unwrap().unwrap();

        store.record_error(id, "first").await.unwrap();
        store.record_error(id, "second").await.unwrap();
        store.complete(id).await.unwrap();

        let errors = store.errors(id).await.unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "first");
        assert!(store.is_completed(id).await.unwrap());
    }
}
