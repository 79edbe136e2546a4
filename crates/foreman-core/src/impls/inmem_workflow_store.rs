//! In-memory workflow store.
//!
//! Per-family fact tables behind one mutex, plus a map of per-root async
//! mutexes standing in for `SELECT ... FOR UPDATE`. A [`RootTx`] buffers its
//! effects and applies them (facts first, then tasks) on `commit()` while the
//! root guard is still held.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::domain::{
    AttemptFacts, AttemptId, AttemptRecord, AttemptRef, EngineError, FailedFact, NewTask,
    RootFailure, RootId, RootRef, SucceededFact, WorkflowFamily, WorkflowRoot,
};
use crate::ports::{Clock, IdGenerator, RootTx, TaskStore, WorkflowStore};

#[derive(Default)]
struct FamilyTables {
    roots: HashMap<RootId, WorkflowRoot>,
    attempts: HashMap<RootId, Vec<AttemptRecord>>,
    succeeded: HashMap<AttemptId, SucceededFact>,
    failed: HashMap<AttemptId, FailedFact>,
    root_failures: HashMap<RootId, RootFailure>,
}

impl FamilyTables {
    fn attempt_facts(&self, root_id: RootId) -> Vec<AttemptFacts> {
        self.attempts
            .get(&root_id)
            .map(|records| {
                records
                    .iter()
                    .map(|attempt| AttemptFacts {
                        succeeded: self.succeeded.get(&attempt.id).cloned(),
                        failed: self.failed.get(&attempt.id).cloned(),
                        attempt: attempt.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn has_attempt(&self, root_id: RootId, attempt_id: AttemptId) -> bool {
        self.attempts
            .get(&root_id)
            .is_some_and(|records| records.iter().any(|a| a.id == attempt_id))
    }
}

#[derive(Default)]
struct Tables {
    families: HashMap<WorkflowFamily, FamilyTables>,
}

impl Tables {
    fn family(&self, family: &WorkflowFamily) -> Option<&FamilyTables> {
        self.families.get(family)
    }

    fn family_mut(&mut self, family: &WorkflowFamily) -> &mut FamilyTables {
        self.families.entry(family.clone()).or_default()
    }

    fn root(&self, root: &RootRef) -> Option<&WorkflowRoot> {
        self.family(&root.family)?.roots.get(&root.root_id)
    }

    fn insert_root(&mut self, root: WorkflowRoot) {
        self.family_mut(&root.family).roots.insert(root.id, root);
    }
}

pub struct InMemoryWorkflowStore {
    tables: Arc<Mutex<Tables>>,
    locks: Mutex<HashMap<RootRef, Arc<Mutex<()>>>>,
    tasks: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryWorkflowStore {
    /// Tasks enqueued through a [`RootTx`] land in `tasks` on commit.
    pub fn new(tasks: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            locks: Mutex::new(HashMap::new()),
            tasks,
            clock,
            ids,
        }
    }

    fn new_root(
        &self,
        family: &WorkflowFamily,
        metadata: serde_json::Value,
        parent: Option<RootRef>,
    ) -> WorkflowRoot {
        WorkflowRoot {
            id: self.ids.root_id(),
            family: family.clone(),
            metadata,
            parent,
            created_at: self.clock.now(),
        }
    }

    /// Also drops idle entries. An entry is idle when the map holds the only
    /// reference: no guard is alive and nobody is waiting on it.
    async fn root_lock(&self, root: &RootRef) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(root.clone()).or_default())
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_root(
        &self,
        family: &WorkflowFamily,
        metadata: serde_json::Value,
        parent: Option<RootRef>,
    ) -> Result<WorkflowRoot, EngineError> {
        let root = self.new_root(family, metadata, parent);
        self.tables.lock().await.insert_root(root.clone());
        Ok(root)
    }

    async fn get_root(&self, root: &RootRef) -> Result<Option<WorkflowRoot>, EngineError> {
        Ok(self.tables.lock().await.root(root).cloned())
    }

    async fn children(
        &self,
        parent: &RootRef,
        family: &WorkflowFamily,
    ) -> Result<Vec<WorkflowRoot>, EngineError> {
        let tables = self.tables.lock().await;
        let mut children: Vec<WorkflowRoot> = tables
            .family(family)
            .map(|t| {
                t.roots
                    .values()
                    .filter(|r| r.parent.as_ref() == Some(parent))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        children.sort_by_key(|r| (r.created_at, r.id));
        Ok(children)
    }

    async fn attempts(&self, root: &RootRef) -> Result<Vec<AttemptFacts>, EngineError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .family(&root.family)
            .map(|t| t.attempt_facts(root.root_id))
            .unwrap_or_default())
    }

    async fn root_failure(&self, root: &RootRef) -> Result<Option<RootFailure>, EngineError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .family(&root.family)
            .and_then(|t| t.root_failures.get(&root.root_id).cloned()))
    }

    async fn record_success(&self, attempt: &AttemptRef) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        let family = tables.family_mut(&attempt.family);
        if !family.has_attempt(attempt.root_id, attempt.attempt_id) {
            return Err(EngineError::AttemptNotFound {
                family: attempt.family.clone(),
                attempt_id: attempt.attempt_id,
            });
        }
        if family.succeeded.contains_key(&attempt.attempt_id) {
            return Ok(false);
        }
        family.succeeded.insert(
            attempt.attempt_id,
            SucceededFact {
                attempt_id: attempt.attempt_id,
                created_at: now,
            },
        );
        Ok(true)
    }

    async fn record_failure(
        &self,
        attempt: &AttemptRef,
        message: &str,
    ) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        let family = tables.family_mut(&attempt.family);
        if !family.has_attempt(attempt.root_id, attempt.attempt_id) {
            return Err(EngineError::AttemptNotFound {
                family: attempt.family.clone(),
                attempt_id: attempt.attempt_id,
            });
        }
        if family.failed.contains_key(&attempt.attempt_id) {
            return Ok(false);
        }
        family.failed.insert(
            attempt.attempt_id,
            FailedFact {
                attempt_id: attempt.attempt_id,
                error_message: message.to_string(),
                created_at: now,
            },
        );
        Ok(true)
    }

    async fn lock_root(&self, root: &RootRef) -> Result<Box<dyn RootTx>, EngineError> {
        let guard = self.root_lock(root).await.lock_owned().await;

        // Read only after the guard is held.
        let record = self
            .tables
            .lock()
            .await
            .root(root)
            .cloned()
            .ok_or_else(|| EngineError::RootNotFound {
                family: root.family.clone(),
                root_id: root.root_id,
            })?;
        debug!(family = %root.family, root_id = %root.root_id, "root locked");

        Ok(Box::new(InMemoryRootTx {
            _guard: guard,
            root: record,
            tables: Arc::clone(&self.tables),
            tasks: Arc::clone(&self.tasks),
            clock: Arc::clone(&self.clock),
            ids: Arc::clone(&self.ids),
            buffer: TxBuffer::default(),
        }))
    }
}

#[derive(Default)]
struct TxBuffer {
    attempts: Vec<AttemptRecord>,
    succeeded: Vec<SucceededFact>,
    failed: Vec<FailedFact>,
    root_failure: Option<RootFailure>,
    roots: Vec<WorkflowRoot>,
    tasks: Vec<NewTask>,
}

struct InMemoryRootTx {
    _guard: OwnedMutexGuard<()>,
    root: WorkflowRoot,
    tables: Arc<Mutex<Tables>>,
    tasks: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    buffer: TxBuffer,
}

impl InMemoryRootTx {
    fn merge(&self, mut facts: Vec<AttemptFacts>) -> Vec<AttemptFacts> {
        facts.extend(self.buffer.attempts.iter().map(|attempt| AttemptFacts {
            attempt: attempt.clone(),
            succeeded: None,
            failed: None,
        }));
        for f in &mut facts {
            if f.succeeded.is_none() {
                f.succeeded = self
                    .buffer
                    .succeeded
                    .iter()
                    .find(|s| s.attempt_id == f.attempt.id)
                    .cloned();
            }
            if f.failed.is_none() {
                f.failed = self
                    .buffer
                    .failed
                    .iter()
                    .find(|s| s.attempt_id == f.attempt.id)
                    .cloned();
            }
        }
        facts
    }

    async fn current_facts(&self) -> Vec<AttemptFacts> {
        let committed = self
            .tables
            .lock()
            .await
            .family(&self.root.family)
            .map(|t| t.attempt_facts(self.root.id))
            .unwrap_or_default();
        self.merge(committed)
    }

    async fn require_attempt(&self, attempt_id: AttemptId) -> Result<AttemptFacts, EngineError> {
        self.current_facts()
            .await
            .into_iter()
            .find(|f| f.attempt.id == attempt_id)
            .ok_or_else(|| EngineError::AttemptNotFound {
                family: self.root.family.clone(),
                attempt_id,
            })
    }
}

#[async_trait]
impl RootTx for InMemoryRootTx {
    fn root(&self) -> &WorkflowRoot {
        &self.root
    }

    async fn attempts(&mut self) -> Result<Vec<AttemptFacts>, EngineError> {
        Ok(self.current_facts().await)
    }

    async fn root_failure(&mut self) -> Result<Option<RootFailure>, EngineError> {
        if let Some(failure) = &self.buffer.root_failure {
            return Ok(Some(failure.clone()));
        }
        let tables = self.tables.lock().await;
        Ok(tables
            .family(&self.root.family)
            .and_then(|t| t.root_failures.get(&self.root.id).cloned()))
    }

    async fn create_attempt(&mut self) -> Result<AttemptRecord, EngineError> {
        let attempt = AttemptRecord {
            id: self.ids.attempt_id(),
            root_id: self.root.id,
            created_at: self.clock.now(),
        };
        self.buffer.attempts.push(attempt.clone());
        Ok(attempt)
    }

    async fn record_success(&mut self, attempt_id: AttemptId) -> Result<(), EngineError> {
        if self.require_attempt(attempt_id).await?.succeeded.is_none() {
            self.buffer.succeeded.push(SucceededFact {
                attempt_id,
                created_at: self.clock.now(),
            });
        }
        Ok(())
    }

    async fn record_failure(
        &mut self,
        attempt_id: AttemptId,
        message: &str,
    ) -> Result<(), EngineError> {
        if self.require_attempt(attempt_id).await?.failed.is_none() {
            self.buffer.failed.push(FailedFact {
                attempt_id,
                error_message: message.to_string(),
                created_at: self.clock.now(),
            });
        }
        Ok(())
    }

    async fn record_root_failure(&mut self, message: &str) -> Result<(), EngineError> {
        if self.root_failure().await?.is_none() {
            self.buffer.root_failure = Some(RootFailure {
                root_id: self.root.id,
                message: message.to_string(),
                created_at: self.clock.now(),
            });
        }
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
        self.buffer.roots.push(root.clone());
        Ok(root)
    }

    async fn enqueue(&mut self, task: NewTask) -> Result<(), EngineError> {
        self.buffer.tasks.push(task);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), EngineError> {
        let this = *self;
        let TxBuffer {
            attempts,
            succeeded,
            failed,
            root_failure,
            roots,
            tasks,
        } = this.buffer;

        {
            let mut tables = this.tables.lock().await;
            for root in roots {
                tables.insert_root(root);
            }
            let family = tables.family_mut(&this.root.family);
            family
                .attempts
                .entry(this.root.id)
                .or_default()
                .extend(attempts);
            for fact in succeeded {
                family.succeeded.entry(fact.attempt_id).or_insert(fact);
            }
            for fact in failed {
                family.failed.entry(fact.attempt_id).or_insert(fact);
            }
            if let Some(failure) = root_failure {
                family.root_failures.entry(this.root.id).or_insert(failure);
            }
        }

        for task in tasks {
            this.tasks.enqueue(task).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryWorkflowStore>,
        tasks: Arc<InMemoryTaskStore>,
        family: WorkflowFamily,
    }

    fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let tasks = Arc::new(InMemoryTaskStore::new(
            clock.clone(),
            ids.clone(),
            Duration::from_secs(300),
        ));
        let store = Arc::new(InMemoryWorkflowStore::new(tasks.clone(), clock, ids));
        Fixture {
            store,
            tasks,
            family: WorkflowFamily::new("message_send").unwrap(),
        }
    }

    #[tokio::test]
    async fn lock_root_rejects_unknown_root() {
        let f = fixture();
        let missing = RootRef::new(f.family.clone(), RootId::from_ulid(ulid::Ulid::new()));
        let err = f.store.lock_root(&missing).await.err().unwrap();
        assert!(matches!(err, EngineError::RootNotFound { .. }));
    }

    #[tokio::test]
    async fn effects_are_invisible_until_commit() {
        let f = fixture();
        let root = f
            .store
            .create_root(&f.family, serde_json::json!({}), None)
            .await
            .unwrap();

        let mut tx = f.store.lock_root(&root.root_ref()).await.unwrap();
        let attempt = tx.create_attempt().await.unwrap();
        tx.record_failure(attempt.id, "boom").await.unwrap();
        tx.enqueue(NewTask::new("x", serde_json::json!({}), root.created_at))
            .await
            .unwrap();

        // own writes are visible inside the tx
        let inside = tx.summary().await.unwrap();
        assert_eq!(inside.attempts, 1);
        assert_eq!(inside.failed_count, 1);

        // but not outside
        assert_eq!(f.store.summary(&root.root_ref()).await.unwrap().attempts, 0);
        assert!(f.tasks.pending().await.unwrap().is_empty());

        tx.commit().await.unwrap();

        let after = f.store.summary(&root.root_ref()).await.unwrap();
        assert_eq!(after.attempts, 1);
        assert_eq!(after.failed_count, 1);
        assert_eq!(f.tasks.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_tx_discards_effects() {
        let f = fixture();
        let root = f
            .store
            .create_root(&f.family, serde_json::json!({}), None)
            .await
            .unwrap();

        {
            let mut tx = f.store.lock_root(&root.root_ref()).await.unwrap();
            tx.create_attempt().await.unwrap();
        }

        assert_eq!(f.store.summary(&root.root_ref()).await.unwrap().attempts, 0);
        // lock was released on drop
        assert!(f.store.lock_root(&root.root_ref()).await.is_ok());
    }

    #[tokio::test]
    async fn idle_root_locks_are_dropped() {
        let f = fixture();
        let a = f.store.create_root(&f.family, serde_json::json!({}), None).await.unwrap();
        let b = f.store.create_root(&f.family, serde_json::json!({}), None).await.unwrap();

        f.store.lock_root(&a.root_ref()).await.unwrap().commit().await.unwrap();
        let held = f.store.lock_root(&b.root_ref()).await.unwrap();
        {
            let locks = f.store.locks.lock().await;
            assert_eq!(locks.len(), 1);
            assert!(locks.contains_key(&b.root_ref()));
        }

        // b is still held, so it survives the next prune
        let again = f.store.lock_root(&a.root_ref()).await.unwrap();
        assert_eq!(f.store.locks.lock().await.len(), 2);
        drop(held);
        drop(again);
    }

    #[tokio::test]
    async fn second_locker_waits_for_the_first() {
        let f = fixture();
        let root = f
            .store
            .create_root(&f.family, serde_json::json!({}), None)
            .await
            .unwrap();
        let root_ref = root.root_ref();

        let mut tx = f.store.lock_root(&root_ref).await.unwrap();
        tx.create_attempt().await.unwrap();

        let store = Arc::clone(&f.store);
        let waiter_ref = root_ref.clone();
        let waiter = tokio::spawn(async move {
            let mut tx = store.lock_root(&waiter_ref).await.unwrap();
            tx.summary().await.unwrap().attempts
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.commit().await.unwrap();
        // the second run sees the first run's committed attempt
        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn outcome_facts_are_unique_per_attempt() {
        let f = fixture();
        let root = f
            .store
            .create_root(&f.family, serde_json::json!({}), None)
            .await
            .unwrap();
        let mut tx = f.store.lock_root(&root.root_ref()).await.unwrap();
        let attempt = tx.create_attempt().await.unwrap();
        tx.commit().await.unwrap();

        let attempt_ref = AttemptRef {
            family: f.family.clone(),
            root_id: root.id,
            attempt_id: attempt.id,
        };
        assert!(f.store.record_failure(&attempt_ref, "one").await.unwrap());
        assert!(!f.store.record_failure(&attempt_ref, "two").await.unwrap());
        assert!(f.store.record_success(&attempt_ref).await.unwrap());
        assert!(!f.store.record_success(&attempt_ref).await.unwrap());

        let facts = f.store.attempts(&root.root_ref()).await.unwrap();
        assert_eq!(facts[0].failed.as_ref().unwrap().error_message, "one");

        let summary = f.store.summary(&root.root_ref()).await.unwrap();
        assert!(summary.succeeded);
        assert_eq!(summary.failed_count, 0);
    }

    #[tokio::test]
    async fn record_success_on_unknown_attempt_is_an_invariant_error() {
        let f = fixture();
        let root = f
            .store
            .create_root(&f.family, serde_json::json!({}), None)
            .await
            .unwrap();
        let attempt_ref = AttemptRef {
            family: f.family.clone(),
            root_id: root.id,
            attempt_id: AttemptId::from_ulid(ulid::Ulid::new()),
        };
        let err = f.store.record_success(&attempt_ref).await.unwrap_err();
        assert!(matches!(err, EngineError::AttemptNotFound { .. }));
    }

    #[tokio::test]
    async fn children_created_in_tx_appear_after_commit() {
        let f = fixture();
        let child_family = WorkflowFamily::new("storage_delete").unwrap();
        let parent = f
            .store
            .create_root(&f.family, serde_json::json!({"user": 1}), None)
            .await
            .unwrap();

        let mut tx = f.store.lock_root(&parent.root_ref()).await.unwrap();
        tx.create_root(&child_family, serde_json::json!({"user": 1}), Some(parent.root_ref()))
            .await
            .unwrap();
        assert!(f
            .store
            .children(&parent.root_ref(), &child_family)
            .await
            .unwrap()
            .is_empty());
        tx.commit().await.unwrap();

        let children = f
            .store
            .children(&parent.root_ref(), &child_family)
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].parent, Some(parent.root_ref()));
    }

    #[tokio::test]
    async fn root_failure_is_recorded_once() {
        let f = fixture();
        let root = f
            .store
            .create_root(&f.family, serde_json::json!({}), None)
            .await
            .unwrap();

        let mut tx = f.store.lock_root(&root.root_ref()).await.unwrap();
        tx.record_root_failure("first").await.unwrap();
        tx.record_root_failure("second").await.unwrap();
        tx.commit().await.unwrap();

        let failure = f.store.root_failure(&root.root_ref()).await.unwrap().unwrap();
        assert_eq!(failure.message, "first");
    }
}
