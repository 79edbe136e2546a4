//! WorkerLoop - dequeue → route → complete
//!
//! # フロー
//! 1. `TaskStore::dequeue()` で lease 付きの task を取得
//! 2. task_type から Processor を引く（無ければ Error entry）
//! 3. Processor を別 tokio task で実行（panic も Error entry に変換）
//! 4. 結果に関係なく `TaskStore::complete()` を 1 回呼ぶ
//!
//! ループ同士は状態を共有しません。協調はすべて TaskStore 経由です。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::processors::ProcessorRegistry;
use crate::domain::{EngineError, TaskId};
use crate::ports::TaskStore;

/// One dispatcher. Cheap to clone; clones share the stores.
#[derive(Clone)]
pub struct Dispatcher {
    tasks: Arc<dyn TaskStore>,
    processors: Arc<ProcessorRegistry>,
    idle_min: Duration,
    idle_max: Duration,
}

impl Dispatcher {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        processors: Arc<ProcessorRegistry>,
        idle_min: Duration,
        idle_max: Duration,
    ) -> Self {
        Self {
            tasks,
            processors,
            idle_min,
            idle_max,
        }
    }

    /// Process at most one task. `Ok(None)` when nothing is eligible.
    ///
    /// `Err` only for store failures around dequeue / complete; processor
    /// failures are recorded as error entries.
    pub async fn run_once(&self) -> Result<Option<TaskId>, EngineError> {
        let Some(leased) = self.tasks.dequeue().await? else {
            return Ok(None);
        };
        let task = leased.task;
        let task_id = task.id;
        let span = info_span!("dispatch", %task_id, task_type = %task.task_type);

        async {
            let failure = match self.processors.get(&task.task_type) {
                None => {
                    warn!("no processor registered");
                    Some(EngineError::ProcessorNotFound(task.task_type.clone()).to_string())
                }
                Some(processor) => {
                    // Own tokio task so that a panicking processor cannot take
                    // the loop down with it.
                    let task = task.clone();
                    let joined = tokio::spawn(async move { processor.process(&task).await }).await;
                    match joined {
                        Ok(Ok(result)) if result.is_ok() => None,
                        Ok(Ok(result)) => {
                            debug!(result = %result.describe(), "processor reported failure");
                            Some(result.describe())
                        }
                        Ok(Err(e)) if e.is_fatal() => {
                            error!(error = %e, kind = ?e.kind(), "processor aborted");
                            Some(e.to_string())
                        }
                        Ok(Err(e)) => {
                            warn!(error = %e, kind = ?e.kind(), "processor failed");
                            Some(e.to_string())
                        }
                        Err(join_error) => {
                            error!(error = %join_error, "processor panicked");
                            Some(format!("processor panicked: {join_error}"))
                        }
                    }
                }
            };

            if let Some(message) = failure {
                if let Err(e) = self.tasks.record_error(task_id, &message).await {
                    warn!(error = %e, "failed to record error entry");
                }
            }
            self.tasks.complete(task_id).await?;
            debug!("task completed");
            Ok::<_, EngineError>(Some(task_id))
        }
        .instrument(span)
        .await
    }

    /// Poll until `shutdown` turns true. Idle sleep doubles from `idle_min`
    /// to `idle_max` and resets after any processed task.
    pub async fn run(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        let mut idle = self.idle_min;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let sleep_for = match self.run_once().await {
                Ok(Some(_)) => {
                    idle = self.idle_min;
                    continue;
                }
                Ok(None) => {
                    let current = idle;
                    idle = (idle * 2).min(self.idle_max);
                    current
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "dispatch iteration failed");
                    idle
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        debug!(worker_id, "worker stopped");
    }
}

/// Worker group handle.
/// - `request_shutdown()` で新しい lease を取らなくなる（実行中の task は最後まで走る）
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` dispatcher loops.
    pub fn spawn(n: usize, dispatcher: Dispatcher) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = (0..n)
            .map(|worker_id| {
                let dispatcher = dispatcher.clone();
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { dispatcher.run(worker_id, rx).await })
            })
            .collect();
        info!(workers = n, "worker group started");

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "worker exited abnormally");
            }
        }
        info!("worker group stopped");
    }
}
