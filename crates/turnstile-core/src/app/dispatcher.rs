//! Dispatcher - sync / async の分岐と task のライフサイクル
//!
//! # フロー（async）
//! 1. TaskStore::create() で `created` レコードを作る
//! 2. レコードを呼び出し元に返す（ハンドラの完了は待たない）
//! 3. ワーカープール（Semaphore）の空きを待ってハンドラを実行
//! 4. 結果を terminal status として書き込み、permit を解放
//!
//! ハンドラの panic は `catch_unwind` で捕まえ、`failed - ...` に変換する。
//! ワーカー側のエラーは呼び出し元に戻らない（ログとレコードのみ）。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Semaphore};
use tracing::Instrument;

use super::admission::Admission;
use super::counter::InFlightPermit;
use super::handler::{AsyncJob, Reply, SyncJob};
use crate::domain::{HandlerError, RoutePolicy, StoreError, TaskId, TaskRecord, TaskStatus};
use crate::ports::TaskStore;

/// Prepared handler invocation.
pub enum Job {
    Sync(SyncJob),
    Async(AsyncJob),
}

/// What the caller gets back from [`Dispatcher::dispatch`].
#[derive(Debug)]
pub enum DispatchOutcome {
    Reply(Reply),
    Accepted(TaskRecord),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("could not record task: {0}")]
    Store(#[from] StoreError),
}

/// Handle given to an async handler for its own task.
///
/// Once the task has reached its terminal status (including a timeout that
/// abandoned the handler) further updates are ignored.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    store: Arc<dyn TaskStore>,
    closed: Arc<Mutex<bool>>,
}

impl TaskContext {
    fn new(task_id: TaskId, store: Arc<dyn TaskStore>) -> Self {
        Self {
            task_id,
            store,
            closed: Arc::new(Mutex::new(false)),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Publish an intermediate status such as `running`.
    pub async fn update_status(&self, status: impl Into<TaskStatus>) -> Result<(), StoreError> {
        let closed = self.closed.lock().await;
        if *closed {
            tracing::debug!(task_id = %self.task_id, "ignoring status update after terminal state");
            return Ok(());
        }
        self.store.update(self.task_id, status.into()).await
    }

    /// Write the terminal status exactly once.
    async fn finish(&self, outcome: Result<TaskStatus, HandlerError>) {
        let mut closed = self.closed.lock().await;
        if *closed {
            return;
        }
        *closed = true;

        let result = match outcome {
            Ok(status) => {
                let status = terminal_status(status);
                tracing::info!(task_id = %self.task_id, status = %status, "task completed");
                self.store.complete(self.task_id, status).await
            }
            Err(e) => {
                tracing::error!(task_id = %self.task_id, error = %e, "task failed");
                self.store.fail(self.task_id, TaskStatus::failed(&e)).await
            }
        };
        if let Err(e) = result {
            tracing::error!(task_id = %self.task_id, error = %e, "could not record terminal task status");
        }
    }
}

/// A handler's `Ok` status must end the lifecycle: anything that does not
/// already read as terminal becomes `completed - <status>`.
fn terminal_status(status: TaskStatus) -> TaskStatus {
    if status.is_terminal() {
        status
    } else if status.as_str().trim().is_empty() {
        TaskStatus::completed()
    } else {
        TaskStatus::new(format!("{} - {status}", TaskStatus::COMPLETED))
    }
}

/// Runs admitted requests.
///
/// Sync jobs run on the caller's task. Async jobs are spawned and limited by
/// a shared worker pool.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    workers: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn TaskStore>, worker_pool_size: usize) -> Self {
        Self {
            store,
            workers: Arc::new(Semaphore::new(worker_pool_size.max(1))),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Free worker slots right now.
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }

    pub async fn dispatch(
        &self,
        admission: Admission,
        job: Job,
    ) -> Result<DispatchOutcome, DispatchError> {
        match job {
            Job::Sync(job) => Ok(DispatchOutcome::Reply(
                self.dispatch_sync(admission, job).await?,
            )),
            Job::Async(job) => Ok(DispatchOutcome::Accepted(
                self.dispatch_async(admission, job).await?,
            )),
        }
    }

    /// Run inline; the permit is released when this returns.
    pub async fn dispatch_sync(
        &self,
        admission: Admission,
        job: SyncJob,
    ) -> Result<Reply, HandlerError> {
        let Admission { policy, permit } = admission;
        let span = tracing::info_span!("dispatch", trace = %policy.span_name(), route = %policy.path, mode = "sync");

        let result = match policy.timeout {
            None => {
                let result = catch_panics(job).instrument(span.clone()).await;
                drop(permit);
                result
            }
            Some(limit) => {
                let handle = tokio::spawn(
                    async move {
                        let _permit = permit;
                        catch_panics(job).await
                    }
                    .instrument(span.clone()),
                );
                race_timer(handle, limit).await
            }
        };

        if let Err(e) = &result {
            span.in_scope(|| tracing::error!(error = %e, "sync handler failed"));
        }
        result
    }

    /// Record a `created` task, spawn the worker and return immediately.
    pub async fn dispatch_async(
        &self,
        admission: Admission,
        job: AsyncJob,
    ) -> Result<TaskRecord, StoreError> {
        let Admission { policy, permit } = admission;
        let record = self.store.create(&policy.path).await?;
        let task_id = record.task_id;

        let span = tracing::info_span!("task", trace = %policy.span_name(), route = %policy.path, task_id = %task_id);
        span.in_scope(|| tracing::info!("task created"));

        let ctx = TaskContext::new(task_id, Arc::clone(&self.store));
        let workers = Arc::clone(&self.workers);
        tokio::spawn(run_worker(workers, policy, permit, ctx, job).instrument(span));

        Ok(record)
    }
}

async fn run_worker(
    workers: Arc<Semaphore>,
    policy: Arc<RoutePolicy>,
    permit: InFlightPermit,
    ctx: TaskContext,
    job: AsyncJob,
) {
    let slot = match workers.acquire_owned().await {
        Ok(slot) => slot,
        Err(_) => {
            ctx.finish(Err(HandlerError::failed("worker pool is closed")))
                .await;
            return;
        }
    };

    match policy.timeout {
        None => {
            let outcome = catch_panics(job(ctx.clone())).await;
            drop(slot);
            // record the terminal status before releasing the in-flight slot
            ctx.finish(outcome).await;
            drop(permit);
        }
        Some(limit) => {
            let handler_ctx = ctx.clone();
            let handle = tokio::spawn(
                async move {
                    let _slot = slot;
                    let _permit = permit;
                    catch_panics(job(handler_ctx)).await
                }
                .in_current_span(),
            );
            let outcome = race_timer(handle, limit).await;
            ctx.finish(outcome).await;
        }
    }
}

/// Wait for a spawned handler, giving up after `limit`.
///
/// On timeout the handler keeps running detached; only the caller stops
/// waiting for it.
async fn race_timer<T: Send + 'static>(
    handle: tokio::task::JoinHandle<Result<T, HandlerError>>,
    limit: Duration,
) -> Result<T, HandlerError> {
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(HandlerError::Panicked(join_err.to_string())),
        Err(_) => {
            tracing::warn!(timeout_ms = limit.as_millis() as u64, "handler timed out; abandoning it");
            Err(HandlerError::TimedOut(limit))
        }
    }
}

async fn catch_panics<T>(
    job: BoxFuture<'static, Result<T, HandlerError>>,
) -> Result<T, HandlerError> {
    AssertUnwindSafe(job)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload.as_ref()))))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
