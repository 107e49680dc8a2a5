//! Pieces shared by the download and upload engines: pools, the raw
//! transport for signed URLs, and terminal-state bookkeeping.

use crate::api::ApiClient;
use crate::chunk::{self, Chunk};
use crate::error::{Result, TransferError};
use crate::registry::TaskRegistry;
use crate::task::{Task, TaskState};
use bridge_traits::http::{HttpClient, HttpResponse};
use bridge_traits::time::Clock;
use core_runtime::events::{CoreEvent, TransferEvent};
use core_runtime::logging::strip_path;
use core_runtime::{ApiBase, CallbackContext, ClientConfig, EventBus};
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Everything a transfer engine needs besides its own registry.
///
/// Clone it to share the chunk pool between downloads and uploads.
#[derive(Clone)]
pub struct TransferContext {
    pub(crate) api: ApiClient,
    /// Bare transport for signed URLs; never carries the bearer token.
    pub(crate) transport: Arc<dyn HttpClient>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventBus,
    pub(crate) callbacks: CallbackContext,
    pub(crate) chunk_permits: Arc<Semaphore>,
    pub(crate) task_concurrency: usize,
    pub(crate) batch_size: usize,
    pub(crate) expiry_retry_limit: u32,
    pub(crate) runtime: Handle,
}

impl TransferContext {
    /// Must be called from inside a Tokio runtime; transfer loops are
    /// spawned onto it.
    pub fn new(
        config: &ClientConfig,
        api_client: Arc<dyn HttpClient>,
        events: EventBus,
        callbacks: CallbackContext,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            TransferError::Runtime(core_runtime::Error::Internal(format!(
                "Transfer engine needs a Tokio runtime: {}",
                e
            )))
        })?;
        let task_concurrency = config.task_concurrency.max(1);
        let chunk_concurrency = config.chunk_concurrency.max(1);

        Ok(Self {
            api: ApiClient::new(api_client, ApiBase::parse(&config.base_api)?),
            transport: Arc::clone(&config.http_client),
            clock: Arc::clone(&config.clock),
            events,
            callbacks,
            chunk_permits: Arc::new(Semaphore::new(task_concurrency * chunk_concurrency)),
            task_concurrency,
            batch_size: chunk_concurrency * 3,
            expiry_retry_limit: config.url_expiry_retry_limit.max(1),
            runtime,
        })
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub(crate) fn now(&self) -> i64 {
        self.clock.unix_timestamp()
    }

    /// Publish `Waiting` and announce the start.
    pub(crate) fn announce(&self, task: &Task) {
        info!(task_id = task.id(), kind = %task.kind(), name = task.name(), "Transfer started");
        task.publish(TaskState::Waiting);
        self.emit(TransferEvent::Started {
            task_id: task.id(),
            kind: task.kind(),
            name: task.name().to_string(),
        });
    }

    /// Publish the terminal state, free the resource slot and announce the
    /// outcome.
    pub(crate) fn settle<K: Eq + Hash>(
        &self,
        registry: &TaskRegistry<K>,
        key: &K,
        task: &Task,
        state: TaskState,
    ) {
        let event = match &state {
            TaskState::Completed { result_path } => {
                let shown = result_path.to_string_lossy();
                info!(task_id = task.id(), file = strip_path(&shown), "Transfer completed");
                TransferEvent::Completed {
                    task_id: task.id(),
                    kind: task.kind(),
                    result_path: result_path.display().to_string(),
                }
            }
            TaskState::Failed { cause } => {
                warn!(task_id = task.id(), code = cause.code(), error = %cause, "Transfer failed");
                TransferEvent::Failed {
                    task_id: task.id(),
                    kind: task.kind(),
                    message: cause.to_string(),
                }
            }
            _ => {
                info!(task_id = task.id(), "Transfer aborted");
                TransferEvent::Aborted {
                    task_id: task.id(),
                    kind: task.kind(),
                }
            }
        };

        task.mark_finished();
        registry.deregister(key, task);
        task.publish(state);
        self.emit(event);
    }

    fn emit(&self, event: TransferEvent) {
        if self.events.emit(CoreEvent::Transfer(event)).is_err() {
            debug!("No event subscribers");
        }
    }
}

/// Whether a signed-URL response says the URL is no longer usable.
pub(crate) fn is_expired_response(response: &HttpResponse) -> bool {
    if response.status != 403 {
        return false;
    }
    let body = String::from_utf8_lossy(&response.body).to_ascii_lowercase();
    body.contains("accessdenied") || body.contains("expired")
}

/// Counts URL expiries that happened without any chunk completing in
/// between.
#[derive(Debug)]
pub(crate) struct ExpiryBudget {
    limit: u32,
    consecutive: u32,
    completed_at_last_expiry: usize,
}

impl ExpiryBudget {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            limit,
            consecutive: 0,
            completed_at_last_expiry: 0,
        }
    }

    /// Record an expiry seen with `completed` chunks done. Returns `false`
    /// once the ceiling is reached.
    pub(crate) fn record(&mut self, completed: usize) -> bool {
        if completed > self.completed_at_last_expiry {
            self.consecutive = 0;
        }
        self.completed_at_last_expiry = completed;
        self.consecutive += 1;
        self.consecutive < self.limit
    }
}

/// Chunks finished so far. Survives across passes of the loop.
#[derive(Debug)]
pub(crate) struct ChunkProgress {
    plan: Vec<Chunk>,
    done: Vec<bool>,
    pub(crate) completed_size: u64,
}

impl ChunkProgress {
    pub(crate) fn new(total_size: u64) -> Self {
        let plan = chunk::plan(total_size);
        let done = vec![false; plan.len()];
        Self {
            plan,
            done,
            completed_size: 0,
        }
    }

    pub(crate) fn plan(&self) -> &[Chunk] {
        &self.plan
    }

    pub(crate) fn undone(&self) -> Vec<Chunk> {
        self.plan
            .iter()
            .filter(|c| !self.done[c.index])
            .copied()
            .collect()
    }

    pub(crate) fn mark(&mut self, chunk: &Chunk) {
        if !self.done[chunk.index] {
            self.done[chunk.index] = true;
            self.completed_size += chunk.size;
        }
    }

    pub(crate) fn completed(&self) -> usize {
        self.done.iter().filter(|d| **d).count()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.done.iter().all(|d| *d)
    }
}

/// Outcome of one pass of a transfer loop.
#[derive(Debug)]
pub(crate) enum Attempt {
    Done(std::path::PathBuf),
    Incomplete,
}

/// Run the chunks `progress` still misses, `batch_size` at a time.
///
/// Each finished chunk is recorded and published as `Running` as soon as it
/// lands. A failing chunk does not stop the rest of its batch; the first
/// hard failure (or else the expiry) is returned once the batch drains.
pub(crate) async fn transfer_chunks<F, Fut>(
    task: &Task,
    progress: &mut ChunkProgress,
    batch_size: usize,
    mut transfer: F,
) -> Result<()>
where
    F: FnMut(Chunk) -> Fut,
    Fut: Future<Output = Result<Chunk>>,
{
    let undone = progress.undone();
    for batch in undone.chunks(batch_size.max(1)) {
        let mut pending: FuturesUnordered<Fut> = batch.iter().map(|c| transfer(*c)).collect();

        let mut failure: Option<TransferError> = None;
        while let Some(result) = pending.next().await {
            match result {
                Ok(chunk) => {
                    progress.mark(&chunk);
                    task.publish(TaskState::Running {
                        completed_size: progress.completed_size,
                        total_size: task.total_size(),
                    });
                }
                Err(error) => {
                    debug!(task_id = task.id(), error = %error, "Chunk failed");
                    failure = Some(match failure {
                        Some(previous) if !previous.is_retryable() => previous,
                        _ => error,
                    });
                }
            }
        }

        if task.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if let Some(error) = failure {
            return Err(error);
        }
    }
    Ok(())
}

/// Map a failed pass to the state the loop should settle on, or `None` to
/// run another pass.
pub(crate) fn classify(
    task: &Task,
    error: TransferError,
    budget: &mut ExpiryBudget,
    completed: usize,
) -> Option<TaskState> {
    if task.is_cancelled() || matches!(error, TransferError::Cancelled) {
        return Some(TaskState::Abort);
    }
    if error.is_retryable() {
        if budget.record(completed) {
            warn!(task_id = task.id(), error = %error, "Signed URL expired, resuming");
            return None;
        }
        warn!(task_id = task.id(), "Signed URL kept expiring without progress");
    }
    Some(TaskState::Failed {
        cause: Arc::new(error),
    })
}
