//! # Transfer Tasks
//!
//! A [`Task`] is the host's handle on one download or upload. It carries the
//! resource identity, a one-way cancellation flag, the current signed-URL
//! lease and the list of state observers.
//!
//! ## State machine
//!
//! ```text
//! Waiting ──► Running ──► Completed
//!                │  ▲  └──► Failed
//!                │  │  └──► Abort
//!                └──┘ (signed URL expired, refetch and resume)
//! ```
//!
//! States are published on the shared [`CallbackContext`]: observers run
//! one at a time, in registration order, never on a transfer worker. Once a
//! terminal state has been delivered nothing else is.

use crate::error::TransferError;
use core_runtime::events::TransferKind;
use core_runtime::CallbackContext;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub enum TaskState {
    Waiting,
    Running { completed_size: u64, total_size: u64 },
    Completed { result_path: PathBuf },
    Failed { cause: Arc<TransferError> },
    Abort,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed { .. } | TaskState::Failed { .. } | TaskState::Abort
        )
    }

    /// `completed / total` in `0.0..=1.0` while running.
    pub fn progress(&self) -> Option<f64> {
        match self {
            TaskState::Running {
                completed_size,
                total_size,
            } if *total_size > 0 => Some(*completed_size as f64 / *total_size as f64),
            _ => None,
        }
    }
}

/// Handle returned by [`Task::add_state_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type StateObserver = Arc<dyn Fn(&TaskState) + Send + Sync>;

/// Time-bounded signed URL. Replaced, never edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrlLease {
    pub url: String,
    /// Unix epoch seconds
    pub expires_at: i64,
}

impl SignedUrlLease {
    pub fn is_valid(&self, now: i64) -> bool {
        !self.url.is_empty() && now <= self.expires_at
    }
}

/// Per-part signed upload URLs, keyed by part number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartUrlLease {
    pub parts: HashMap<u32, String>,
    pub expires_at: i64,
}

impl PartUrlLease {
    pub fn is_valid(&self, now: i64) -> bool {
        !self.parts.is_empty() && now <= self.expires_at
    }

    pub fn url(&self, part_number: u32) -> Option<&str> {
        self.parts.get(&part_number).map(String::as_str)
    }
}

#[derive(Debug)]
pub(crate) struct DownloadDetail {
    pub parent_file_id: String,
    pub content_hash: String,
    pub expire_sec: u32,
    pub lease: Mutex<Option<SignedUrlLease>>,
}

#[derive(Debug)]
pub(crate) struct UploadDetail {
    pub parent_file_id: String,
    pub upload_id: String,
    pub local_path: PathBuf,
    pub rapid_upload: bool,
    pub lease: Mutex<Option<PartUrlLease>>,
}

#[derive(Debug)]
pub(crate) enum TaskDetail {
    Download(DownloadDetail),
    Upload(UploadDetail),
}

/// Starts the orchestration loop of a task it built.
pub(crate) trait TaskLauncher: Send + Sync {
    fn launch(&self, task: &Task) -> bool;
}

struct TaskInner {
    id: u64,
    name: String,
    drive_id: String,
    file_id: String,
    total_size: u64,
    detail: TaskDetail,
    cancelled: AtomicBool,
    finished: AtomicBool,
    next_observer: AtomicU64,
    observers: Mutex<Vec<(ObserverId, StateObserver)>>,
    last_state: Mutex<Option<TaskState>>,
    callbacks: CallbackContext,
    launcher: Weak<dyn TaskLauncher>,
}

/// Download or upload task. Clones share the same task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub(crate) fn new(
        name: String,
        drive_id: String,
        file_id: String,
        total_size: u64,
        detail: TaskDetail,
        callbacks: CallbackContext,
        launcher: Weak<dyn TaskLauncher>,
    ) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                name,
                drive_id,
                file_id,
                total_size,
                detail,
                cancelled: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                next_observer: AtomicU64::new(0),
                observers: Mutex::new(Vec::new()),
                last_state: Mutex::new(None),
                callbacks,
                launcher,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> TransferKind {
        match self.inner.detail {
            TaskDetail::Download(_) => TransferKind::Download,
            TaskDetail::Upload(_) => TransferKind::Upload,
        }
    }

    /// Remote file name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn drive_id(&self) -> &str {
        &self.inner.drive_id
    }

    pub fn file_id(&self) -> &str {
        &self.inner.file_id
    }

    pub fn parent_file_id(&self) -> &str {
        match &self.inner.detail {
            TaskDetail::Download(d) => &d.parent_file_id,
            TaskDetail::Upload(u) => &u.parent_file_id,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.inner.total_size
    }

    /// Source file of an upload.
    pub fn local_path(&self) -> Option<&Path> {
        match &self.inner.detail {
            TaskDetail::Upload(u) => Some(&u.local_path),
            TaskDetail::Download(_) => None,
        }
    }

    /// Whether the platform already had identical content.
    pub fn is_rapid_upload(&self) -> bool {
        matches!(&self.inner.detail, TaskDetail::Upload(u) if u.rapid_upload)
    }

    /// Start the transfer.
    ///
    /// Returns `false` without doing anything when the task (or another task
    /// for the same resource) is already running, or when the task has
    /// already finished.
    pub fn start(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        match self.inner.launcher.upgrade() {
            Some(launcher) => launcher.launch(self),
            None => false,
        }
    }

    /// Request cancellation. Takes effect at the next chunk boundary.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// A terminal state has been reached. Set before observers hear of it.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    pub fn add_state_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&TaskState) + Send + Sync + 'static,
    {
        let id = ObserverId(self.inner.next_observer.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut observers) = self.inner.observers.lock() {
            observers.push((id, Arc::new(observer)));
        }
        id
    }

    pub fn remove_state_observer(&self, id: ObserverId) -> bool {
        match self.inner.observers.lock() {
            Ok(mut observers) => {
                let before = observers.len();
                observers.retain(|(existing, _)| *existing != id);
                observers.len() != before
            }
            Err(_) => false,
        }
    }

    /// Last state delivered to observers.
    pub fn state(&self) -> Option<TaskState> {
        self.inner.last_state.lock().ok().and_then(|s| s.clone())
    }

    /// Same task, not merely the same resource.
    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn download_detail(&self) -> Option<&DownloadDetail> {
        match &self.inner.detail {
            TaskDetail::Download(d) => Some(d),
            TaskDetail::Upload(_) => None,
        }
    }

    pub(crate) fn upload_detail(&self) -> Option<&UploadDetail> {
        match &self.inner.detail {
            TaskDetail::Upload(u) => Some(u),
            TaskDetail::Download(_) => None,
        }
    }

    /// Refuse any further `start()`.
    pub(crate) fn mark_finished(&self) {
        self.inner.finished.store(true, Ordering::SeqCst);
    }

    /// Queue `state` for the observers.
    ///
    /// Dropped on the callback thread if a terminal state already went out.
    pub(crate) fn publish(&self, state: TaskState) {
        if state.is_terminal() {
            self.mark_finished();
        }
        let inner = Arc::clone(&self.inner);
        inner.callbacks.clone().post(move || {
            {
                let Ok(mut last) = inner.last_state.lock() else {
                    return;
                };
                if last.as_ref().is_some_and(TaskState::is_terminal) {
                    return;
                }
                *last = Some(state.clone());
            }

            let observers: Vec<StateObserver> = match inner.observers.lock() {
                Ok(observers) => observers.iter().map(|(_, o)| Arc::clone(o)).collect(),
                Err(_) => return,
            };
            for observer in observers {
                observer(&state);
            }
        });
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .field("name", &self.inner.name)
            .field("drive_id", &self.inner.drive_id)
            .field("file_id", &self.inner.file_id)
            .field("total_size", &self.inner.total_size)
            .finish()
    }
}
