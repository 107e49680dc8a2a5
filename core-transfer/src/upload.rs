//! # Upload Engine
//!
//! `build_upload` hashes the local file, registers it with `CreateFile` and
//! returns a task. When the platform already holds identical content the
//! task completes without sending a byte (rapid upload). Otherwise parts are
//! PUT in parallel to per-part signed URLs and the upload is sealed with
//! `CompleteUpload`.
//!
//! Files of at least [`PRE_HASH_THRESHOLD`] bytes are first offered with a
//! hash of their head only. A `PreHashMatched` answer means a candidate
//! exists and the full hash with a proof code must follow.

use crate::api::{CompleteUpload, CreateFile, CreatedFile, GetUploadUrl, PartNumber, UploadUrls};
use crate::chunk::{self, Chunk};
use crate::digest::{self, CONTENT_HASH_NAME, PRE_HASH_THRESHOLD, PROOF_VERSION};
use crate::engine::{
    classify, is_expired_response, transfer_chunks, Attempt, ChunkProgress, ExpiryBudget,
    TransferContext,
};
use crate::error::{Result, TransferError};
use crate::registry::{TaskRegistry, UploadKey};
use crate::task::{PartUrlLease, Task, TaskDetail, TaskLauncher, TaskState, UploadDetail};
use bridge_traits::http::{HttpMethod, HttpRequest};
use bytes::Bytes;
use core_auth::oauth::provider_error;
use core_auth::{AuthError, Credentials};
use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Lifetime assumed for part upload URLs.
pub const PART_URL_LEASE_SEC: i64 = 3600;

/// Parent folder used when none is given.
pub const ROOT_FOLDER: &str = "root";

/// What the platform does when the target name is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckNameMode {
    #[default]
    AutoRename,
    Refuse,
    Ignore,
}

impl CheckNameMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckNameMode::AutoRename => "auto_rename",
            CheckNameMode::Refuse => "refuse",
            CheckNameMode::Ignore => "ignore",
        }
    }
}

impl fmt::Display for CheckNameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckNameMode {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto_rename" => Ok(CheckNameMode::AutoRename),
            "refuse" => Ok(CheckNameMode::Refuse),
            "ignore" => Ok(CheckNameMode::Ignore),
            other => Err(TransferError::InvalidArgument(format!(
                "unknown check_name_mode '{}'",
                other
            ))),
        }
    }
}

/// Local file facts gathered once per build.
struct LocalFile<'a> {
    path: &'a Path,
    name: String,
    size: u64,
    parts: Vec<PartNumber>,
}

pub struct Uploader {
    context: TransferContext,
    credentials: Arc<Credentials>,
    task_permits: Arc<Semaphore>,
    registry: TaskRegistry<UploadKey>,
    me: Weak<Uploader>,
}

impl Uploader {
    pub fn new(context: TransferContext, credentials: Arc<Credentials>) -> Arc<Self> {
        let task_permits = Arc::new(Semaphore::new(context.task_concurrency));
        Arc::new_cyclic(|me| Self {
            context,
            credentials,
            task_permits,
            registry: TaskRegistry::new(),
            me: me.clone(),
        })
    }

    pub fn running(&self) -> usize {
        self.registry.len()
    }

    /// Register `local_path` for upload into `parent_id` (default `root`).
    ///
    /// Returns the task already in flight for the same source and target,
    /// if any. The returned task is not started.
    #[instrument(skip(self, local_path), fields(path = %local_path.as_ref().display()))]
    pub async fn build_upload(
        &self,
        drive_id: &str,
        local_path: impl AsRef<Path>,
        parent_id: Option<&str>,
        check_name_mode: Option<CheckNameMode>,
    ) -> Result<Task> {
        let path = local_path.as_ref();
        if drive_id.is_empty() {
            return Err(TransferError::InvalidArgument("drive_id is empty".to_string()));
        }
        let meta = tokio::fs::metadata(path).await.map_err(|_| {
            TransferError::InvalidArgument(format!("{} does not exist", path.display()))
        })?;
        if !meta.is_file() {
            return Err(TransferError::InvalidArgument(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                TransferError::InvalidArgument(format!("{} has no file name", path.display()))
            })?;

        let parent_id = parent_id.filter(|p| !p.is_empty()).unwrap_or(ROOT_FOLDER);
        let check_name_mode = check_name_mode.unwrap_or_default();

        let key = UploadKey {
            drive_id: drive_id.to_string(),
            parent_file_id: parent_id.to_string(),
            local_path: path.to_path_buf(),
        };
        if let Some(task) = self.registry.get(&key) {
            debug!(task_id = task.id(), "Upload already running");
            return Ok(task);
        }

        let size = meta.len();
        let local = LocalFile {
            path,
            name,
            size,
            parts: chunk::plan(size)
                .iter()
                .map(|c| PartNumber {
                    part_number: c.part_number(),
                })
                .collect(),
        };

        let use_pre_hash = size >= PRE_HASH_THRESHOLD;
        let created = match self
            .create_file(drive_id, parent_id, check_name_mode, &local, use_pre_hash)
            .await
        {
            Err(error) if use_pre_hash && error.is_pre_hash_matched() => {
                debug!("Pre-hash matched, sending full hash");
                self.create_file(drive_id, parent_id, check_name_mode, &local, false)
                    .await?
            }
            other => other?,
        };

        if created.exist {
            return Err(TransferError::Conflict(format!(
                "{} already exists in {}",
                local.name, parent_id
            )));
        }

        let lease = if created.rapid_upload {
            info!(file_id = %created.file_id, "Rapid upload, content already stored");
            None
        } else {
            Some(self.part_lease(&created.part_info_list))
        };

        let name = if created.file_name.is_empty() {
            local.name
        } else {
            created.file_name
        };
        let launcher: Weak<dyn TaskLauncher> = self.me.clone();
        Ok(Task::new(
            name,
            drive_id.to_string(),
            created.file_id,
            size,
            TaskDetail::Upload(UploadDetail {
                parent_file_id: parent_id.to_string(),
                upload_id: created.upload_id,
                local_path: path.to_path_buf(),
                rapid_upload: created.rapid_upload,
                lease: Mutex::new(lease.filter(|l| !l.parts.is_empty())),
            }),
            self.context.callbacks.clone(),
            launcher,
        ))
    }

    async fn create_file(
        &self,
        drive_id: &str,
        parent_id: &str,
        check_name_mode: CheckNameMode,
        local: &LocalFile<'_>,
        use_pre_hash: bool,
    ) -> Result<CreatedFile> {
        let mut scope = CreateFile {
            drive_id: drive_id.to_string(),
            parent_file_id: parent_id.to_string(),
            name: local.name.clone(),
            file_type: "file".to_string(),
            check_name_mode: check_name_mode.to_string(),
            size: local.size,
            part_info_list: local.parts.clone(),
            pre_hash: None,
            content_hash: None,
            content_hash_name: None,
            proof_code: None,
            proof_version: None,
        };

        if use_pre_hash {
            scope.pre_hash = Some(digest::pre_hash(local.path).await?);
        } else {
            let access_token = self
                .credentials
                .access_token()
                .await
                .ok_or(TransferError::Auth(AuthError::NotAuthenticated))?;
            scope.content_hash = Some(digest::sha1_hex(local.path).await?);
            scope.content_hash_name = Some(CONTENT_HASH_NAME.to_string());
            scope.proof_code = Some(digest::proof_code(&access_token, local.path, local.size).await?);
            scope.proof_version = Some(PROOF_VERSION.to_string());
        }

        self.context.api.call(&scope).await
    }

    fn part_lease(&self, parts: &[crate::api::PartInfo]) -> PartUrlLease {
        PartUrlLease {
            parts: parts
                .iter()
                .filter(|p| !p.upload_url.is_empty())
                .map(|p| (p.part_number, p.upload_url.clone()))
                .collect::<HashMap<_, _>>(),
            expires_at: self.context.now() + PART_URL_LEASE_SEC,
        }
    }

    fn key(task: &Task) -> Option<UploadKey> {
        Some(UploadKey {
            drive_id: task.drive_id().to_string(),
            parent_file_id: task.parent_file_id().to_string(),
            local_path: task.local_path()?.to_path_buf(),
        })
    }

    async fn run(self: Arc<Self>, task: Task, key: UploadKey) {
        let _permit = match Arc::clone(&self.task_permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.context.settle(&self.registry, &key, &task, TaskState::Abort);
                return;
            }
        };

        let mut progress = ChunkProgress::new(task.total_size());
        let mut budget = ExpiryBudget::new(self.context.expiry_retry_limit);

        let state = loop {
            match self.attempt(&task, &mut progress).await {
                Ok(Attempt::Done(result_path)) => break TaskState::Completed { result_path },
                Ok(Attempt::Incomplete) => continue,
                Err(error) => {
                    if error.is_retryable() {
                        self.invalidate_lease(&task);
                    }
                    if let Some(state) = classify(&task, error, &mut budget, progress.completed()) {
                        break state;
                    }
                }
            }
        };

        self.context.settle(&self.registry, &key, &task, state);
    }

    async fn attempt(&self, task: &Task, progress: &mut ChunkProgress) -> Result<Attempt> {
        if task.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let detail = task
            .upload_detail()
            .ok_or_else(|| TransferError::InvalidArgument("not an upload task".to_string()))?;

        if detail.rapid_upload {
            return Ok(Attempt::Done(detail.local_path.clone()));
        }

        let lease = self.lease_urls(task, detail, progress).await?;

        task.publish(TaskState::Running {
            completed_size: progress.completed_size,
            total_size: task.total_size(),
        });

        transfer_chunks(task, progress, self.context.batch_size, |chunk| {
            self.put_part(task, &lease, chunk, &detail.local_path)
        })
        .await?;

        if !progress.is_complete() {
            return Ok(Attempt::Incomplete);
        }

        self.context
            .api
            .send(&CompleteUpload {
                drive_id: task.drive_id().to_string(),
                file_id: task.file_id().to_string(),
                upload_id: detail.upload_id.clone(),
            })
            .await?;
        Ok(Attempt::Done(detail.local_path.clone()))
    }

    /// Current part URLs, refetched for every part when the lease is gone.
    async fn lease_urls(
        &self,
        task: &Task,
        detail: &UploadDetail,
        progress: &ChunkProgress,
    ) -> Result<PartUrlLease> {
        let now = self.context.now();
        if let Some(lease) = detail.lease.lock().ok().and_then(|l| l.clone()) {
            if lease.is_valid(now) {
                return Ok(lease);
            }
        }

        let urls: UploadUrls = self
            .context
            .api
            .call(&GetUploadUrl {
                drive_id: task.drive_id().to_string(),
                file_id: task.file_id().to_string(),
                upload_id: detail.upload_id.clone(),
                part_info_list: progress
                    .plan()
                    .iter()
                    .map(|c| PartNumber {
                        part_number: c.part_number(),
                    })
                    .collect(),
            })
            .await?;

        let lease = self.part_lease(&urls.part_info_list);
        if lease.parts.is_empty() {
            return Err(TransferError::NotTransferable(format!(
                "no upload URLs for {}",
                task.file_id()
            )));
        }
        debug!(task_id = task.id(), parts = lease.parts.len(), "Upload URLs leased");
        if let Ok(mut current) = detail.lease.lock() {
            *current = Some(lease.clone());
        }
        Ok(lease)
    }

    fn invalidate_lease(&self, task: &Task) {
        if let Some(detail) = task.upload_detail() {
            if let Ok(mut lease) = detail.lease.lock() {
                *lease = None;
            }
        }
    }

    async fn put_part(
        &self,
        task: &Task,
        lease: &PartUrlLease,
        chunk: Chunk,
        local_path: &Path,
    ) -> Result<Chunk> {
        let _permit = self
            .context
            .chunk_permits
            .acquire()
            .await
            .map_err(|_| TransferError::Cancelled)?;

        if task.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if !lease.is_valid(self.context.now()) {
            return Err(TransferError::SignedUrlExpired(
                "upload URL lease ran out".to_string(),
            ));
        }
        let url = lease.url(chunk.part_number()).ok_or_else(|| {
            TransferError::SignedUrlExpired(format!("no URL for part {}", chunk.part_number()))
        })?;

        let mut file = tokio::fs::File::open(local_path).await?;
        file.seek(SeekFrom::Start(chunk.start)).await?;
        let mut body = vec![0u8; chunk.size as usize];
        file.read_exact(&mut body).await?;

        let request = HttpRequest::new(HttpMethod::Put, url).body(Bytes::from(body));
        let response = self.context.transport.execute(request).await?;

        if is_expired_response(&response) {
            return Err(TransferError::SignedUrlExpired(format!(
                "part {} rejected with HTTP {}",
                chunk.part_number(),
                response.status
            )));
        }
        if response.status == 409
            && String::from_utf8_lossy(&response.body).contains("PartAlreadyExist")
        {
            debug!(task_id = task.id(), part = chunk.part_number(), "Part already uploaded");
            return Ok(chunk);
        }
        if !response.is_success() {
            warn!(
                task_id = task.id(),
                part = chunk.part_number(),
                status = response.status,
                "Part upload failed"
            );
            return Err(provider_error(&response).into());
        }

        debug!(task_id = task.id(), part = chunk.part_number(), size = chunk.size, "Part uploaded");
        Ok(chunk)
    }
}

impl TaskLauncher for Uploader {
    fn launch(&self, task: &Task) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        let Some(key) = Self::key(task) else {
            return false;
        };
        if !self.registry.try_register(key.clone(), task) {
            debug!(task_id = task.id(), "Upload already registered");
            return false;
        }

        self.context.announce(task);
        self.context.runtime.spawn(me.run(task.clone(), key));
        true
    }
}
