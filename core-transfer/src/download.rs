//! # Download Engine
//!
//! Builds download tasks from remote file metadata and drives each one
//! through its orchestration loop:
//!
//! 1. stop with `Abort` if cancellation was requested;
//! 2. finish immediately if the destination already holds the file;
//! 3. reuse the signed URL lease or fetch a fresh one;
//! 4. run the chunks not yet completed, in batches, into a pre-allocated
//!    `<name>.download` file;
//! 5. rename the temp file into place.
//!
//! An expired signed URL never reaches the host. The lease is dropped and
//! the loop runs again over the chunks still missing, until the configured
//! number of consecutive expiries without progress is reached.

use crate::api::{DownloadUrl, FileInfo, GetDownloadUrl, GetFile};
use crate::chunk::Chunk;
use crate::engine::{
    classify, is_expired_response, transfer_chunks, Attempt, ChunkProgress, ExpiryBudget,
    TransferContext,
};
use crate::error::{Result, TransferError};
use crate::registry::{DownloadKey, TaskRegistry};
use crate::task::{DownloadDetail, SignedUrlLease, Task, TaskDetail, TaskLauncher, TaskState};
use bridge_traits::http::{HttpMethod, HttpRequest};
use core_auth::oauth::provider_error;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Signed URL lifetime requested when the caller does not pick one.
pub const DEFAULT_EXPIRE_SEC: u32 = 900;

const TEMP_SUFFIX: &str = ".download";

pub struct Downloader {
    context: TransferContext,
    folder: PathBuf,
    task_permits: Arc<Semaphore>,
    registry: TaskRegistry<DownloadKey>,
    me: Weak<Downloader>,
}

impl Downloader {
    pub fn new(context: TransferContext, folder: impl Into<PathBuf>) -> Arc<Self> {
        let task_permits = Arc::new(Semaphore::new(context.task_concurrency));
        let folder = folder.into();
        Arc::new_cyclic(|me| Self {
            context,
            folder,
            task_permits,
            registry: TaskRegistry::new(),
            me: me.clone(),
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Tasks currently between `start()` and their terminal state.
    pub fn running(&self) -> usize {
        self.registry.len()
    }

    /// Build a task for `file_id` on `drive_id`.
    ///
    /// Returns the task already in flight for the same file, if any. The
    /// returned task is not started.
    #[instrument(skip(self))]
    pub async fn build_download(
        &self,
        drive_id: &str,
        file_id: &str,
        expire_sec: Option<u32>,
    ) -> Result<Task> {
        if drive_id.is_empty() {
            return Err(TransferError::InvalidArgument("drive_id is empty".to_string()));
        }
        if file_id.is_empty() {
            return Err(TransferError::InvalidArgument("file_id is empty".to_string()));
        }
        let expire_sec = expire_sec.unwrap_or(DEFAULT_EXPIRE_SEC);
        if expire_sec == 0 {
            return Err(TransferError::InvalidArgument(
                "expire_sec must be positive".to_string(),
            ));
        }

        let key = DownloadKey {
            drive_id: drive_id.to_string(),
            file_id: file_id.to_string(),
        };
        if let Some(task) = self.registry.get(&key) {
            debug!(task_id = task.id(), "Download already running");
            return Ok(task);
        }

        let info: FileInfo = self
            .context
            .api
            .call(&GetFile {
                drive_id: drive_id.to_string(),
                file_id: file_id.to_string(),
            })
            .await?;

        if info.file_type != "file" {
            return Err(TransferError::NotTransferable(format!(
                "{} is a {}",
                file_id, info.file_type
            )));
        }
        if info.size <= 0 {
            return Err(TransferError::NotTransferable(format!("{} is empty", file_id)));
        }
        if info.name.is_empty() {
            return Err(TransferError::NotTransferable(format!("{} has no name", file_id)));
        }

        let launcher: Weak<dyn TaskLauncher> = self.me.clone();
        Ok(Task::new(
            info.name,
            drive_id.to_string(),
            file_id.to_string(),
            info.size as u64,
            TaskDetail::Download(DownloadDetail {
                parent_file_id: info.parent_file_id,
                content_hash: info.content_hash,
                expire_sec,
                lease: Mutex::new(None),
            }),
            self.context.callbacks.clone(),
            launcher,
        ))
    }

    fn key(task: &Task) -> DownloadKey {
        DownloadKey {
            drive_id: task.drive_id().to_string(),
            file_id: task.file_id().to_string(),
        }
    }

    async fn run(self: Arc<Self>, task: Task) {
        let key = Self::key(&task);
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

        let final_path = self.folder.join(task.name());
        match tokio::fs::metadata(&final_path).await {
            Ok(meta) if meta.is_file() => {
                info!(task_id = task.id(), "Destination already holds the file");
                return Ok(Attempt::Done(final_path));
            }
            Ok(_) => {
                return Err(TransferError::Conflict(format!(
                    "{} is a directory",
                    final_path.display()
                )));
            }
            Err(_) => {}
        }

        let url = self.lease_url(task).await?;

        tokio::fs::create_dir_all(&self.folder).await?;
        let temp_path = self.folder.join(format!("{}{}", task.name(), TEMP_SUFFIX));
        let temp = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&temp_path)
            .await?;
        if temp.metadata().await?.len() != task.total_size() {
            temp.set_len(task.total_size()).await?;
        }
        drop(temp);

        task.publish(TaskState::Running {
            completed_size: progress.completed_size,
            total_size: task.total_size(),
        });

        transfer_chunks(task, progress, self.context.batch_size, |chunk| {
            self.fetch_chunk(task, &url, chunk, &temp_path)
        })
        .await?;

        if !progress.is_complete() {
            return Ok(Attempt::Incomplete);
        }

        tokio::fs::rename(&temp_path, &final_path).await?;
        Ok(Attempt::Done(final_path))
    }

    async fn lease_url(&self, task: &Task) -> Result<String> {
        let detail = task
            .download_detail()
            .ok_or_else(|| TransferError::InvalidArgument("not a download task".to_string()))?;

        let now = self.context.now();
        if let Some(lease) = detail.lease.lock().ok().and_then(|l| l.clone()) {
            if lease.is_valid(now) {
                return Ok(lease.url);
            }
        }

        let response: DownloadUrl = self
            .context
            .api
            .call(&GetDownloadUrl {
                drive_id: task.drive_id().to_string(),
                file_id: task.file_id().to_string(),
                expire_sec: detail.expire_sec,
            })
            .await?;
        if response.url.is_empty() {
            return Err(TransferError::NotTransferable(format!(
                "no download URL for {}",
                task.file_id()
            )));
        }

        debug!(task_id = task.id(), expiration = ?response.expiration, "Download URL leased");
        if let Ok(mut lease) = detail.lease.lock() {
            *lease = Some(SignedUrlLease {
                url: response.url.clone(),
                expires_at: now + i64::from(detail.expire_sec),
            });
        }
        Ok(response.url)
    }

    fn invalidate_lease(&self, task: &Task) {
        if let Some(detail) = task.download_detail() {
            if let Ok(mut lease) = detail.lease.lock() {
                *lease = None;
            }
        }
    }

    fn lease_expired(&self, task: &Task) -> bool {
        let now = self.context.now();
        task.download_detail()
            .and_then(|d| d.lease.lock().ok().and_then(|l| l.clone()))
            .map_or(true, |lease| !lease.is_valid(now))
    }

    async fn fetch_chunk(
        &self,
        task: &Task,
        url: &str,
        chunk: Chunk,
        temp_path: &Path,
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
        if self.lease_expired(task) {
            return Err(TransferError::SignedUrlExpired(
                "download URL lease ran out".to_string(),
            ));
        }

        let request = HttpRequest::new(HttpMethod::Get, url).range(chunk.start, chunk.end());
        let response = self.context.transport.execute(request).await?;

        if is_expired_response(&response) {
            return Err(TransferError::SignedUrlExpired(format!(
                "chunk {} rejected with HTTP {}",
                chunk.index, response.status
            )));
        }
        if !response.is_success() {
            warn!(
                task_id = task.id(),
                chunk = chunk.index,
                status = response.status,
                "Chunk request failed"
            );
            return Err(provider_error(&response).into());
        }
        if response.body.len() as u64 != chunk.size {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "chunk {} returned {} of {} bytes",
                    chunk.index,
                    response.body.len(),
                    chunk.size
                ),
            )));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(temp_path)
            .await?;
        file.seek(SeekFrom::Start(chunk.start)).await?;
        file.write_all(&response.body).await?;
        file.flush().await?;

        debug!(task_id = task.id(), chunk = chunk.index, size = chunk.size, "Chunk written");
        Ok(chunk)
    }
}

impl TaskLauncher for Downloader {
    fn launch(&self, task: &Task) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        if !self.registry.try_register(Self::key(task), task) {
            debug!(task_id = task.id(), "Download already registered");
            return false;
        }

        self.context.announce(task);
        self.context.runtime.spawn(me.run(task.clone()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::http::{HttpClient, HttpResponse};
    use bridge_traits::storage::MemoryKeyValueStore;
    use bridge_traits::time::SystemClock;
    use bytes::Bytes;
    use core_runtime::{CallbackContext, ClientConfig, EventBus};
    use mockall::mock;
    use std::collections::HashMap;
    use std::time::Duration;

    mock! {
        Http {}

        #[async_trait::async_trait]
        impl HttpClient for Http {
            async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse>;
        }
    }

    fn json(body: &str) -> BridgeResult<HttpResponse> {
        Ok(HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: Bytes::from(body.to_string()),
        })
    }

    fn downloader(api: MockHttp, transport: MockHttp, folder: &Path) -> Arc<Downloader> {
        let config = ClientConfig::builder()
            .app_id("app")
            .app_secret("secret")
            .identifier("user")
            .download_folder(folder)
            .http_client(Arc::new(transport))
            .key_value_store(Arc::new(MemoryKeyValueStore::new()))
            .clock(Arc::new(SystemClock))
            .build()
            .unwrap();
        let context = TransferContext::new(
            &config,
            Arc::new(api),
            EventBus::new(16),
            CallbackContext::new().unwrap(),
        )
        .unwrap();
        Downloader::new(context, folder)
    }

    fn file_info(api: &mut MockHttp, body: &'static str) {
        api.expect_execute()
            .withf(|r| r.url.ends_with("openFile/get"))
            .returning(move |_| json(body));
    }

    async fn wait_terminal(task: &Task) -> TaskState {
        for _ in 0..200 {
            if let Some(state) = task.state() {
                if state.is_terminal() {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never finished");
    }

    #[tokio::test]
    async fn test_rejects_invalid_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let engine = downloader(MockHttp::new(), MockHttp::new(), dir.path());

        for (drive, file, expire) in [("", "f", None), ("d", "", None), ("d", "f", Some(0))] {
            let error = engine.build_download(drive, file, expire).await.unwrap_err();
            assert_eq!(error.code(), "RequestInvalid");
        }
    }

    #[tokio::test]
    async fn test_rejects_folders_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();

        let mut api = MockHttp::new();
        file_info(&mut api, r#"{"file_id":"f","name":"Music","size":0,"type":"folder"}"#);
        let engine = downloader(api, MockHttp::new(), dir.path());
        let error = engine.build_download("d", "f", None).await.unwrap_err();
        assert_eq!(error.code(), "ResourceNotTransferable");

        let mut api = MockHttp::new();
        file_info(&mut api, r#"{"file_id":"f","name":"a.txt","size":0,"type":"file"}"#);
        let engine = downloader(api, MockHttp::new(), dir.path());
        let error = engine.build_download("d", "f", None).await.unwrap_err();
        assert_eq!(error.code(), "ResourceNotTransferable");
    }

    #[tokio::test]
    async fn test_cancel_before_start_aborts_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockHttp::new();
        api.expect_execute()
            .withf(|r| r.url.ends_with("openFile/get"))
            .times(1)
            .returning(|_| json(r#"{"file_id":"f","name":"a.txt","size":10,"type":"file"}"#));
        api.expect_execute()
            .withf(|r| r.url.ends_with("getDownloadUrl"))
            .times(0)
            .returning(|_| json(r#"{"url":"https://cdn/a"}"#));
        let mut transport = MockHttp::new();
        transport.expect_execute().times(0).returning(|_| json(""));

        let engine = downloader(api, transport, dir.path());
        let task = engine.build_download("d", "f", None).await.unwrap();
        task.cancel();
        assert!(task.start());

        assert!(matches!(wait_terminal(&task).await, TaskState::Abort));
        assert_eq!(engine.running(), 0);
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_running_task_is_returned_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockHttp::new();
        file_info(&mut api, r#"{"file_id":"f","name":"a.txt","size":10,"type":"file"}"#);
        api.expect_execute()
            .withf(|r| r.url.ends_with("getDownloadUrl"))
            .returning(|_| json(r#"{"url":"https://cdn/a"}"#));
        let mut transport = MockHttp::new();
        transport.expect_execute().returning(|_| {
            Ok(HttpResponse {
                status: 206,
                headers: HashMap::new(),
                body: Bytes::from_static(b"0123456789"),
            })
        });

        let engine = downloader(api, transport, dir.path());
        let first = engine.build_download("d", "f", None).await.unwrap();
        assert!(first.start());
        assert!(!first.start());

        let second = engine.build_download("d", "f", None).await.unwrap();
        assert!(second.ptr_eq(&first));

        assert!(matches!(wait_terminal(&first).await, TaskState::Completed { .. }));
        assert_eq!(
            std::fs::read(dir.path().join("a.txt")).unwrap(),
            b"0123456789"
        );
        assert!(!dir.path().join("a.txt.download").exists());
    }

    #[tokio::test]
    async fn test_failed_task_is_not_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockHttp::new();
        file_info(&mut api, r#"{"file_id":"f","name":"a.txt","size":10,"type":"file"}"#);
        api.expect_execute()
            .withf(|r| r.url.ends_with("getDownloadUrl"))
            .times(1)
            .returning(|_| json(r#"{"url":"https://cdn/a"}"#));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut transport = MockHttp::new();
        transport.expect_execute().returning(move |_| {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(HttpResponse {
                status: if n == 0 { 500 } else { 206 },
                headers: HashMap::new(),
                body: Bytes::from_static(b"0123456789"),
            })
        });

        let engine = downloader(api, transport, dir.path());
        let task = engine.build_download("d", "f", None).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        task.add_state_observer(move |state| sink.lock().unwrap().push(state.clone()));

        assert!(task.start());
        assert!(matches!(wait_terminal(&task).await, TaskState::Failed { .. }));
        assert!(task.is_finished());
        assert!(!task.start());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!dir.path().join("a.txt").exists());
        assert_eq!(engine.running(), 0);
        let seen = seen.lock().unwrap();
        assert!(matches!(seen.first(), Some(TaskState::Waiting)));
        assert_eq!(seen.iter().filter(|s| s.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_existing_destination_completes_without_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"already here").unwrap();

        let mut api = MockHttp::new();
        file_info(&mut api, r#"{"file_id":"f","name":"a.txt","size":10,"type":"file"}"#);
        let mut transport = MockHttp::new();
        transport.expect_execute().times(0).returning(|_| json(""));

        let engine = downloader(api, transport, dir.path());
        let task = engine.build_download("d", "f", None).await.unwrap();
        assert!(task.start());

        match wait_terminal(&task).await {
            TaskState::Completed { result_path } => {
                assert_eq!(result_path, dir.path().join("a.txt"))
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(
            std::fs::read(dir.path().join("a.txt")).unwrap(),
            b"already here"
        );
    }

    #[tokio::test]
    async fn test_provider_error_on_chunk_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockHttp::new();
        file_info(&mut api, r#"{"file_id":"f","name":"a.txt","size":10,"type":"file"}"#);
        api.expect_execute()
            .withf(|r| r.url.ends_with("getDownloadUrl"))
            .times(1)
            .returning(|_| json(r#"{"url":"https://cdn/a"}"#));
        let mut transport = MockHttp::new();
        transport.expect_execute().times(1).returning(|_| {
            Ok(HttpResponse {
                status: 500,
                headers: HashMap::new(),
                body: Bytes::from_static(b"boom"),
            })
        });

        let engine = downloader(api, transport, dir.path());
        let task = engine.build_download("d", "f", None).await.unwrap();
        task.start();

        match wait_terminal(&task).await {
            TaskState::Failed { cause } => assert_eq!(cause.code(), "500"),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expiry_ceiling_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockHttp::new();
        file_info(&mut api, r#"{"file_id":"f","name":"a.txt","size":10,"type":"file"}"#);
        api.expect_execute()
            .withf(|r| r.url.ends_with("getDownloadUrl"))
            .times(5)
            .returning(|_| json(r#"{"url":"https://cdn/a"}"#));
        let mut transport = MockHttp::new();
        transport.expect_execute().times(5).returning(|_| {
            Ok(HttpResponse {
                status: 403,
                headers: HashMap::new(),
                body: Bytes::from_static(b"<Code>AccessDenied</Code>"),
            })
        });

        let engine = downloader(api, transport, dir.path());
        let task = engine.build_download("d", "f", None).await.unwrap();
        task.start();

        match wait_terminal(&task).await {
            TaskState::Failed { cause } => assert_eq!(cause.code(), "SignedUrlExpired"),
            other => panic!("unexpected state {other:?}"),
        }
    }
}
