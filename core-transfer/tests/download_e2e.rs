//! A signed URL expiring halfway through a download is refetched once and
//! only the missing chunk is requested again.

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use bridge_traits::MemoryKeyValueStore;
use bytes::Bytes;
use core_runtime::events::{CoreEvent, TransferEvent};
use core_runtime::{CallbackContext, ClientConfig, EventBus};
use core_transfer::{Downloader, TaskState, TransferContext, MAX_CHUNK_SIZE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const FILE_SIZE: u64 = 5 * 1024 * 1024;

fn content_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

fn respond(status: u16, body: impl Into<Bytes>) -> HttpResponse {
    HttpResponse {
        status,
        headers: HashMap::new(),
        body: body.into(),
    }
}

/// Open API: file metadata and a fresh signed URL on every request.
#[derive(Default)]
struct FakeApi {
    url_fetches: AtomicUsize,
}

#[async_trait]
impl HttpClient for FakeApi {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        if request.url.ends_with("openFile/get") {
            return Ok(respond(
                200,
                format!(
                    r#"{{"file_id":"f1","parent_file_id":"root","name":"album.zip","size":{},"type":"file"}}"#,
                    FILE_SIZE
                ),
            ));
        }
        if request.url.ends_with("openFile/getDownloadUrl") {
            let version = self.url_fetches.fetch_add(1, Ordering::SeqCst) + 1;
            return Ok(respond(
                200,
                format!(r#"{{"url":"https://cdn.example/album.zip?v={}"}}"#, version),
            ));
        }
        Ok(respond(404, r#"{"code":"NotFound","message":"no such endpoint"}"#))
    }
}

/// CDN: serves byte ranges, but the first URL is already dead for the
/// second chunk.
#[derive(Default)]
struct FakeCdn {
    requests: Mutex<Vec<(u64, String)>>,
}

fn parse_range(request: &HttpRequest) -> (u64, u64) {
    let range = request.headers.get("Range").unwrap();
    let (start, end) = range.trim_start_matches("bytes=").split_once('-').unwrap();
    (start.parse().unwrap(), end.parse().unwrap())
}

#[async_trait]
impl HttpClient for FakeCdn {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        assert!(request.authorization().is_none());
        let (start, end) = parse_range(&request);
        self.requests
            .lock()
            .unwrap()
            .push((start, request.url.clone()));

        if start == MAX_CHUNK_SIZE && request.url.ends_with("v=1") {
            return Ok(respond(
                403,
                "<Error><Code>AccessDenied</Code><Message>Request has expired</Message></Error>",
            ));
        }

        let body: Vec<u8> = (start..=end).map(content_byte).collect();
        Ok(respond(206, body))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_url_refetched_once_and_only_missing_chunk_repeated() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default());
    let cdn = Arc::new(FakeCdn::default());

    let config = ClientConfig::builder()
        .app_id("app")
        .app_secret("secret")
        .download_folder(dir.path())
        .http_client(cdn.clone())
        .key_value_store(Arc::new(MemoryKeyValueStore::new()))
        .build()
        .unwrap();
    let bus = EventBus::new(32);
    let mut events = bus.subscribe();
    let context =
        TransferContext::new(&config, api.clone(), bus, CallbackContext::new().unwrap()).unwrap();
    let downloader = Downloader::new(context, dir.path());

    let task = downloader.build_download("d1", "f1", None).await.unwrap();
    assert_eq!(task.total_size(), FILE_SIZE);

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    task.add_state_observer(move |state| sink.lock().unwrap().push(state.clone()));

    assert!(task.start());

    let task_id = task.id();
    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.unwrap() {
                CoreEvent::Transfer(event @ TransferEvent::Completed { .. })
                | CoreEvent::Transfer(event @ TransferEvent::Failed { .. })
                | CoreEvent::Transfer(event @ TransferEvent::Aborted { .. }) => break event,
                _ => continue,
            }
        }
    })
    .await
    .unwrap();

    let final_path = dir.path().join("album.zip");
    assert_eq!(
        finished,
        TransferEvent::Completed {
            task_id,
            kind: core_runtime::events::TransferKind::Download,
            result_path: final_path.display().to_string(),
        }
    );

    assert_eq!(api.url_fetches.load(Ordering::SeqCst), 2);

    let requests = cdn.requests.lock().unwrap().clone();
    let starts_for = |start: u64| requests.iter().filter(|(s, _)| *s == start).count();
    assert_eq!(requests.len(), 4);
    assert_eq!(starts_for(0), 1);
    assert_eq!(starts_for(MAX_CHUNK_SIZE), 2);
    assert_eq!(starts_for(2 * MAX_CHUNK_SIZE), 1);
    assert!(requests
        .iter()
        .any(|(s, url)| *s == MAX_CHUNK_SIZE && url.ends_with("v=2")));

    let bytes = std::fs::read(&final_path).unwrap();
    assert_eq!(bytes.len() as u64, FILE_SIZE);
    assert!(bytes
        .iter()
        .enumerate()
        .all(|(i, b)| *b == content_byte(i as u64)));
    assert!(!dir.path().join("album.zip.download").exists());

    // observers run on the callback thread; wait for the queue to drain
    for _ in 0..100 {
        if states.lock().unwrap().last().is_some_and(TaskState::is_terminal) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let states = states.lock().unwrap();
    assert!(matches!(states.first(), Some(TaskState::Waiting)));
    assert!(matches!(states.last(), Some(TaskState::Completed { .. })));
    assert_eq!(states.iter().filter(|s| s.is_terminal()).count(), 1);

    let mut last = 0;
    for state in states.iter() {
        if let TaskState::Running { completed_size, .. } = state {
            assert!(*completed_size >= last);
            last = *completed_size;
        }
    }
    assert_eq!(last, FILE_SIZE);
    assert_eq!(downloader.running(), 0);
}
