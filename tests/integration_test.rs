use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::Method;
use reqwest::header::HeaderValue;
use tokio::sync::{broadcast, Semaphore};
use url::Url;
use tunnel::config::ClientConfig;
use tunnel::tus::{
    FileStore, JsonRecordStore, MemoryFileStore, MemoryRecordStore, RecordStore, Transport,
    TransportResponse, TusClient, TusError, UploadDelegate, UploadEvent, UploadId, UploadRecord,
    UploadRequest, UploadStatus,
};
use tunnel::utils::{RetryPolicy, RetryStrategy};

const ENDPOINT: &str = "http://localhost:1080/files/";
const MIB: usize = 1024 * 1024;

struct FakeUpload {
    length: u64,
    data: BytesMut,
}

/// 模拟 tus 服务端
///
/// Keeps uploads in memory, answers POST / PATCH / HEAD like a tus 1.0.0
/// server and logs every request it serves.
#[derive(Default)]
struct FakeTusServer {
    uploads: Mutex<HashMap<String, FakeUpload>>,
    requests: Mutex<Vec<UploadRequest>>,
    /// PATCH number (1-based) → status returned instead of accepting the chunk
    faults: Mutex<HashMap<usize, u16>>,
    patches: AtomicUsize,
    /// When set, every request waits for a permit first
    gate: Option<Arc<Semaphore>>,
}

impl FakeTusServer {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let server = Arc::new(Self {
            gate: Some(gate.clone()),
            ..Self::default()
        });
        (server, gate)
    }

    fn fail_patch(&self, patch: usize, status: u16) {
        self.faults.lock().unwrap().insert(patch, status);
    }

    fn seed(&self, path: &str, length: u64, data: &[u8]) {
        self.uploads.lock().unwrap().insert(path.to_string(), FakeUpload {
            length,
            data: BytesMut::from(data),
        });
    }

    fn data(&self, path: &str) -> Option<Bytes> {
        self.uploads.lock().unwrap().get(path).map(|upload| upload.data.clone().freeze())
    }

    fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    fn requests(&self) -> Vec<UploadRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn patch_bodies(&self) -> Vec<usize> {
        self.requests()
            .iter()
            .filter(|request| request.method == Method::PATCH)
            .map(|request| request.body.len())
            .collect()
    }

    fn respond(&self, request: &UploadRequest) -> TransportResponse {
        let path = request.url.path().to_string();
        let mut uploads = self.uploads.lock().unwrap();

        if request.method == Method::POST {
            let length = request
                .header("Upload-Length")
                .and_then(|value| value.parse().ok())
                .unwrap_or(0);
            let location = format!("/files/{}", uploads.len() + 1);
            uploads.insert(location.clone(), FakeUpload { length, data: BytesMut::new() });
            return with_headers(201, &[("Location", location)]);
        }

        let Some(upload) = uploads.get_mut(&path) else {
            return TransportResponse::new(404);
        };

        if request.method == Method::HEAD {
            return with_headers(200, &[
                ("Upload-Offset", upload.data.len().to_string()),
                ("Upload-Length", upload.length.to_string()),
            ]);
        }

        let patch = self.patches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(status) = self.faults.lock().unwrap().remove(&patch) {
            return TransportResponse::new(status);
        }

        let offset: Option<usize> = request.header("Upload-Offset").and_then(|value| value.parse().ok());
        if offset != Some(upload.data.len()) {
            return TransportResponse::new(409);
        }
        upload.data.extend_from_slice(&request.body);
        with_headers(204, &[("Upload-Offset", upload.data.len().to_string())])
    }
}

fn with_headers(status: u16, headers: &[(&'static str, String)]) -> TransportResponse {
    let mut response = TransportResponse::new(status);
    for (name, value) in headers {
        response.headers.insert(*name, HeaderValue::from_str(value).unwrap());
    }
    response
}

#[async_trait]
impl Transport for FakeTusServer {
    async fn execute(&self, request: UploadRequest) -> tunnel::Result<TransportResponse> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|err| TusError::TransportError(err.to_string()))?
                .forget();
        }
        let response = self.respond(&request);
        self.requests.lock().unwrap().push(request);
        Ok(response)
    }
}

#[derive(Default)]
struct CountingDelegate {
    successes: Mutex<Vec<UploadId>>,
    failures: Mutex<Vec<Option<UploadId>>>,
}

impl CountingDelegate {
    fn successes(&self) -> Vec<UploadId> {
        self.successes.lock().unwrap().clone()
    }

    fn failures(&self) -> Vec<Option<UploadId>> {
        self.failures.lock().unwrap().clone()
    }
}

impl UploadDelegate for CountingDelegate {
    fn on_success(&self, record: &UploadRecord) {
        self.successes.lock().unwrap().push(record.id);
    }

    fn on_failure(&self, record: Option<&UploadRecord>, _error: &TusError) {
        self.failures.lock().unwrap().push(record.map(|record| record.id));
    }
}

struct Setup {
    client: TusClient,
    server: Arc<FakeTusServer>,
    files: Arc<MemoryFileStore>,
    records: Arc<dyn RecordStore>,
    delegate: Arc<CountingDelegate>,
}

fn config(chunk_size: usize) -> ClientConfig {
    let mut config = ClientConfig::new(Url::parse(ENDPOINT).unwrap(), ".unused");
    config.chunk_size = chunk_size;
    config.retry = RetryPolicy {
        max_retries: 2,
        strategy: RetryStrategy::Fixed { delay_ms: 1 },
    };
    config
}

fn start(
    server: Arc<FakeTusServer>,
    chunk_size: usize,
    files: Arc<MemoryFileStore>,
    records: Arc<dyn RecordStore>,
) -> Setup {
    let delegate = Arc::new(CountingDelegate::default());
    let client = TusClient::with_parts(
        config(chunk_size),
        server.clone(),
        files.clone(),
        records.clone(),
        delegate.clone(),
    )
    .unwrap();

    Setup {
        client,
        server,
        files,
        records,
        delegate,
    }
}

fn setup(server: Arc<FakeTusServer>, chunk_size: usize) -> Setup {
    start(server, chunk_size, Arc::new(MemoryFileStore::new()), Arc::new(MemoryRecordStore::new()))
}

fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

async fn wait_for<F>(events: &mut broadcast::Receiver<UploadEvent>, mut matches: F) -> UploadEvent
where
    F: FnMut(&UploadEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for upload event")
}

async fn drained(events: &mut broadcast::Receiver<UploadEvent>) {
    wait_for(events, |event| matches!(event, UploadEvent::Drained)).await;
}

/// Waits until every id in `upload_ids` has completed, failed or been canceled.
async fn settled(events: &mut broadcast::Receiver<UploadEvent>, upload_ids: &[UploadId]) {
    let mut pending: HashSet<UploadId> = upload_ids.iter().copied().collect();
    wait_for(events, |event| {
        match event {
            UploadEvent::Completed { upload_id, .. }
            | UploadEvent::Failed { upload_id: Some(upload_id), .. }
            | UploadEvent::Canceled { upload_id } => {
                pending.remove(upload_id);
            }
            _ => {}
        }
        pending.is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_chunked_upload_completes() {
    let s = setup(FakeTusServer::new(), MIB);
    let mut events = s.client.subscribe_events();

    let data = payload(5 * MIB / 2);
    let metadata = BTreeMap::from([("filename".to_string(), "video.mp4".to_string())]);
    let upload_id = s.client.upload_data(data.clone(), metadata).await.unwrap();

    let completed = wait_for(&mut events, |event| matches!(event, UploadEvent::Completed { .. })).await;
    let UploadEvent::Completed { upload_id: done, upload_url } = completed else { unreachable!() };
    assert_eq!(done, upload_id);
    assert_eq!(upload_url.unwrap().as_str(), "http://localhost:1080/files/1");
    drained(&mut events).await;

    let requests = s.server.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[0].method, Method::POST);
    assert_eq!(requests[0].header("Upload-Length"), Some("2621440"));
    assert_eq!(requests[0].header("Upload-Metadata"), Some("filename dmlkZW8ubXA0"));
    assert_eq!(s.server.patch_bodies(), vec![MIB, MIB, MIB / 2]);

    let offsets: Vec<_> = requests[1..].iter().map(|request| request.header("Upload-Offset").unwrap()).collect();
    assert_eq!(offsets, vec!["0", "1048576", "2097152"]);
    assert!(requests.iter().all(|request| request.header("Tus-Resumable") == Some("1.0.0")));

    assert_eq!(s.server.data("/files/1").unwrap(), data);
    assert_eq!(s.delegate.successes(), vec![upload_id]);
    assert!(s.delegate.failures().is_empty());

    // completed uploads leave nothing behind
    assert!(!s.files.exists(&upload_id.to_string()).await);
    assert!(s.records.restore().await.unwrap().is_empty());
    assert!(s.client.current().await.unwrap().is_none());

    s.client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_progress_is_reported_per_chunk() {
    let s = setup(FakeTusServer::new(), 1000);
    let mut events = s.client.subscribe_events();

    let upload_id = s.client.upload_data(payload(2500), BTreeMap::new()).await.unwrap();

    let mut progress = Vec::new();
    loop {
        match wait_for(&mut events, |_| true).await {
            UploadEvent::Progress { upload_id: id, bytes_uploaded, total_bytes } => {
                assert_eq!(id, upload_id);
                assert_eq!(total_bytes, 2500);
                progress.push(bytes_uploaded);
            }
            UploadEvent::Drained => break,
            _ => {}
        }
    }

    assert_eq!(progress, vec![1000, 2000, 2500]);
    s.client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_error_fails_without_retry() {
    let server = FakeTusServer::new();
    server.fail_patch(2, 404);
    let s = setup(server, MIB);
    let mut events = s.client.subscribe_events();

    let upload_id = s.client.upload_data(payload(5 * MIB / 2), BTreeMap::new()).await.unwrap();

    let failed = wait_for(&mut events, |event| matches!(event, UploadEvent::Failed { .. })).await;
    assert!(matches!(failed, UploadEvent::Failed { upload_id: Some(id), .. } if id == upload_id));
    drained(&mut events).await;

    // POST, accepted PATCH, rejected PATCH; nothing after the failure
    assert_eq!(s.server.requests().len(), 3);
    assert_eq!(s.delegate.failures(), vec![Some(upload_id)]);
    assert!(s.delegate.successes().is_empty());

    let stored = s.records.restore().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, UploadStatus::Failed);
    assert_eq!(stored[0].upload_offset, MIB as u64);
    assert!(stored[0].error.is_some());

    s.client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = FakeTusServer::new();
    server.fail_patch(2, 503);
    let s = setup(server, 1000);
    let mut events = s.client.subscribe_events();

    let data = payload(2500);
    let upload_id = s.client.upload_data(data.clone(), BTreeMap::new()).await.unwrap();
    drained(&mut events).await;

    assert_eq!(s.server.patch_bodies(), vec![1000, 1000, 1000, 500]);
    assert_eq!(s.server.data("/files/1").unwrap(), data);
    assert_eq!(s.delegate.successes(), vec![upload_id]);
    assert!(s.delegate.failures().is_empty());

    s.client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let server = FakeTusServer::new();
    for patch in 1..=3 {
        server.fail_patch(patch, 500);
    }
    let s = setup(server, 1000);
    let mut events = s.client.subscribe_events();

    let upload_id = s.client.upload_data(payload(1500), BTreeMap::new()).await.unwrap();
    drained(&mut events).await;

    // first attempt plus two retries
    assert_eq!(s.server.patch_bodies().len(), 3);
    assert_eq!(s.delegate.failures(), vec![Some(upload_id)]);

    s.client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_runs_one_upload_at_a_time() {
    let s = setup(FakeTusServer::new(), 1024);
    let mut events = s.client.subscribe_events();

    let first = s.client.upload_data(payload(3000), BTreeMap::new()).await.unwrap();
    let second = s.client.upload_data(payload(5000), BTreeMap::new()).await.unwrap();

    // the queue may drain between the two enqueues
    settled(&mut events, &[first, second]).await;

    let requests = s.server.requests();
    let second_create = requests
        .iter()
        .position(|request| request.method == Method::POST && request.header("Upload-Length") == Some("5000"))
        .unwrap();

    // everything for the first upload happens before the second is created
    assert!(requests[..second_create].iter().all(|request| {
        request.url.path() == "/files/1" || request.header("Upload-Length") == Some("3000")
    }));
    assert!(requests[second_create + 1..].iter().all(|request| request.url.path() == "/files/2"));
    assert_eq!(s.delegate.successes(), vec![first, second]);

    s.client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_active_starts_next() {
    let (server, gate) = FakeTusServer::gated();
    let s = setup(server, 1024);
    let mut events = s.client.subscribe_events();

    let first = s.client.upload_data(payload(3000), BTreeMap::new()).await.unwrap();
    let second = s.client.upload_data(payload(2000), BTreeMap::new()).await.unwrap();

    s.client.cancel(first).await.unwrap();
    let canceled = wait_for(&mut events, |event| matches!(event, UploadEvent::Canceled { .. })).await;
    assert!(matches!(canceled, UploadEvent::Canceled { upload_id } if upload_id == first));

    gate.add_permits(100);
    drained(&mut events).await;

    // the held create for the first upload never reached the server
    assert_eq!(s.server.upload_count(), 1);
    assert!(s.server
        .requests()
        .iter()
        .filter(|request| request.method == Method::POST)
        .all(|request| request.header("Upload-Length") == Some("2000")));

    assert_eq!(s.delegate.successes(), vec![second]);
    assert!(s.delegate.failures().is_empty());

    let stored = s.records.restore().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, first);
    assert_eq!(stored[0].status, UploadStatus::Canceled);

    s.client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_queued_upload() {
    let (server, gate) = FakeTusServer::gated();
    let s = setup(server, 1024);
    let mut events = s.client.subscribe_events();

    let first = s.client.upload_data(payload(3000), BTreeMap::new()).await.unwrap();
    let second = s.client.upload_data(payload(2000), BTreeMap::new()).await.unwrap();

    s.client.cancel(second).await.unwrap();
    let remaining = s.client.uploads().await.unwrap();
    assert_eq!(remaining.iter().map(|record| record.id).collect::<Vec<_>>(), vec![first]);
    assert!(s.client.get_upload(second).await.unwrap().is_none());

    gate.add_permits(100);
    drained(&mut events).await;

    assert_eq!(s.delegate.successes(), vec![first]);
    assert_eq!(s.server.upload_count(), 1);

    let stored = s.records.restore().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, UploadStatus::Canceled);

    assert!(matches!(s.client.cancel(second).await, Err(TusError::NotFound(_))));
    s.client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resume_from_persisted_offset() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("uploads.json");
    let data = payload(3000);

    let server = FakeTusServer::new();
    server.seed("/files/7", 3000, &data[..1024]);

    let files = Arc::new(MemoryFileStore::new());
    let mut record = UploadRecord::new("interrupted", 3000, BTreeMap::new());
    record.upload_url = Some(Url::parse("http://localhost:1080/files/7").unwrap());
    record.status = UploadStatus::Uploading;
    record.upload_offset = 1024;
    record.retry_count = 2;
    files.write(&record.file_name, data.clone()).await.unwrap();
    JsonRecordStore::new(&state_file).save(&record).await.unwrap();

    let records: Arc<dyn RecordStore> = Arc::new(JsonRecordStore::new(&state_file));
    let s = start(server, 1024, files, records);
    let mut events = s.client.subscribe_events();

    // the worker restores before it serves any command
    let current = s.client.current().await.unwrap();
    if let Some(current) = current {
        assert_eq!(current.id, record.id);
        assert_eq!(current.retry_count, 0);
    }
    drained(&mut events).await;

    let requests = s.server.requests();
    assert_eq!(requests[0].method, Method::HEAD);
    assert!(requests.iter().all(|request| request.method != Method::POST));
    let offsets: Vec<_> = requests[1..].iter().map(|request| request.header("Upload-Offset").unwrap()).collect();
    assert_eq!(offsets, vec!["1024", "2048"]);
    assert_eq!(s.server.patch_bodies(), vec![1024, 952]);

    assert_eq!(s.server.data("/files/7").unwrap(), data);
    assert_eq!(s.delegate.successes(), vec![record.id]);
    assert!(JsonRecordStore::new(&state_file).restore().await.unwrap().is_empty());

    s.client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_terminal_records_are_not_restored() {
    let records = Arc::new(MemoryRecordStore::new());
    let mut failed = UploadRecord::new("failed", 10, BTreeMap::new());
    failed.status = UploadStatus::Failed;
    records.save(&failed).await.unwrap();

    let s = start(FakeTusServer::new(), 1024, Arc::new(MemoryFileStore::new()), records);

    assert!(s.client.uploads().await.unwrap().is_empty());
    assert!(s.server.requests().is_empty());

    s.client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_file_completes_after_create() {
    let s = setup(FakeTusServer::new(), 1024);
    let mut events = s.client.subscribe_events();

    let upload_id = s.client.upload_data(Bytes::new(), BTreeMap::new()).await.unwrap();
    drained(&mut events).await;

    let requests = s.server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].header("Upload-Length"), Some("0"));
    assert!(requests[0].header("Upload-Metadata").is_none());
    assert_eq!(s.delegate.successes(), vec![upload_id]);

    s.client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_upload_file_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    tokio::fs::write(&path, b"resumable").await.unwrap();

    let s = setup(FakeTusServer::new(), 4);
    let mut events = s.client.subscribe_events();

    let upload_id = s.client.upload_file(&path, BTreeMap::new()).await.unwrap();
    drained(&mut events).await;

    let requests = s.server.requests();
    assert_eq!(requests[0].header("Upload-Metadata"), Some("filename bm90ZXMudHh0"));
    assert_eq!(s.server.patch_bodies(), vec![4, 4, 1]);
    assert_eq!(s.server.data("/files/1").unwrap(), Bytes::from_static(b"resumable"));
    assert_eq!(s.delegate.successes(), vec![upload_id]);

    // the source file itself is left alone
    assert!(path.exists());
    s.client.shutdown().await.unwrap();
}
