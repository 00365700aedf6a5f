//! End-to-end upload scenarios against an in-memory chunk server.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chunkup_protocol::{FailCode, ProgressSnapshot};
use chunkup_transfer::{ChunkSource, ContentHasher, Md5Hasher, MemoryChunkSource, TransferError};
use chunkup_uploader::{
    EventKind, HttpRequest, HttpResponse, HttpTransport, Method, SessionState, TransportError,
    UploadError, UploadEvent, UploadOutcome, UploadSession, UploaderConfig,
};

// ---------------------------------------------------------------------------
// Mock server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    chunks: HashMap<String, BTreeMap<u64, Bytes>>,
    merged: HashMap<String, Bytes>,
    uploads: Vec<HttpRequest>,
    verify_calls: usize,
    merge_calls: usize,
}

/// Stores chunks per identifier, answers verify from what it holds and
/// concatenates chunks in index order on merge.
#[derive(Default)]
struct MockServer {
    state: Mutex<ServerState>,
    upload_delay: Duration,
    /// Status returned for uploads of one index.
    fail_index: Option<(u64, u16)>,
    /// Status returned for every other upload instead of storing it.
    upload_status: Option<u16>,
    verify_status: Option<u16>,
    merge_status: Option<u16>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct FlightGuard<'a>(&'a AtomicUsize);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockServer {
    fn upload_attempts(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    fn uploaded_indices(&self) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .uploads
            .iter()
            .map(|r| r.query_value("index").unwrap().parse().unwrap())
            .collect()
    }

    fn merged(&self, identifier: &str) -> Option<Bytes> {
        self.state.lock().unwrap().merged.get(identifier).cloned()
    }

    fn merge_calls(&self) -> usize {
        self.state.lock().unwrap().merge_calls
    }

    fn verify_calls(&self) -> usize {
        self.state.lock().unwrap().verify_calls
    }

    fn store_chunk(&self, identifier: &str, index: u64, data: Bytes) {
        self.state
            .lock()
            .unwrap()
            .chunks
            .entry(identifier.to_string())
            .or_default()
            .insert(index, data);
    }

    fn verify(&self, req: &HttpRequest) -> HttpResponse {
        let mut state = self.state.lock().unwrap();
        state.verify_calls += 1;
        if let Some(status) = self.verify_status {
            return HttpResponse::new(status, Bytes::new());
        }
        let identifier = req.query_value("identifier").unwrap();
        let body = if state.merged.contains_key(identifier) {
            r#"{"errCode":0,"needUpload":false}"#.to_string()
        } else {
            let uploaded: Vec<u64> = state
                .chunks
                .get(identifier)
                .map(|c| c.keys().copied().collect())
                .unwrap_or_default();
            format!(r#"{{"needUpload":true,"uploadedChunks":{uploaded:?}}}"#)
        };
        HttpResponse::new(200, body)
    }

    async fn upload(&self, req: HttpRequest) -> HttpResponse {
        let index: u64 = req.query_value("index").unwrap().parse().unwrap();
        let identifier = req.query_value("identifier").unwrap().to_string();
        let body = req.body.clone().unwrap_or_default();
        self.state.lock().unwrap().uploads.push(req);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = FlightGuard(&self.in_flight);
        tokio::time::sleep(self.upload_delay).await;

        if let Some((fail, status)) = self.fail_index
            && fail == index
        {
            return HttpResponse::new(status, Bytes::new());
        }
        if let Some(status) = self.upload_status {
            return HttpResponse::new(status, Bytes::new());
        }
        self.store_chunk(&identifier, index, body);
        HttpResponse::new(200, Bytes::new())
    }

    fn merge(&self, req: &HttpRequest) -> HttpResponse {
        let mut state = self.state.lock().unwrap();
        state.merge_calls += 1;
        if let Some(status) = self.merge_status {
            return HttpResponse::new(status, Bytes::new());
        }
        let identifier = req.query_value("identifier").unwrap().to_string();
        let chunks = state.chunks.remove(&identifier).unwrap_or_default();
        let mut out = BytesMut::new();
        for data in chunks.values() {
            out.extend_from_slice(data);
        }
        state.merged.insert(identifier, out.freeze());
        HttpResponse::new(200, Bytes::new())
    }
}

impl HttpTransport for MockServer {
    fn send(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let resp = match (request.method, request.url.as_str()) {
                (Method::Get, "http://chunks.test/verify") => self.verify(&request),
                (Method::Post, "http://chunks.test/upload") => self.upload(request).await,
                (Method::Get, "http://chunks.test/merge") => self.merge(&request),
                _ => HttpResponse::new(404, Bytes::new()),
            };
            Ok(resp)
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(chunk_size: u64) -> UploaderConfig {
    UploaderConfig {
        file_name: "payload.bin".into(),
        chunk_size,
        ..UploaderConfig::with_urls(
            "http://chunks.test/verify",
            "http://chunks.test/upload",
            "http://chunks.test/merge",
        )
    }
}

fn data(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5Hasher::default();
    hasher.append(data);
    hasher.finish()
}

fn session(config: UploaderConfig, data: Bytes, server: &Arc<MockServer>) -> UploadSession {
    UploadSession::new(config, Arc::new(MemoryChunkSource::new(data)), server.clone()).unwrap()
}

fn record_events(session: &UploadSession) -> Arc<Mutex<Vec<UploadEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session
        .bus()
        .subscribe_all(move |e| sink.lock().unwrap().push(e.clone()));
    seen
}

/// Events other than progress, in order.
fn lifecycle(events: &Mutex<Vec<UploadEvent>>) -> Vec<UploadEvent> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.kind() != EventKind::Progress)
        .cloned()
        .collect()
}

fn fail_code(events: &[UploadEvent]) -> Option<u32> {
    events.iter().find_map(|e| match e {
        UploadEvent::Fail(info) => Some(info.err_code.as_u32()),
        _ => None,
    })
}

/// Source that fails every read.
struct BrokenSource(u64);

impl ChunkSource for BrokenSource {
    fn size(&self) -> u64 {
        self.0
    }

    fn read_range(
        &self,
        _offset: u64,
        _length: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, TransferError>> + Send + '_>> {
        Box::pin(async { Err::<Bytes, _>(TransferError::Io(std::io::Error::other("unreadable"))) })
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn twelve_megabytes_in_three_chunks() {
    let server = Arc::new(MockServer::default());
    let payload = data(12_000_000);
    let s = session(config(5_000_000), payload.clone(), &server);
    let events = record_events(&s);

    let outcome = s.upload().await.unwrap();
    assert_eq!(outcome, UploadOutcome::Uploaded);

    let mut sizes: Vec<String> = server
        .state
        .lock()
        .unwrap()
        .uploads
        .iter()
        .map(|r| r.query_value("chunkSize").unwrap().to_string())
        .collect();
    sizes.sort();
    assert_eq!(sizes, vec!["2000000", "5000000", "5000000"]);

    let identifier = s.identifier().unwrap();
    assert_eq!(identifier, md5_hex(&payload));
    assert_eq!(server.merged(&identifier).unwrap(), payload);
    assert_eq!(
        lifecycle(&events),
        vec![UploadEvent::Success, UploadEvent::Complete]
    );
    assert_eq!(s.progress().uploaded_size, 12_000_000);
    assert_eq!(s.state(), SessionState::Succeeded);
}

#[tokio::test]
async fn chunk_query_carries_metadata() {
    let server = Arc::new(MockServer::default());
    let mut cfg = config(4);
    cfg.query.insert("token".into(), "t-1".into());
    cfg.headers.insert("x-upload-client".into(), "chunkup".into());
    let s = session(cfg, data(10), &server);

    s.upload().await.unwrap();

    let state = server.state.lock().unwrap();
    let last = state
        .uploads
        .iter()
        .find(|r| r.query_value("index") == Some("2"))
        .unwrap();
    assert_eq!(last.query_value("chunkSize"), Some("2"));
    assert_eq!(last.query_value("totalChunks"), Some("3"));
    assert_eq!(last.query_value("totalSize"), Some("10"));
    assert_eq!(last.query_value("fileName"), Some("payload.bin"));
    assert_eq!(last.query_value("token"), Some("t-1"));
    assert!(
        last.headers
            .contains(&("x-upload-client".to_string(), "chunkup".to_string()))
    );
    assert_eq!(last.body.as_ref().map(Bytes::len), Some(2));
}

#[tokio::test]
async fn verify_with_two_of_three_sends_only_the_last() {
    let server = Arc::new(MockServer::default());
    let payload = data(12);
    let identifier = md5_hex(&payload);
    server.store_chunk(&identifier, 0, payload.slice(0..5));
    server.store_chunk(&identifier, 1, payload.slice(5..10));

    let s = session(config(5), payload.clone(), &server);
    s.upload().await.unwrap();

    assert_eq!(server.uploaded_indices(), vec![2]);
    assert_eq!(server.merged(&identifier).unwrap(), payload);
    let progress = s.progress();
    assert_eq!(progress.uploaded_size, 2);
    assert_eq!(progress.percent, 100);
}

#[tokio::test]
async fn all_chunks_present_goes_straight_to_merge() {
    let server = Arc::new(MockServer::default());
    let payload = data(8);
    let identifier = md5_hex(&payload);
    server.store_chunk(&identifier, 0, payload.slice(0..4));
    server.store_chunk(&identifier, 1, payload.slice(4..8));

    let s = session(config(4), payload.clone(), &server);
    let outcome = s.upload().await.unwrap();

    assert_eq!(outcome, UploadOutcome::Uploaded);
    assert_eq!(server.upload_attempts(), 0);
    assert_eq!(server.merge_calls(), 1);
    let progress = s.progress();
    assert_eq!(progress.percent, 100);
    assert_eq!(progress.time_remaining, 0.0);
}

#[tokio::test]
async fn permanent_failure_on_last_chunk() {
    let server = Arc::new(MockServer {
        fail_index: Some((2, 500)),
        ..Default::default()
    });
    let s = session(config(5), data(12), &server);
    let events = record_events(&s);

    let err = s.upload().await.unwrap_err();
    assert!(matches!(err, UploadError::ChunkTransport { index: 2, .. }));

    let lifecycle = lifecycle(&events);
    assert_eq!(lifecycle.len(), 2);
    assert_eq!(fail_code(&lifecycle), Some(FailCode::ChunkUpload.as_u32()));
    assert_eq!(lifecycle.last(), Some(&UploadEvent::Complete));
    assert_eq!(server.merge_calls(), 0);
    assert_eq!(s.state(), SessionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_is_exact() {
    let server = Arc::new(MockServer {
        upload_status: Some(503),
        ..Default::default()
    });
    let cfg = UploaderConfig {
        max_chunk_retries: 3,
        chunk_retry_interval: Duration::from_secs(2),
        ..config(16)
    };
    let s = session(cfg, data(10), &server);
    let events = record_events(&s);

    let err = s.upload().await.unwrap_err();
    assert!(matches!(err, UploadError::ChunkTransport { index: 0, .. }));
    assert_eq!(server.upload_attempts(), 4);

    let lifecycle = lifecycle(&events);
    let retries: Vec<_> = lifecycle
        .iter()
        .filter(|e| e.kind() == EventKind::Retry)
        .collect();
    assert_eq!(retries.len(), 3);
    assert!(matches!(
        retries[0],
        UploadEvent::Retry {
            status: Some(503),
            attempt: 1,
            ..
        }
    ));
    assert_eq!(fail_code(&lifecycle), Some(20002));
}

#[tokio::test]
async fn second_upload_is_instant() {
    let server = Arc::new(MockServer::default());
    let payload = data(10);

    let first = session(config(4), payload.clone(), &server);
    first.upload().await.unwrap();
    let attempts = server.upload_attempts();
    assert_eq!(attempts, 3);

    let second = session(config(4), payload, &server);
    let events = record_events(&second);
    let outcome = second.upload().await.unwrap();

    assert_eq!(outcome, UploadOutcome::AlreadyStored);
    assert_eq!(server.upload_attempts(), attempts);
    assert_eq!(server.merge_calls(), 1);
    assert_eq!(
        lifecycle(&events),
        vec![UploadEvent::Success, UploadEvent::Complete]
    );
    assert_eq!(second.progress().percent, 100);
    assert_eq!(second.progress().time_remaining, 0.0);
}

#[tokio::test(start_paused = true)]
async fn resume_sends_only_unconfirmed_chunks() {
    let server = Arc::new(MockServer {
        upload_delay: Duration::from_millis(100),
        ..Default::default()
    });
    let payload = data(12);
    let cfg = UploaderConfig {
        max_concurrency: 1,
        ..config(3)
    };
    let s = Arc::new(session(cfg, payload.clone(), &server));

    let runner = Arc::clone(&s);
    let handle = tokio::spawn(async move { runner.upload().await });

    // Chunks 0 and 1 are confirmed at 100 ms and 200 ms; chunk 2 is in flight.
    tokio::time::sleep(Duration::from_millis(250)).await;
    s.pause();
    assert!(s.is_paused());
    assert_eq!(s.state(), SessionState::Transferring);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let confirmed = 2;
    let at_pause = server.upload_attempts();
    assert_eq!(at_pause, 3);
    assert_eq!(s.progress().uploaded_size, 6);

    s.resume();
    handle.await.unwrap().unwrap();

    let total_chunks = 4;
    assert_eq!(server.upload_attempts() - at_pause, total_chunks - confirmed);
    assert_eq!(s.progress().uploaded_size, 12);
    assert_eq!(server.merged(&s.identifier().unwrap()).unwrap(), payload);
}

#[tokio::test(start_paused = true)]
async fn concurrency_limit_holds() {
    let server = Arc::new(MockServer {
        upload_delay: Duration::from_millis(10),
        ..Default::default()
    });
    let cfg = UploaderConfig {
        max_concurrency: 3,
        max_memory: 8,
        ..config(2)
    };
    let s = session(cfg, data(40), &server);

    s.upload().await.unwrap();

    assert_eq!(server.upload_attempts(), 20);
    let peak = server.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak}");
    assert!(peak >= 2);
}

#[tokio::test]
async fn empty_file_is_merged_without_chunks() {
    let server = Arc::new(MockServer::default());
    let s = session(config(4), Bytes::new(), &server);
    let events = record_events(&s);

    let outcome = s.upload().await.unwrap();

    assert_eq!(outcome, UploadOutcome::Uploaded);
    assert_eq!(server.upload_attempts(), 0);
    assert_eq!(server.merge_calls(), 1);
    let progress = s.progress();
    assert_eq!(progress.percent, 100);
    assert_eq!(progress.time_remaining, 0.0);
    assert!(!progress.average_speed.is_nan());
    assert_eq!(
        lifecycle(&events),
        vec![UploadEvent::Success, UploadEvent::Complete]
    );
}

#[tokio::test]
async fn generated_identifier_skips_verify() {
    let server = Arc::new(MockServer::default());
    let cfg = UploaderConfig {
        test_chunks: false,
        generate_identifier: Some(Arc::new(|| "fixed-id".to_string())),
        ..config(4)
    };
    let s = session(cfg, data(10), &server);

    s.upload().await.unwrap();

    assert_eq!(server.verify_calls(), 0);
    assert_eq!(s.identifier().as_deref(), Some("fixed-id"));
    assert!(server.merged("fixed-id").is_some());
}

#[tokio::test]
async fn random_identifier_changes_per_attempt() {
    let server = Arc::new(MockServer::default());
    let cfg = UploaderConfig {
        test_chunks: false,
        ..config(4)
    };
    let s = session(cfg, data(10), &server);

    s.upload().await.unwrap();
    let first = s.identifier().unwrap();
    s.upload().await.unwrap();
    let second = s.identifier().unwrap();

    assert_eq!(first.len(), 32);
    assert_ne!(first, second);
}

#[tokio::test]
async fn identifier_failure_sends_nothing() {
    let server = Arc::new(MockServer::default());
    let s = UploadSession::new(config(4), Arc::new(BrokenSource(10)), server.clone()).unwrap();
    let events = record_events(&s);

    let err = s.upload().await.unwrap_err();

    assert!(matches!(err, UploadError::Identifier(_)));
    assert_eq!(fail_code(&lifecycle(&events)), Some(10002));
    assert_eq!(server.verify_calls(), 0);
    assert_eq!(server.upload_attempts(), 0);
}

#[tokio::test]
async fn read_failure_during_transfer_is_fatal() {
    let server = Arc::new(MockServer::default());
    let cfg = UploaderConfig {
        test_chunks: false,
        ..config(4)
    };
    let s = UploadSession::new(cfg, Arc::new(BrokenSource(10)), server.clone()).unwrap();
    let events = record_events(&s);

    let err = s.upload().await.unwrap_err();

    assert!(matches!(err, UploadError::ChunkRead { .. }));
    let lifecycle = lifecycle(&events);
    assert_eq!(fail_code(&lifecycle), Some(10001));
    assert_eq!(lifecycle.last(), Some(&UploadEvent::Complete));
    assert_eq!(server.merge_calls(), 0);
}

#[tokio::test]
async fn verify_rejection_is_fatal() {
    let server = Arc::new(MockServer {
        verify_status: Some(404),
        ..Default::default()
    });
    let s = session(config(4), data(10), &server);
    let events = record_events(&s);

    let err = s.upload().await.unwrap_err();

    assert!(matches!(err, UploadError::Verification(_)));
    assert_eq!(fail_code(&lifecycle(&events)), Some(20001));
    assert_eq!(server.upload_attempts(), 0);
}

#[tokio::test]
async fn merge_rejection_is_fatal() {
    let server = Arc::new(MockServer {
        merge_status: Some(500),
        ..Default::default()
    });
    let s = session(config(4), data(10), &server);
    let events = record_events(&s);

    let err = s.upload().await.unwrap_err();

    assert!(matches!(err, UploadError::Merge(_)));
    let lifecycle = lifecycle(&events);
    assert_eq!(fail_code(&lifecycle), Some(20003));
    assert_eq!(
        lifecycle
            .iter()
            .filter(|e| matches!(e, UploadEvent::Fail(_)))
            .count(),
        1
    );
    assert_eq!(server.upload_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_without_fail_events() {
    let server = Arc::new(MockServer {
        upload_delay: Duration::from_secs(60),
        ..Default::default()
    });
    let s = Arc::new(session(config(4), data(10), &server));
    let events = record_events(&s);

    let runner = Arc::clone(&s);
    let handle = tokio::spawn(async move { runner.upload().await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    s.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, UploadError::Cancelled));
    assert!(lifecycle(&events).is_empty());
    assert_eq!(s.state(), SessionState::Idle);
    assert!(s.identifier().is_none());
    assert_eq!(s.progress(), ProgressSnapshot::idle(10));
    assert_eq!(server.merge_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_upload_future_leaves_session_reusable() {
    let server = Arc::new(MockServer {
        upload_delay: Duration::from_secs(60),
        ..Default::default()
    });
    let payload = data(10);
    let s = session(config(4), payload.clone(), &server);

    let timed_out = tokio::time::timeout(Duration::from_secs(1), s.upload()).await;
    assert!(timed_out.is_err());
    assert_eq!(s.state(), SessionState::Idle);
    assert_eq!(s.progress(), ProgressSnapshot::idle(10));

    s.cancel();
    let outcome = s.upload().await.unwrap();

    assert_eq!(outcome, UploadOutcome::Uploaded);
    assert_eq!(s.state(), SessionState::Succeeded);
    let identifier = s.identifier().unwrap();
    assert_eq!(server.merged(&identifier).unwrap(), payload);
}

#[tokio::test(start_paused = true)]
async fn no_retry_events_after_fail_and_complete() {
    let server = Arc::new(MockServer {
        upload_delay: Duration::from_millis(10),
        fail_index: Some((0, 404)),
        upload_status: Some(503),
        ..Default::default()
    });
    let mut cfg = config(2);
    cfg.max_chunk_retries = 5;
    cfg.chunk_retry_interval = Duration::from_millis(1);
    let s = session(cfg, data(10), &server);
    let events = record_events(&s);

    let err = s.upload().await.unwrap_err();
    assert!(matches!(err, UploadError::ChunkTransport { index: 0, .. }));
    tokio::time::sleep(Duration::from_secs(5)).await;

    let lifecycle = lifecycle(&events);
    assert_eq!(lifecycle.last(), Some(&UploadEvent::Complete));
    assert_eq!(fail_code(&lifecycle), Some(20002));
}

#[tokio::test]
async fn event_channel_sees_progress_then_terminal_events() {
    let server = Arc::new(MockServer::default());
    let s = session(config(4), data(10), &server);
    let mut rx = s.events();

    s.upload().await.unwrap();
    drop(s);

    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            UploadEvent::Progress(p) => Some(p.percent),
            _ => None,
        })
        .collect();
    assert_eq!(percents.first(), Some(&0));
    assert_eq!(percents.last(), Some(&100));
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(events.last(), Some(&UploadEvent::Complete));
}
