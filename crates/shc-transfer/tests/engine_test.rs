//! Integration tests for the transfer engine over the in-memory endpoint.
//!
//! Restarts are simulated by dropping the engine and opening a new one on
//! the same store directory.

use bytes::Bytes;
use shc_core::{FileType, ShcError, ShcResult};
use shc_transfer::store::TaskUpdate;
use shc_transfer::{
    ChunkEndpoint, EngineConfig, FileTransferStore, MemoryChunkEndpoint, NewUpload, RunOutcome,
    TransferEngine, TransferEvent, TransferStore, TransferTask, UploadStatus,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const HOUR_MS: u64 = 60 * 60 * 1000;

fn config() -> EngineConfig {
    EngineConfig {
        concurrency: 3,
        proposed_chunk_size: 10,
        request_timeout: Duration::from_secs(5),
        chunk_retries: 2,
        retry_backoff: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

fn open_engine(
    dir: &Path,
    endpoint: &MemoryChunkEndpoint,
    config: EngineConfig,
) -> TransferEngine<MemoryChunkEndpoint> {
    let store = Arc::new(FileTransferStore::open(dir).unwrap());
    TransferEngine::new(Arc::new(endpoint.clone()), store, config)
}

fn payload(len: usize) -> NewUpload {
    NewUpload {
        chat_id: 42,
        file_name: "report.pdf".into(),
        file_type: FileType::File,
        metadata: "aXY=.bWV0YQ==".into(),
        total_size: len as u64,
        payload: Bytes::from((0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<_>>()),
    }
}

fn indexes_sent(endpoint: &MemoryChunkEndpoint) -> Vec<u32> {
    let mut sent: Vec<u32> = endpoint.received().into_iter().map(|(_, i)| i).collect();
    sent.sort_unstable();
    sent
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn resume_after_restart_uploads_only_missing_chunks() {
    let tmp = TempDir::new().unwrap();
    let endpoint = MemoryChunkEndpoint::new();

    let task_id = {
        let engine = open_engine(tmp.path(), &endpoint, config());
        let task = engine.init_upload(payload(50)).await.unwrap();
        assert_eq!(task.total_chunks, 5);
        for index in [0, 2, 4] {
            engine.upload_chunk(&task.id, index).await.unwrap();
        }
        task.id
    };

    endpoint.clear_received();
    let engine = open_engine(tmp.path(), &endpoint, config());
    let report = engine.recover(false).await.unwrap();
    assert_eq!(report.resumable, vec![task_id.clone()]);

    let restored = engine.task(&task_id).unwrap().unwrap();
    assert_eq!(restored.status, UploadStatus::Paused);
    assert_eq!(restored.remaining(), vec![1, 3]);

    let outcome = engine.run(&task_id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(indexes_sent(&endpoint), vec![1, 3]);
}

#[tokio::test]
async fn out_of_order_acks_complete_by_set_membership() {
    let tmp = TempDir::new().unwrap();
    let endpoint = MemoryChunkEndpoint::new();
    let engine = open_engine(tmp.path(), &endpoint, config());
    let new = payload(40);
    let expected = new.payload.clone();
    let task = engine.init_upload(new).await.unwrap();

    for index in [3, 0, 3, 2, 1] {
        engine.upload_chunk(&task.id, index).await.unwrap();
    }
    let message_id = engine.complete_upload(&task.id).await.unwrap();
    assert_eq!(message_id, 1000);

    let upload_id = task.server_upload_id.unwrap();
    assert_eq!(endpoint.assembled(&upload_id).unwrap(), expected.to_vec());
}

#[tokio::test]
async fn early_complete_is_a_contract_violation() {
    let tmp = TempDir::new().unwrap();
    let endpoint = MemoryChunkEndpoint::new();
    let engine = open_engine(tmp.path(), &endpoint, config());
    let task = engine.init_upload(payload(30)).await.unwrap();
    engine.upload_chunk(&task.id, 0).await.unwrap();

    let err = engine.complete_upload(&task.id).await.unwrap_err();
    assert!(matches!(err, ShcError::Contract(_)), "got {err:?}");
    let task = engine.task(&task.id).unwrap().unwrap();
    assert_eq!(task.status, UploadStatus::Uploading);
}

#[tokio::test]
async fn cancel_leaves_no_records() {
    let tmp = TempDir::new().unwrap();
    let endpoint = MemoryChunkEndpoint::new();
    let engine = open_engine(tmp.path(), &endpoint, config());
    let task = engine.init_upload(payload(30)).await.unwrap();
    engine.upload_chunk(&task.id, 1).await.unwrap();

    engine.cancel_upload(&task.id).await.unwrap();

    let store = FileTransferStore::open(tmp.path()).unwrap();
    assert!(store.get_task(&task.id).unwrap().is_none());
    assert!(store.chunk_indexes(&task.id).unwrap().is_empty());
    assert!(endpoint.is_cancelled(task.server_upload_id.as_deref().unwrap()));
    assert!(matches!(
        engine.cancel_upload(&task.id).await,
        Err(ShcError::NotFound(_))
    ));
}

#[tokio::test]
async fn cancel_aborts_an_in_flight_run() {
    let tmp = TempDir::new().unwrap();
    let endpoint = MemoryChunkEndpoint::new();
    let engine = Arc::new(open_engine(tmp.path(), &endpoint, config()));
    let task = engine.init_upload(payload(30)).await.unwrap();
    endpoint.hang_chunk(1, 1);

    let mut events = engine.subscribe();
    let run = tokio::spawn({
        let engine = engine.clone();
        let id = task.id.clone();
        async move { engine.run(&id).await }
    });

    // Wait until the other two chunks are in so the run is parked on chunk 1
    let mut acked = 0;
    while acked < 2 {
        if let Ok(TransferEvent::ChunkAcknowledged { .. }) = events.recv().await {
            acked += 1;
        }
    }
    engine.cancel_upload(&task.id).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert!(engine.task(&task.id).unwrap().is_none());
}

#[tokio::test]
async fn server_chunk_size_overrides_proposal() {
    let tmp = TempDir::new().unwrap();
    let endpoint = MemoryChunkEndpoint::new().with_chunk_size(7);
    let engine = open_engine(tmp.path(), &endpoint, config());
    let new = payload(50);
    let expected = new.payload.clone();

    let task = engine.init_upload(new).await.unwrap();
    assert_eq!(task.chunk_size, 7);
    assert_eq!(task.total_chunks, 8);

    let outcome = engine.run(&task.id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    let upload_id = task.server_upload_id.unwrap();
    assert_eq!(endpoint.assembled(&upload_id).unwrap(), expected.to_vec());
}

#[tokio::test]
async fn exhausted_retries_pause_then_resume() {
    let tmp = TempDir::new().unwrap();
    let endpoint = MemoryChunkEndpoint::new();
    let engine = open_engine(tmp.path(), &endpoint, config());
    let task = engine.init_upload(payload(30)).await.unwrap();
    let mut events = engine.subscribe();

    // chunk_retries = 2: three attempts, all fail
    endpoint.fail_chunk(1, 3);
    let outcome = engine.run(&task.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Paused { remaining: 1 });

    let paused = engine.task(&task.id).unwrap().unwrap();
    assert_eq!(paused.status, UploadStatus::Paused);
    assert!(paused.last_error.unwrap().contains("injected failure"));
    let attempts: Vec<u32> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            TransferEvent::ChunkFailed { index: 1, attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let outcome = engine.run(&task.id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert!(engine.task(&task.id).unwrap().unwrap().last_error.is_none());
}

#[tokio::test]
async fn hung_chunk_times_out_and_is_retried() {
    let tmp = TempDir::new().unwrap();
    let endpoint = MemoryChunkEndpoint::new();
    let engine = open_engine(
        tmp.path(),
        &endpoint,
        EngineConfig {
            request_timeout: Duration::from_millis(50),
            ..config()
        },
    );
    let task = engine.init_upload(payload(20)).await.unwrap();
    let mut events = engine.subscribe();
    endpoint.hang_chunk(0, 1);

    let outcome = engine.run(&task.id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        TransferEvent::ChunkFailed { index: 0, reason, .. } if reason.contains("timed out")
    )));
}

#[tokio::test]
async fn reconcile_adopts_server_state() {
    let tmp = TempDir::new().unwrap();
    let endpoint = MemoryChunkEndpoint::new();
    let engine = open_engine(tmp.path(), &endpoint, config());
    let task = engine.init_upload(payload(30)).await.unwrap();
    let upload_id = task.server_upload_id.clone().unwrap();

    // Server took chunk 2 but the ack never reached the store
    let store = FileTransferStore::open(tmp.path()).unwrap();
    let chunk = store.get_chunk(&task.id, 2).unwrap().unwrap();
    endpoint.upload_chunk(&upload_id, 2, chunk, None).await.unwrap();

    let reconciled = engine.reconcile(&task.id, true).await.unwrap();
    assert_eq!(reconciled.remaining(), vec![0, 1]);

    endpoint.cancel(&upload_id).await.unwrap();
    let gone = engine.reconcile(&task.id, true).await.unwrap();
    assert_eq!(gone.status, UploadStatus::Failed);
}

#[tokio::test]
async fn sweep_purges_only_expired_terminal_tasks() {
    let tmp = TempDir::new().unwrap();
    let endpoint = MemoryChunkEndpoint::new();
    let engine = open_engine(tmp.path(), &endpoint, config());

    let done = engine.init_upload(payload(10)).await.unwrap();
    engine.run(&done.id).await.unwrap();
    let failed = engine.init_upload(payload(10)).await.unwrap();
    engine.fail_upload(&failed.id, "disk gone").await.unwrap();
    let live = engine.init_upload(payload(10)).await.unwrap();

    let now = done.created_at;
    assert_eq!(engine.sweep_expired(now + HOUR_MS).await.unwrap(), 0);
    assert_eq!(engine.sweep_expired(now + 25 * HOUR_MS).await.unwrap(), 2);

    let left: Vec<String> = engine.tasks().unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(left, vec![live.id]);
    let store = FileTransferStore::open(tmp.path()).unwrap();
    assert!(store.chunk_indexes(&failed.id).unwrap().is_empty());
}

// ── Store failure injection ─────────────────────────────────────────────────

/// File store whose task writes can be made to fail on demand.
struct FlakyStore {
    inner: FileTransferStore,
    fail_puts: AtomicBool,
    /// Updates still allowed before every further one fails; negative is unlimited
    updates_left: AtomicI64,
}

impl FlakyStore {
    fn broken() -> ShcError {
        ShcError::Persistence("disk unavailable".into())
    }
}

impl TransferStore for FlakyStore {
    fn put_task(&self, task: &TransferTask) -> ShcResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(Self::broken());
        }
        self.inner.put_task(task)
    }
    fn get_task(&self, id: &str) -> ShcResult<Option<TransferTask>> {
        self.inner.get_task(id)
    }
    fn update_task(&self, id: &str, update: TaskUpdate<'_>) -> ShcResult<TransferTask> {
        if self.updates_left.load(Ordering::SeqCst) == 0 {
            return Err(Self::broken());
        }
        self.updates_left.fetch_sub(1, Ordering::SeqCst);
        self.inner.update_task(id, update)
    }
    fn delete_task(&self, id: &str) -> ShcResult<()> {
        self.inner.delete_task(id)
    }
    fn list_tasks(&self) -> ShcResult<Vec<TransferTask>> {
        self.inner.list_tasks()
    }
    fn put_chunk(&self, task_id: &str, index: u32, data: &[u8]) -> ShcResult<()> {
        self.inner.put_chunk(task_id, index, data)
    }
    fn get_chunk(&self, task_id: &str, index: u32) -> ShcResult<Option<Bytes>> {
        self.inner.get_chunk(task_id, index)
    }
    fn delete_chunks(&self, task_id: &str) -> ShcResult<usize> {
        self.inner.delete_chunks(task_id)
    }
    fn chunk_indexes(&self, task_id: &str) -> ShcResult<Vec<u32>> {
        self.inner.chunk_indexes(task_id)
    }
}

fn flaky_engine(
    tmp: &TempDir,
    endpoint: &MemoryChunkEndpoint,
) -> (Arc<FlakyStore>, TransferEngine<MemoryChunkEndpoint>) {
    let store = Arc::new(FlakyStore {
        inner: FileTransferStore::open(tmp.path()).unwrap(),
        fail_puts: AtomicBool::new(false),
        updates_left: AtomicI64::new(-1),
    });
    let engine = TransferEngine::new(Arc::new(endpoint.clone()), store.clone(), config());
    (store, engine)
}

#[tokio::test]
async fn init_persistence_failure_releases_reservation() {
    let tmp = TempDir::new().unwrap();
    let endpoint = MemoryChunkEndpoint::new();
    let (store, engine) = flaky_engine(&tmp, &endpoint);
    store.fail_puts.store(true, Ordering::SeqCst);

    let err = engine.init_upload(payload(30)).await.unwrap_err();
    assert!(matches!(err, ShcError::Persistence(_)));
    let ids = endpoint.upload_ids();
    assert_eq!(ids.len(), 1);
    assert!(endpoint.is_cancelled(&ids[0]));
    assert!(engine.tasks().unwrap().is_empty());
}

#[tokio::test]
async fn ack_persistence_failure_degrades_but_completes() {
    let tmp = TempDir::new().unwrap();
    let endpoint = MemoryChunkEndpoint::new();
    let (store, engine) = flaky_engine(&tmp, &endpoint);
    let task = engine.init_upload(payload(30)).await.unwrap();
    let mut events = engine.subscribe();

    // The move to Uploading succeeds; every ack after it fails to persist
    store.updates_left.store(1, Ordering::SeqCst);
    let outcome = engine.run(&task.id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));

    let events = drain(&mut events);
    let degraded = events
        .iter()
        .filter(|e| matches!(e, TransferEvent::PersistenceDegraded { .. }))
        .count();
    // Three acks plus the final status write
    assert_eq!(degraded, 4);

    // The store never saw the acks; the next attempt reports the failure
    // as persistence, not as a network problem
    let stale = engine.task(&task.id).unwrap().unwrap();
    assert!(stale.uploaded_chunks.is_empty());
    let err = engine.fail_upload(&task.id, "x").await.unwrap_err();
    assert!(matches!(err, ShcError::Persistence(_)));
    assert!(!err.is_retryable());
}
