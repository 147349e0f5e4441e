//! Chunked transfer engine: negotiate, upload, acknowledge, resume
//!
//!   - `init_upload`: reserve an upload, re-chunk at the server's size, persist
//!   - `run`: upload the unacknowledged chunks with bounded concurrency
//!   - `complete_upload` / `cancel_upload` / `pause_upload` / `fail_upload`
//!   - `reconcile` / `resume_pending` / `recover`: pick up after a restart
//!   - `sweep_expired`: drop terminal tasks past the retention horizon
//!
//! Every operation on one task holds that task's lock, so a run, a cancel
//! and a complete for the same id never interleave. Different tasks share
//! nothing but the store.

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use shc_core::config::TransferConfig;
use shc_core::types::now_millis;
use shc_core::{ChatId, FileType, ShcError, ShcResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunking;
use crate::remote::{ChunkEndpoint, InitUploadRequest, ProgressFn};
use crate::store::TransferStore;
use crate::task::{TransferEvent, TransferTask, UploadStatus};
use crate::MessageId;

const EVENT_CAPACITY: usize = 256;

/// Tuning knobs, normally taken from `[transfer]` in the config file.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub proposed_chunk_size: u64,
    pub request_timeout: Duration,
    /// Retries per chunk after the first attempt
    pub chunk_retries: u32,
    /// Delay before retry `n` is `retry_backoff * n`
    pub retry_backoff: Duration,
    pub retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for EngineConfig {
    fn from(cfg: &TransferConfig) -> Self {
        Self {
            concurrency: cfg.concurrency.max(1),
            proposed_chunk_size: cfg.proposed_chunk_size,
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
            chunk_retries: cfg.chunk_retries,
            retry_backoff: Duration::from_millis(500),
            retention: Duration::from_secs(cfg.retention_hours * 3600),
        }
    }
}

/// An encrypted payload ready to be uploaded.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub chat_id: ChatId,
    pub file_name: String,
    pub file_type: FileType,
    /// Encrypted metadata envelope
    pub metadata: String,
    /// Plaintext size
    pub total_size: u64,
    /// Encrypted bytes
    pub payload: Bytes,
}

/// How a call to [`TransferEngine::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { message_id: MessageId },
    /// Stopped with chunks outstanding; `run` again to continue.
    Paused { remaining: usize },
    Failed { reason: String },
    Cancelled,
}

/// Startup bookkeeping from [`TransferEngine::recover`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub swept: usize,
    /// Non-terminal tasks ready for `run`
    pub resumable: Vec<String>,
    /// Tasks that could not be reconciled and were marked failed
    pub failed: Vec<String>,
}

struct ActiveRun {
    token: CancellationToken,
    cancelled: Arc<AtomicBool>,
}

enum ChunkError {
    Stopped,
    /// Retries exhausted
    Exhausted(ShcError),
    Fatal(ShcError),
}

pub struct TransferEngine<E: ChunkEndpoint> {
    endpoint: Arc<E>,
    store: Arc<dyn TransferStore>,
    config: EngineConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    runs: Mutex<HashMap<String, ActiveRun>>,
    events: broadcast::Sender<TransferEvent>,
}

impl<E: ChunkEndpoint> TransferEngine<E> {
    pub fn new(endpoint: Arc<E>, store: Arc<dyn TransferStore>, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            endpoint,
            store,
            config,
            locks: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub fn task(&self, id: &str) -> ShcResult<Option<TransferTask>> {
        self.store.get_task(id)
    }

    pub fn tasks(&self) -> ShcResult<Vec<TransferTask>> {
        self.store.list_tasks()
    }

    pub fn tasks_for_chat(&self, chat_id: ChatId) -> ShcResult<Vec<TransferTask>> {
        self.store.tasks_for_chat(chat_id)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Reserve a server upload and persist the payload as chunks of the
    /// size the server chose. Returns the new task in `Pending`.
    ///
    /// If the local store rejects the task the reservation is released and
    /// a `Persistence` error is returned; nothing is left behind.
    pub async fn init_upload(&self, upload: NewUpload) -> ShcResult<TransferTask> {
        let encrypted_size = upload.payload.len() as u64;
        let proposed = self.config.proposed_chunk_size;
        let request = InitUploadRequest {
            chat_id: upload.chat_id,
            file_name: upload.file_name.clone(),
            file_type: upload.file_type,
            file_size: encrypted_size,
            total_size: upload.total_size,
            total_chunks: chunking::chunk_count(encrypted_size, proposed)?,
            chunk_size: proposed,
            metadata: upload.metadata.clone(),
        };
        let reply = self.endpoint.init_upload(&request).await?;
        if reply.chunk_size == 0 {
            self.release_remote(&reply.upload_id).await;
            return Err(ShcError::Transport(
                "server negotiated a zero chunk size".into(),
            ));
        }
        if reply.chunk_size != proposed {
            debug!(
                upload_id = %reply.upload_id,
                proposed,
                negotiated = reply.chunk_size,
                "server overrode chunk size, re-chunking"
            );
        }

        let chunks = match chunking::split(&upload.payload, reply.chunk_size) {
            Ok(chunks) => chunks,
            Err(e) => {
                self.release_remote(&reply.upload_id).await;
                return Err(e);
            }
        };
        let task = TransferTask {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: upload.chat_id,
            file_name: upload.file_name,
            file_type: upload.file_type,
            metadata: upload.metadata,
            total_size: upload.total_size,
            encrypted_size,
            chunk_size: reply.chunk_size,
            total_chunks: chunks.len() as u32,
            uploaded_chunks: BTreeSet::new(),
            server_upload_id: Some(reply.upload_id.clone()),
            created_at: now_millis(),
            status: UploadStatus::Pending,
            last_error: None,
        };

        if let Err(e) = self.persist_new(&task, &chunks) {
            warn!(task_id = %task.id, error = %e, "could not persist new upload, releasing reservation");
            if let Err(cleanup) = self.store.delete_task(&task.id) {
                debug!(task_id = %task.id, error = %cleanup, "partial task cleanup failed");
            }
            self.release_remote(&reply.upload_id).await;
            return Err(e);
        }

        info!(
            task_id = %task.id,
            chat_id = task.chat_id,
            upload_id = %reply.upload_id,
            chunks = task.total_chunks,
            chunk_size = task.chunk_size,
            "upload initialised"
        );
        self.emit(TransferEvent::StatusChanged {
            task_id: task.id.clone(),
            status: UploadStatus::Pending,
        });
        Ok(task)
    }

    fn persist_new(&self, task: &TransferTask, chunks: &[Bytes]) -> ShcResult<()> {
        for (index, chunk) in chunks.iter().enumerate() {
            self.store.put_chunk(&task.id, index as u32, chunk)?;
        }
        self.store.put_task(task)
    }

    /// Upload one chunk and persist its acknowledgment before returning.
    pub async fn upload_chunk(&self, task_id: &str, index: u32) -> ShcResult<TransferTask> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load(task_id)?;
        if task.status.is_terminal() {
            return Err(ShcError::Contract(format!(
                "task {task_id} is {}, cannot upload chunks",
                task.status
            )));
        }
        if index >= task.total_chunks {
            return Err(ShcError::Contract(format!(
                "chunk index {index} out of range (total {})",
                task.total_chunks
            )));
        }
        let upload_id = upload_id_of(&task)?;
        if task.status == UploadStatus::Pending {
            self.set_status(task_id, UploadStatus::Uploading, None)?;
        }
        self.send_chunk(task_id, &upload_id, index).await?;
        self.record_ack(task_id, index)
    }

    /// Upload every unacknowledged chunk, then complete the upload if the
    /// set is full.
    ///
    /// Chunk failures are retried up to `chunk_retries` times; a chunk that
    /// still fails leaves the task `Paused` with `last_error` set. Missing
    /// chunk data fails the task.
    pub async fn run(&self, task_id: &str) -> ShcResult<RunOutcome> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load(task_id)?;
        if task.status.is_terminal() {
            return Err(ShcError::Contract(format!(
                "task {task_id} is already {}",
                task.status
            )));
        }
        let upload_id = upload_id_of(&task)?;

        let (token, cancelled) = self.register_run(task_id);
        let result = self.drive(task, &upload_id, &token, &cancelled).await;
        self.unregister_run(task_id);
        result
    }

    async fn drive(
        &self,
        task: TransferTask,
        upload_id: &str,
        token: &CancellationToken,
        cancelled: &AtomicBool,
    ) -> ShcResult<RunOutcome> {
        let task_id = task.id.as_str();
        let task = self.set_status(task_id, UploadStatus::Uploading, None)?;
        let remaining = task.remaining();
        let total_chunks = task.total_chunks;
        let mut acked = task.uploaded_chunks.clone();
        info!(task_id, remaining = remaining.len(), total_chunks, "upload running");

        let mut results = stream::iter(remaining)
            .map(|index| async move {
                (index, self.upload_with_retries(task_id, upload_id, index, token).await)
            })
            .buffer_unordered(self.config.concurrency);

        let mut stopped = false;
        let mut last_error: Option<String> = None;
        let mut fatal: Option<String> = None;
        while let Some((index, result)) = results.next().await {
            match result {
                Ok(()) => match self.record_ack(task_id, index) {
                    Ok(updated) => acked = updated.uploaded_chunks,
                    Err(e) => {
                        warn!(task_id, index, error = %e, "ack not persisted, continuing in memory");
                        self.emit(TransferEvent::PersistenceDegraded {
                            task_id: task_id.to_owned(),
                            reason: e.to_string(),
                        });
                        acked.insert(index);
                    }
                },
                Err(ChunkError::Stopped) => stopped = true,
                Err(ChunkError::Exhausted(e)) => last_error = Some(e.to_string()),
                Err(ChunkError::Fatal(e)) => {
                    fatal = Some(e.to_string());
                    token.cancel();
                }
            }
        }
        drop(results);

        if cancelled.load(Ordering::SeqCst) {
            debug!(task_id, "run interrupted by cancel");
            return Ok(RunOutcome::Cancelled);
        }
        if let Some(reason) = fatal {
            self.set_status(task_id, UploadStatus::Failed, Some(reason.clone()))?;
            return Ok(RunOutcome::Failed { reason });
        }

        let outstanding = (total_chunks as usize).saturating_sub(acked.len());
        if !stopped && outstanding == 0 {
            return match self.finish(task_id, upload_id).await {
                Ok(message_id) => Ok(RunOutcome::Completed { message_id }),
                Err(e) if e.is_retryable() => {
                    warn!(task_id, error = %e, "completion failed, pausing");
                    self.set_status(task_id, UploadStatus::Paused, Some(e.to_string()))?;
                    Ok(RunOutcome::Paused { remaining: 0 })
                }
                Err(e) => Err(e),
            };
        }

        self.set_status(task_id, UploadStatus::Paused, last_error)?;
        Ok(RunOutcome::Paused {
            remaining: outstanding,
        })
    }

    async fn upload_with_retries(
        &self,
        task_id: &str,
        upload_id: &str,
        index: u32,
        token: &CancellationToken,
    ) -> Result<(), ChunkError> {
        let attempts = self.config.chunk_retries + 1;
        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ChunkError::Stopped),
                r = self.send_chunk(task_id, upload_id, index) => r,
            };
            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            self.emit(TransferEvent::ChunkFailed {
                task_id: task_id.to_owned(),
                index,
                attempt,
                reason: err.to_string(),
            });
            if !err.is_retryable() {
                warn!(task_id, index, error = %err, "chunk cannot be uploaded");
                return Err(ChunkError::Fatal(err));
            }
            if attempt == attempts {
                warn!(task_id, index, attempt, error = %err, "chunk retries exhausted");
                return Err(ChunkError::Exhausted(err));
            }
            debug!(task_id, index, attempt, error = %err, "chunk failed, retrying");
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ChunkError::Stopped),
                _ = tokio::time::sleep(self.config.retry_backoff * attempt) => {}
            }
        }
        Err(ChunkError::Stopped)
    }

    /// One bounded request for one chunk. A timeout is a retryable chunk failure.
    async fn send_chunk(&self, task_id: &str, upload_id: &str, index: u32) -> ShcResult<()> {
        let data = self.store.get_chunk(task_id, index)?.ok_or_else(|| {
            ShcError::Persistence(format!("chunk {index} of task {task_id} missing from store"))
        })?;

        let events = self.events.clone();
        let progress_task = task_id.to_owned();
        let progress: ProgressFn = Arc::new(move |sent, total| {
            let _ = events.send(TransferEvent::ChunkProgress {
                task_id: progress_task.clone(),
                index,
                sent,
                total,
            });
        });

        let request = self
            .endpoint
            .upload_chunk(upload_id, index, data, Some(progress));
        match tokio::time::timeout(self.config.request_timeout, request).await {
            Ok(Ok(_ack)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ShcError::ChunkUpload {
                index,
                reason: format!("timed out after {:?}", self.config.request_timeout),
            }),
        }
    }

    fn record_ack(&self, task_id: &str, index: u32) -> ShcResult<TransferTask> {
        let task = self
            .store
            .update_task(task_id, &mut |t| t.acknowledge(index).map(drop))?;
        debug!(
            task_id,
            index,
            acknowledged = task.uploaded_chunks.len(),
            total = task.total_chunks,
            "chunk acknowledged"
        );
        self.emit(TransferEvent::ChunkAcknowledged {
            task_id: task_id.to_owned(),
            index,
            acknowledged: task.uploaded_chunks.len() as u32,
            total_chunks: task.total_chunks,
        });
        Ok(task)
    }

    /// Ask the server to assemble the upload. Only valid once every chunk
    /// index is acknowledged; anything earlier is a `Contract` error.
    pub async fn complete_upload(&self, task_id: &str) -> ShcResult<MessageId> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load(task_id)?;
        if task.status.is_terminal() {
            return Err(ShcError::Contract(format!(
                "task {task_id} is already {}",
                task.status
            )));
        }
        if !task.is_fully_acknowledged() {
            return Err(ShcError::Contract(format!(
                "task {task_id}: {} of {} chunks still unacknowledged",
                task.remaining().len(),
                task.total_chunks
            )));
        }
        let upload_id = upload_id_of(&task)?;
        self.finish(task_id, &upload_id).await
    }

    /// Caller holds the task lock.
    async fn finish(&self, task_id: &str, upload_id: &str) -> ShcResult<MessageId> {
        let reply = self.endpoint.complete(upload_id).await?;
        let message_id = reply.message_id;

        let stored = self.store.update_task(task_id, &mut |t| {
            if t.status == UploadStatus::Pending {
                t.transition(UploadStatus::Uploading)?;
            }
            t.transition(UploadStatus::Completed)?;
            t.last_error = None;
            Ok(())
        });
        if let Err(e) = stored {
            warn!(task_id, error = %e, "completed upload not recorded locally");
            self.emit(TransferEvent::PersistenceDegraded {
                task_id: task_id.to_owned(),
                reason: e.to_string(),
            });
        }
        match self.store.delete_chunks(task_id) {
            Ok(released) => debug!(task_id, released, "chunk data released"),
            Err(e) => warn!(task_id, error = %e, "could not release chunk data"),
        }

        info!(task_id, message_id, "upload completed");
        self.emit(TransferEvent::StatusChanged {
            task_id: task_id.to_owned(),
            status: UploadStatus::Completed,
        });
        self.emit(TransferEvent::Completed {
            task_id: task_id.to_owned(),
            message_id,
        });
        Ok(message_id)
    }

    /// Abort in-flight chunks, release the server reservation and purge the
    /// task and its chunks. A failed remote cancel is logged, not returned.
    pub async fn cancel_upload(&self, task_id: &str) -> ShcResult<()> {
        self.signal_stop(task_id, true);
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load(task_id)?;
        if task.status != UploadStatus::Completed {
            if let Some(upload_id) = &task.server_upload_id {
                self.release_remote(upload_id).await;
            }
        }
        self.store.delete_task(task_id)?;
        self.forget_lock(task_id, &lock);

        info!(task_id, "upload cancelled");
        self.emit(TransferEvent::Cancelled {
            task_id: task_id.to_owned(),
        });
        Ok(())
    }

    /// Stop in-flight work, leaving the task `Paused`.
    pub async fn pause_upload(&self, task_id: &str) -> ShcResult<TransferTask> {
        self.signal_stop(task_id, false);
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load(task_id)?;
        match task.status {
            UploadStatus::Uploading => self.set_status(task_id, UploadStatus::Paused, None),
            UploadStatus::Pending | UploadStatus::Paused => Ok(task),
            status => Err(ShcError::Contract(format!(
                "task {task_id} is {status}, cannot pause"
            ))),
        }
    }

    /// Stop in-flight work and mark the task `Failed`. Chunk data is kept
    /// until the retention sweep.
    pub async fn fail_upload(&self, task_id: &str, reason: &str) -> ShcResult<TransferTask> {
        self.signal_stop(task_id, false);
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;
        self.set_status(task_id, UploadStatus::Failed, Some(reason.to_owned()))
    }

    // ── Restart handling ────────────────────────────────────────────────────

    /// Bring one persisted task back to a runnable state after a restart.
    ///
    /// An `Uploading` task (interrupted mid-run) becomes `Paused`. With
    /// `check_remote`, the server's received set replaces the local one and
    /// a disagreement on the chunk count or a vanished reservation fails the
    /// task. A task whose outstanding chunks have no local data also fails.
    pub async fn reconcile(&self, task_id: &str, check_remote: bool) -> ShcResult<TransferTask> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let mut task = self.load(task_id)?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        if task.status == UploadStatus::Uploading {
            task = self.set_status(task_id, UploadStatus::Paused, None)?;
        }

        if check_remote {
            if let Some(upload_id) = task.server_upload_id.clone() {
                match self.endpoint.status(&upload_id).await {
                    Ok(remote) if remote.total_chunks != task.total_chunks => {
                        let reason = format!(
                            "server expects {} chunks, local task has {}",
                            remote.total_chunks, task.total_chunks
                        );
                        return self.set_status(task_id, UploadStatus::Failed, Some(reason));
                    }
                    Ok(remote) => {
                        let server_set: BTreeSet<u32> = remote
                            .uploaded_chunks
                            .into_iter()
                            .filter(|i| *i < task.total_chunks)
                            .collect();
                        if server_set != task.uploaded_chunks {
                            debug!(
                                task_id,
                                local = task.uploaded_chunks.len(),
                                remote = server_set.len(),
                                "adopting server acknowledgment set"
                            );
                            task = self.store.update_task(task_id, &mut |t| {
                                t.uploaded_chunks = server_set.clone();
                                Ok(())
                            })?;
                        }
                    }
                    Err(ShcError::NotFound(_)) => {
                        return self.set_status(
                            task_id,
                            UploadStatus::Failed,
                            Some("server no longer holds the upload".into()),
                        );
                    }
                    Err(e) => {
                        warn!(task_id, error = %e, "remote status unavailable, trusting local state");
                    }
                }
            }
        }

        let stored: BTreeSet<u32> = self.store.chunk_indexes(task_id)?.into_iter().collect();
        let missing = task
            .remaining()
            .into_iter()
            .filter(|i| !stored.contains(i))
            .count();
        if missing > 0 {
            let reason = format!("{missing} outstanding chunks have no local data");
            return self.set_status(task_id, UploadStatus::Failed, Some(reason));
        }
        Ok(task)
    }

    /// Reconcile and run every non-terminal task, one after another.
    pub async fn resume_pending(
        &self,
        check_remote: bool,
    ) -> ShcResult<Vec<(String, ShcResult<RunOutcome>)>> {
        let mut results = Vec::new();
        for task in self.store.list_tasks()? {
            if task.status.is_terminal() {
                continue;
            }
            let outcome = match self.reconcile(&task.id, check_remote).await {
                Ok(t) if t.status.is_terminal() => Ok(RunOutcome::Failed {
                    reason: t.last_error.unwrap_or_default(),
                }),
                Ok(_) => self.run(&task.id).await,
                Err(e) => Err(e),
            };
            results.push((task.id, outcome));
        }
        Ok(results)
    }

    /// Purge terminal tasks created more than the retention horizon before
    /// `now_ms`, chunks included.
    pub async fn sweep_expired(&self, now_ms: u64) -> ShcResult<usize> {
        let retention_ms = self.config.retention.as_millis() as u64;
        let mut swept = 0;
        for task in self.store.list_tasks()? {
            if !task.is_expired(now_ms, retention_ms) {
                continue;
            }
            let lock = self.task_lock(&task.id);
            let _guard = lock.lock().await;
            self.store.delete_task(&task.id)?;
            self.forget_lock(&task.id, &lock);
            debug!(task_id = %task.id, status = %task.status, "expired task swept");
            swept += 1;
        }
        if swept > 0 {
            info!(swept, "retention sweep");
        }
        Ok(swept)
    }

    /// Startup pass: sweep, then reconcile everything left.
    pub async fn recover(&self, check_remote: bool) -> ShcResult<RecoveryReport> {
        let mut report = RecoveryReport {
            swept: self.sweep_expired(now_millis()).await?,
            ..Default::default()
        };
        for task in self.store.list_tasks()? {
            if task.status.is_terminal() {
                continue;
            }
            let task = self.reconcile(&task.id, check_remote).await?;
            if task.status.is_terminal() {
                report.failed.push(task.id);
            } else {
                report.resumable.push(task.id);
            }
        }
        Ok(report)
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn load(&self, task_id: &str) -> ShcResult<TransferTask> {
        self.store
            .get_task(task_id)?
            .ok_or_else(|| ShcError::NotFound(format!("transfer task {task_id}")))
    }

    fn set_status(
        &self,
        task_id: &str,
        status: UploadStatus,
        last_error: Option<String>,
    ) -> ShcResult<TransferTask> {
        let mut previous = status;
        let task = self.store.update_task(task_id, &mut |t| {
            previous = t.status;
            t.transition(status)?;
            if last_error.is_some() || status == UploadStatus::Uploading {
                t.last_error = last_error.clone();
            }
            Ok(())
        })?;
        if previous != status {
            debug!(task_id, from = %previous, to = %status, "status changed");
            self.emit(TransferEvent::StatusChanged {
                task_id: task_id.to_owned(),
                status,
            });
        }
        Ok(task)
    }

    async fn release_remote(&self, upload_id: &str) {
        if let Err(e) = self.endpoint.cancel(upload_id).await {
            warn!(upload_id, error = %e, "could not release server reservation");
        }
    }

    fn emit(&self, event: TransferEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn task_lock(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(task_id.to_owned()).or_default().clone()
    }

    /// Drop the map entry for a deleted task, unless someone is already
    /// queued on `held`: a fresh mutex handed out while a waiter still holds
    /// the old one would let the two overlap. A kept entry is removed by the
    /// next forget.
    fn forget_lock(&self, task_id: &str, held: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let idle = locks
            .get(task_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, held) && Arc::strong_count(entry) == 2);
        if idle {
            locks.remove(task_id);
        }
    }

    fn register_run(&self, task_id: &str) -> (CancellationToken, Arc<AtomicBool>) {
        let token = CancellationToken::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.insert(
            task_id.to_owned(),
            ActiveRun {
                token: token.clone(),
                cancelled: cancelled.clone(),
            },
        );
        (token, cancelled)
    }

    fn unregister_run(&self, task_id: &str) {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.remove(task_id);
    }

    fn signal_stop(&self, task_id: &str, cancel: bool) {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(run) = runs.get(task_id) {
            if cancel {
                run.cancelled.store(true, Ordering::SeqCst);
            }
            run.token.cancel();
        }
    }
}

fn upload_id_of(task: &TransferTask) -> ShcResult<String> {
    task.server_upload_id
        .clone()
        .ok_or_else(|| ShcError::Contract(format!("task {} has no server upload id", task.id)))
}
