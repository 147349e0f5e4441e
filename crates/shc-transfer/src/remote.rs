//! Chunk-transfer HTTP surface
//!
//! The engine only talks to [`ChunkEndpoint`]. [`HttpChunkEndpoint`] is the
//! production implementation over `reqwest`; [`MemoryChunkEndpoint`] keeps
//! uploads in memory and can inject failures for tests and dry runs.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use shc_core::{ChatId, FileType, ShcError, ShcResult};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::MessageId;

/// Byte progress for one chunk: `(sent, total)`
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Request body streaming granularity; progress is reported per piece.
const BODY_PIECE: usize = 64 * 1024;

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub chat_id: ChatId,
    pub file_name: String,
    pub file_type: FileType,
    /// Encrypted payload size
    pub file_size: u64,
    /// Plaintext size
    pub total_size: u64,
    pub total_chunks: u32,
    /// Proposed; the server may answer with a different size.
    pub chunk_size: u64,
    pub metadata: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub upload_id: String,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub chunk_index: u32,
    pub uploaded_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    pub upload_id: String,
    pub total_chunks: u32,
    pub uploaded_chunks: Vec<u32>,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub message_id: MessageId,
}

/// Server side of a chunked upload.
pub trait ChunkEndpoint: Send + Sync + 'static {
    fn init_upload(
        &self,
        request: &InitUploadRequest,
    ) -> impl Future<Output = ShcResult<InitResponse>> + Send;

    /// Failures are reported as [`ShcError::ChunkUpload`].
    fn upload_chunk(
        &self,
        upload_id: &str,
        index: u32,
        data: Bytes,
        progress: Option<ProgressFn>,
    ) -> impl Future<Output = ShcResult<ChunkAck>> + Send;

    fn status(&self, upload_id: &str) -> impl Future<Output = ShcResult<RemoteStatus>> + Send;

    fn complete(&self, upload_id: &str)
        -> impl Future<Output = ShcResult<CompleteResponse>> + Send;

    fn cancel(&self, upload_id: &str) -> impl Future<Output = ShcResult<()>> + Send;
}

// ── HTTP endpoint ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HttpChunkEndpoint {
    client: reqwest::Client,
    base_url: String,
    auth: Option<(String, String)>,
}

impl std::fmt::Debug for HttpChunkEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChunkEndpoint")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.auth.is_some())
            .finish()
    }
}

impl HttpChunkEndpoint {
    pub fn new(base_url: &str, timeout: Duration) -> ShcResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ShcError::Transport(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            auth: None,
        })
    }

    /// Attach the `X-Auth-User` / `X-Auth-Token` pair sent with every request.
    pub fn with_auth(mut self, username: &str, auth_token: &str) -> Self {
        self.auth = Some((username.to_owned(), auth_token.to_owned()));
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if let Some((user, token)) = &self.auth {
            req = req.header("X-Auth-User", user).header("X-Auth-Token", token);
        }
        req
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, String> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    })
}

fn transport(context: &str) -> impl FnOnce(String) -> ShcError + '_ {
    move |e| ShcError::Transport(format!("{context}: {e}"))
}

/// Slice `data` into body pieces, reporting cumulative progress as the
/// client pulls each one.
fn progress_body(data: Bytes, progress: Option<ProgressFn>) -> reqwest::Body {
    let total = data.len() as u64;
    let mut pieces = Vec::with_capacity(data.len().div_ceil(BODY_PIECE));
    let mut start = 0;
    while start < data.len() {
        let end = (start + BODY_PIECE).min(data.len());
        pieces.push(data.slice(start..end));
        start = end;
    }
    let mut sent = 0u64;
    let stream = futures::stream::iter(pieces.into_iter().map(move |piece| {
        sent += piece.len() as u64;
        if let Some(cb) = &progress {
            cb(sent, total);
        }
        Ok::<_, std::io::Error>(piece)
    }));
    reqwest::Body::wrap_stream(stream)
}

impl ChunkEndpoint for HttpChunkEndpoint {
    async fn init_upload(&self, request: &InitUploadRequest) -> ShcResult<InitResponse> {
        let resp = self
            .request(reqwest::Method::POST, "/api/upload/init")
            .json(request)
            .send()
            .await
            .map_err(|e| ShcError::Transport(format!("init upload: {e}")))?;
        let resp = check(resp).await.map_err(transport("init upload"))?;
        resp.json()
            .await
            .map_err(|e| ShcError::Transport(format!("init upload response: {e}")))
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        index: u32,
        data: Bytes,
        progress: Option<ProgressFn>,
    ) -> ShcResult<ChunkAck> {
        let fail = |reason: String| ShcError::ChunkUpload { index, reason };
        let len = data.len();
        let resp = self
            .request(
                reqwest::Method::PUT,
                &format!("/api/upload/{upload_id}/chunks/{index}"),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(progress_body(data, progress))
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        let resp = check(resp).await.map_err(fail)?;
        let ack: ChunkAck = resp.json().await.map_err(|e| fail(e.to_string()))?;
        debug!(upload_id, index, bytes = len, uploaded = ack.uploaded_count, "chunk accepted");
        Ok(ack)
    }

    async fn status(&self, upload_id: &str) -> ShcResult<RemoteStatus> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/api/upload/{upload_id}"))
            .send()
            .await
            .map_err(|e| ShcError::Transport(format!("upload status: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ShcError::NotFound(format!("remote upload {upload_id}")));
        }
        let resp = check(resp).await.map_err(transport("upload status"))?;
        resp.json()
            .await
            .map_err(|e| ShcError::Transport(format!("upload status response: {e}")))
    }

    async fn complete(&self, upload_id: &str) -> ShcResult<CompleteResponse> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/api/upload/{upload_id}/complete"),
            )
            .send()
            .await
            .map_err(|e| ShcError::Transport(format!("complete upload: {e}")))?;
        let resp = check(resp).await.map_err(transport("complete upload"))?;
        resp.json()
            .await
            .map_err(|e| ShcError::Transport(format!("complete upload response: {e}")))
    }

    async fn cancel(&self, upload_id: &str) -> ShcResult<()> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/api/upload/{upload_id}"))
            .send()
            .await
            .map_err(|e| ShcError::Transport(format!("cancel upload: {e}")))?;
        check(resp).await.map_err(transport("cancel upload"))?;
        Ok(())
    }
}

// ── In-memory endpoint ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryUpload {
    chat_id: ChatId,
    file_size: u64,
    chunk_size: u64,
    total_chunks: u32,
    chunks: BTreeMap<u32, Bytes>,
    cancelled: bool,
    message_id: Option<MessageId>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    next_message_id: MessageId,
    chunk_size_override: Option<u64>,
    /// index → remaining injected failures
    failures: HashMap<u32, u32>,
    /// index → remaining requests that never answer
    hangs: HashMap<u32, u32>,
    uploads: HashMap<String, MemoryUpload>,
    received: Vec<(String, u32)>,
}

/// In-process chunk server. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryChunkEndpoint {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryChunkEndpoint {
    pub fn new() -> Self {
        let endpoint = Self::default();
        endpoint.lock().next_message_id = 1000;
        endpoint
    }

    /// Answer every init with this chunk size instead of the proposed one.
    pub fn with_chunk_size(self, chunk_size: u64) -> Self {
        self.lock().chunk_size_override = Some(chunk_size);
        self
    }

    /// The next `times` uploads of `index` fail.
    pub fn fail_chunk(&self, index: u32, times: u32) {
        self.lock().failures.insert(index, times);
    }

    /// The next `times` uploads of `index` never complete.
    pub fn hang_chunk(&self, index: u32, times: u32) {
        self.lock().hangs.insert(index, times);
    }

    /// Every chunk request that reached the server, in arrival order.
    pub fn received(&self) -> Vec<(String, u32)> {
        self.lock().received.clone()
    }

    pub fn clear_received(&self) {
        self.lock().received.clear();
    }

    /// Stored chunks concatenated by index.
    pub fn assembled(&self, upload_id: &str) -> Option<Vec<u8>> {
        let state = self.lock();
        let upload = state.uploads.get(upload_id)?;
        Some(upload.chunks.values().flat_map(|c| c.iter().copied()).collect())
    }

    pub fn is_cancelled(&self, upload_id: &str) -> bool {
        self.lock()
            .uploads
            .get(upload_id)
            .is_some_and(|u| u.cancelled)
    }

    pub fn upload_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().uploads.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live<'a>(state: &'a mut MemoryState, upload_id: &str) -> ShcResult<&'a mut MemoryUpload> {
        match state.uploads.get_mut(upload_id) {
            Some(u) if !u.cancelled => Ok(u),
            _ => Err(ShcError::NotFound(format!("remote upload {upload_id}"))),
        }
    }
}

fn take_one(counter: &mut HashMap<u32, u32>, index: u32) -> bool {
    match counter.get_mut(&index) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

impl ChunkEndpoint for MemoryChunkEndpoint {
    async fn init_upload(&self, request: &InitUploadRequest) -> ShcResult<InitResponse> {
        let mut state = self.lock();
        let chunk_size = state.chunk_size_override.unwrap_or(request.chunk_size);
        if chunk_size == 0 {
            return Err(ShcError::Transport("HTTP 400: zero chunk size".into()));
        }
        state.next_id += 1;
        let upload_id = format!("mem-{}", state.next_id);
        let total_chunks = u32::try_from(request.file_size.div_ceil(chunk_size))
            .map_err(|_| ShcError::Transport("HTTP 400: too many chunks".into()))?;
        state.uploads.insert(
            upload_id.clone(),
            MemoryUpload {
                chat_id: request.chat_id,
                file_size: request.file_size,
                chunk_size,
                total_chunks,
                ..Default::default()
            },
        );
        Ok(InitResponse {
            upload_id,
            chunk_size,
        })
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        index: u32,
        data: Bytes,
        progress: Option<ProgressFn>,
    ) -> ShcResult<ChunkAck> {
        let hang = {
            let mut state = self.lock();
            state.received.push((upload_id.to_owned(), index));
            if take_one(&mut state.failures, index) {
                return Err(ShcError::ChunkUpload {
                    index,
                    reason: "HTTP 503: injected failure".into(),
                });
            }
            take_one(&mut state.hangs, index)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        tokio::task::yield_now().await;

        let total = data.len() as u64;
        if let Some(cb) = &progress {
            cb(total / 2, total);
            cb(total, total);
        }

        let mut state = self.lock();
        let upload = Self::live(&mut state, upload_id).map_err(|e| ShcError::ChunkUpload {
            index,
            reason: e.to_string(),
        })?;
        if index >= upload.total_chunks {
            return Err(ShcError::ChunkUpload {
                index,
                reason: format!("HTTP 400: index out of range ({})", upload.total_chunks),
            });
        }
        let expected = if index + 1 == upload.total_chunks {
            upload.file_size - upload.chunk_size * u64::from(index)
        } else {
            upload.chunk_size
        };
        if total != expected {
            return Err(ShcError::ChunkUpload {
                index,
                reason: format!("HTTP 400: expected {expected} bytes, got {total}"),
            });
        }
        upload.chunks.insert(index, data);
        Ok(ChunkAck {
            chunk_index: index,
            uploaded_count: upload.chunks.len() as u32,
        })
    }

    async fn status(&self, upload_id: &str) -> ShcResult<RemoteStatus> {
        let mut state = self.lock();
        let upload = Self::live(&mut state, upload_id)?;
        Ok(RemoteStatus {
            upload_id: upload_id.to_owned(),
            total_chunks: upload.total_chunks,
            uploaded_chunks: upload.chunks.keys().copied().collect(),
            is_complete: upload.message_id.is_some(),
        })
    }

    async fn complete(&self, upload_id: &str) -> ShcResult<CompleteResponse> {
        let mut state = self.lock();
        let message_id = state.next_message_id;
        let upload = Self::live(&mut state, upload_id)?;
        if let Some(existing) = upload.message_id {
            return Ok(CompleteResponse {
                message_id: existing,
            });
        }
        if upload.chunks.len() as u32 != upload.total_chunks {
            return Err(ShcError::Transport(format!(
                "HTTP 409: {} of {} chunks received",
                upload.chunks.len(),
                upload.total_chunks
            )));
        }
        upload.message_id = Some(message_id);
        debug!(upload_id, chat_id = upload.chat_id, message_id, "memory upload completed");
        state.next_message_id += 1;
        Ok(CompleteResponse { message_id })
    }

    async fn cancel(&self, upload_id: &str) -> ShcResult<()> {
        let mut state = self.lock();
        match state.uploads.get_mut(upload_id) {
            Some(upload) => {
                upload.cancelled = true;
                upload.chunks.clear();
            }
            None => warn!(upload_id, "cancel for unknown memory upload"),
        }
        Ok(())
    }
}
