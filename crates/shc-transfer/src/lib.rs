//! shc-transfer: resumable chunked uploads of encrypted payloads
//!
//! A [`TransferTask`] tracks one payload from `init_upload` to completion.
//! Chunk bytes and task bookkeeping live in a [`TransferStore`] so an
//! interrupted upload resumes with only the unacknowledged chunks:
//!
//! ```text
//! Pending ──► Uploading ◄──► Paused
//!    │            │             │
//!    └──► Failed ◄┴──► Completed┘
//! ```
//!
//! Store backends:
//!   - **file** (default): `tasks.json` rewritten atomically, one blob per chunk
//!   - **rocksdb** (feature `rocksdb`): tasks and chunks in one database

pub mod chunking;
pub mod engine;
pub mod remote;
pub mod store;
pub mod task;

pub use engine::{EngineConfig, NewUpload, RecoveryReport, RunOutcome, TransferEngine};
pub use remote::{
    ChunkAck, ChunkEndpoint, CompleteResponse, HttpChunkEndpoint, InitResponse, InitUploadRequest,
    MemoryChunkEndpoint, ProgressFn, RemoteStatus,
};
pub use store::{FileTransferStore, StoreBackend, TransferStore};
pub use task::{TransferEvent, TransferTask, UploadStatus};

#[cfg(feature = "rocksdb")]
pub use store::RocksTransferStore;

/// Server-issued identifier of the message a completed upload became
pub type MessageId = i64;
