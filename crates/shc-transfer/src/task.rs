//! Transfer task model and its status state machine

use serde::{Deserialize, Serialize};
use shc_core::{ChatId, FileType, ShcError, ShcResult};
use std::collections::BTreeSet;

use crate::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Paused,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }

    /// Legal moves. Staying put is always allowed; nothing leaves a
    /// terminal state.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Pending, Failed)
                | (Uploading, Paused)
                | (Paused, Uploading)
                | (Uploading, Completed)
                | (Paused, Completed)
                | (Uploading, Failed)
                | (Paused, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one chunked upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    /// Locally generated UUID
    pub id: String,
    pub chat_id: ChatId,
    pub file_name: String,
    pub file_type: FileType,
    /// Encrypted metadata envelope sent along with the upload
    pub metadata: String,
    /// Plaintext size in bytes
    pub total_size: u64,
    /// Size of the encrypted payload actually uploaded
    pub encrypted_size: u64,
    /// Server-negotiated chunk size
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub uploaded_chunks: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_upload_id: Option<String>,
    /// Unix milliseconds
    pub created_at: u64,
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TransferTask {
    /// Move to `next`, or fail with `Contract` if the move is illegal.
    pub fn transition(&mut self, next: UploadStatus) -> ShcResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ShcError::Contract(format!(
                "task {}: illegal status change {} -> {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Record `index` as acknowledged. Returns false if it already was.
    pub fn acknowledge(&mut self, index: u32) -> ShcResult<bool> {
        if index >= self.total_chunks {
            return Err(ShcError::Contract(format!(
                "task {}: chunk index {index} out of range (total {})",
                self.id, self.total_chunks
            )));
        }
        Ok(self.uploaded_chunks.insert(index))
    }

    /// Indices still to upload, ascending.
    pub fn remaining(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.uploaded_chunks.contains(i))
            .collect()
    }

    pub fn is_fully_acknowledged(&self) -> bool {
        self.uploaded_chunks.len() as u64 == u64::from(self.total_chunks)
            && self.uploaded_chunks.iter().all(|i| *i < self.total_chunks)
    }

    /// Fraction of chunks acknowledged, 0.0..=1.0
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.uploaded_chunks.len() as f64 / f64::from(self.total_chunks)
    }

    /// Terminal and created more than `retention_ms` before `now_ms`.
    pub fn is_expired(&self, now_ms: u64, retention_ms: u64) -> bool {
        self.status.is_terminal() && self.created_at.saturating_add(retention_ms) < now_ms
    }
}

/// Progress and lifecycle notifications published by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    StatusChanged {
        task_id: String,
        status: UploadStatus,
    },
    ChunkProgress {
        task_id: String,
        index: u32,
        sent: u64,
        total: u64,
    },
    ChunkAcknowledged {
        task_id: String,
        index: u32,
        acknowledged: u32,
        total_chunks: u32,
    },
    ChunkFailed {
        task_id: String,
        index: u32,
        attempt: u32,
        reason: String,
    },
    /// The store rejected a write; the upload continues but may not resume
    /// after a restart.
    PersistenceDegraded {
        task_id: String,
        reason: String,
    },
    Completed {
        task_id: String,
        message_id: MessageId,
    },
    Cancelled {
        task_id: String,
    },
}

impl TransferEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TransferEvent::StatusChanged { task_id, .. }
            | TransferEvent::ChunkProgress { task_id, .. }
            | TransferEvent::ChunkAcknowledged { task_id, .. }
            | TransferEvent::ChunkFailed { task_id, .. }
            | TransferEvent::PersistenceDegraded { task_id, .. }
            | TransferEvent::Completed { task_id, .. }
            | TransferEvent::Cancelled { task_id } => task_id,
        }
    }
}
