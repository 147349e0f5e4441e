use thiserror::Error;

pub type ShcResult<T> = Result<T, ShcError>;

#[derive(Debug, Error)]
pub enum ShcError {
    /// Wrong password, corrupt envelope, or malformed key material.
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("chunk {index} upload failed: {reason}")]
    ChunkUpload { index: u32, reason: String },

    /// Local store unavailable; resumability is lost for the affected task.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// An operation was called before its precondition held.
    #[error("contract violation: {0}")]
    Contract(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShcError {
    /// Chunk and transport failures are retried; everything else surfaces to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShcError::ChunkUpload { .. } | ShcError::Transport(_))
    }

    pub fn persistence(context: &str, err: impl std::fmt::Display) -> Self {
        ShcError::Persistence(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ShcError::ChunkUpload {
            index: 3,
            reason: "timeout".into()
        }
        .is_retryable());
        assert!(ShcError::Transport("reset".into()).is_retryable());
        assert!(!ShcError::Persistence("disk full".into()).is_retryable());
        assert!(!ShcError::Contract("early complete".into()).is_retryable());
        assert!(!ShcError::Crypto("bad tag".into()).is_retryable());
    }

    #[test]
    fn test_chunk_error_message_names_index() {
        let e = ShcError::ChunkUpload {
            index: 7,
            reason: "HTTP 502".into(),
        };
        assert_eq!(e.to_string(), "chunk 7 upload failed: HTTP 502");
    }
}
