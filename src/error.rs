//! Error types for the fingerprinting and matching core.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SonicGenError {
    #[error("audio decode error: {0}")]
    Decode(#[from] anyhow::Error),

    #[error("audio too short to fingerprint: {frame_count} frames (minimum: {minimum})")]
    TooShort { frame_count: usize, minimum: usize },

    #[error("index error: {0}")]
    Index(#[from] sqlx::Error),

    #[error("index unavailable, retryable: {0}")]
    IndexTransient(String),

    #[error("hash stat divergence for source {source_id}: {reason}")]
    StatDivergence { source_id: Uuid, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid hash token: {0}")]
    InvalidHashToken(String),

    #[error("source not found: {0}")]
    SourceNotFound(Uuid),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SonicGenError {
    /// Transient index errors are retryable by the worker's backoff policy;
    /// everything else flags the source and moves on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SonicGenError::IndexTransient(_))
    }
}
