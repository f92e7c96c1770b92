use std::path::PathBuf;
use std::time::Duration;

use crate::types::PageRequest;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A single swap record could not be mapped to a canonical trade.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("malformed swap record: field `{field}`: {reason}")]
pub struct MalformedRecordError {
    pub field: String,
    pub reason: String,
}

impl MalformedRecordError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of one request against the indexing service.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("graphql error: {0}")]
    GraphQl(String),
    /// The service refused the requested offset depth.
    #[error("offset depth rejected: {0}")]
    OffsetLimit(String),
    #[error("decode response: {0}")]
    Decode(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("source query failed ({request}): {source}")]
    SourceQuery {
        request: PageRequest,
        #[source]
        source: SourceError,
    },
    /// Re-anchoring could not move past a single timestamp because more records share
    /// it than the offset ceiling allows.
    #[error("pagination stalled at timestamp {timestamp} ({request})")]
    Stalled { timestamp: u64, request: PageRequest },
    #[error("{malformed} of {fetched} records malformed ({request}); first: {first}")]
    MalformedPage {
        request: PageRequest,
        malformed: usize,
        fetched: usize,
        first: MalformedRecordError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("queue {backend}: {source}")]
    Queue {
        backend: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("store {backend}: {source}")]
    Store {
        backend: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("encode trade: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint io {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("checkpoint store: {0}")]
    Store(#[from] sqlx::Error),
    #[error("checkpoint {source_id} corrupt: {reason}")]
    Corrupt { source_id: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl IngestError {
    /// Fatal only when the source hands back pages of garbage: retrying would either loop
    /// forever or silently drop data.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, IngestError::Fetch(FetchError::MalformedPage { .. }))
    }
}
