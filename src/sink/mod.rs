mod jsonl;
mod postgres;
mod redis_queue;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::types::CanonicalTrade;

pub use jsonl::JsonlQueue;
pub use postgres::PgTradeStore;
pub use redis_queue::RedisQueue;

#[async_trait]
pub trait TradeQueue: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn push(&self, trade: &CanonicalTrade) -> Result<(), SinkError>;

    /// Make every pushed trade durable. Called once per forwarded batch, before the
    /// cursor moves.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Durable sink. Rows whose `(transaction_hash, log_index)` already exist are ignored, so
/// re-sending a batch is always safe.
#[async_trait]
pub trait TradeStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Insert-or-ignore on `(transaction_hash, log_index)`. Returns newly inserted rows.
    async fn upsert_batch(&self, trades: &[CanonicalTrade]) -> Result<u64, SinkError>;
}

/// `redis://` / `rediss://` -> Redis list, `file://<path>` -> JSONL buffer file.
pub async fn open_queue(url: &str, key: &str) -> Result<Arc<dyn TradeQueue>, SinkError> {
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let q = RedisQueue::connect(url, key).await?;
        return Ok(Arc::new(q));
    }
    if let Some(path) = url.strip_prefix("file://") {
        let q = JsonlQueue::open(PathBuf::from(path))?;
        return Ok(Arc::new(q));
    }
    Err(SinkError::Queue {
        backend: "unknown",
        source: format!("unsupported queue url scheme: {url}").into(),
    })
}
