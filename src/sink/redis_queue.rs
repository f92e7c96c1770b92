use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands as _;
use tracing::{debug, info};

use super::TradeQueue;
use crate::error::SinkError;
use crate::types::CanonicalTrade;

const BACKEND: &str = "redis";

/// Redis list buffer. Producers LPUSH, consumers RPOP, so a single consumer sees trades
/// roughly in push order.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    key: String,
}

impl RedisQueue {
    pub async fn connect(url: &str, key: &str) -> Result<Self, SinkError> {
        let client = redis::Client::open(url).map_err(queue_err)?;
        let conn = ConnectionManager::new(client).await.map_err(queue_err)?;
        info!(key, "redis queue connected");
        Ok(Self {
            conn,
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl TradeQueue for RedisQueue {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn push(&self, trade: &CanonicalTrade) -> Result<(), SinkError> {
        let json = serde_json::to_string(trade)?;
        let mut conn = self.conn.clone();
        let len: i64 = conn.lpush(&self.key, json).await.map_err(queue_err)?;
        debug!(key = %self.key, len, tx = %trade.transaction_hash, "trade buffered");
        Ok(())
    }
}

fn queue_err(e: redis::RedisError) -> SinkError {
    SinkError::Queue {
        backend: BACKEND,
        source: Box::new(e),
    }
}
