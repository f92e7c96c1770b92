//! Shared record types.
//!
//! Timestamp domains (frozen):
//! - Source timestamps are **unix seconds** (`u64`), exactly as the indexer reports them.
//! - `CanonicalTrade::trade_timestamp` is the same instant as a `DateTime<Utc>`.
//! - Local bookkeeping (health, heartbeats) uses **unix milliseconds** via `now_ms`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::json_util::string_or_number;

/// Deduplication key of a trade. Ordered by `(transaction_hash, log_index)` so key sets
/// serialize deterministically.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradeKey {
    pub transaction_hash: String,
    pub log_index: u64,
}

impl TradeKey {
    pub fn new(transaction_hash: impl Into<String>, log_index: u64) -> Self {
        Self {
            transaction_hash: transaction_hash.into(),
            log_index,
        }
    }
}

impl fmt::Display for TradeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.transaction_hash, self.log_index)
    }
}

/// The normalized unit of work handed to the queue and the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalTrade {
    pub transaction_hash: String,
    pub log_index: u64,
    pub base_token_address: String,
    pub quote_token_address: String,
    pub exchange_id: String,
    pub trade_timestamp: DateTime<Utc>,
    pub block_number: u64,
    pub trader_address: Option<String>,
    /// Verbatim decimal string from the source. Never reparsed for storage.
    pub amount_in: String,
    pub amount_out: String,
    pub token_in_address: String,
    pub token_out_address: String,
    /// `amount_out / amount_in`; display only.
    pub price: Option<String>,
    pub source_data: serde_json::Value,
}

impl CanonicalTrade {
    pub fn key(&self) -> TradeKey {
        TradeKey::new(self.transaction_hash.clone(), self.log_index)
    }

    /// Source timestamp in unix seconds.
    pub fn unix_ts(&self) -> u64 {
        u64::try_from(self.trade_timestamp.timestamp()).unwrap_or(0)
    }
}

/// Swap entity as returned by the subgraph `swaps` query.
///
/// The Graph encodes `BigInt`/`BigDecimal` scalars as strings; `blockNumber` and
/// `timestamp` are accepted as either strings or JSON numbers.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSwap {
    pub id: String,
    pub transaction: RawTransaction,
    #[serde(deserialize_with = "string_or_number")]
    pub timestamp: String,
    pub pool: RawPool,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    pub amount0_in: String,
    pub amount0_out: String,
    pub amount1_in: String,
    pub amount1_out: String,
    #[serde(deserialize_with = "string_or_number")]
    pub log_index: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub block_number: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawPool {
    pub id: String,
    pub token0: RawToken,
    pub token1: RawToken,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawToken {
    pub id: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default, deserialize_with = "crate::json_util::opt_string_or_number")]
    pub decimals: Option<String>,
}

/// Result of the `_meta` query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LatestBlock {
    pub block_number: u64,
    pub timestamp: u64,
}

/// Parameters of one offset page against the swaps query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    pub first: usize,
    pub skip: usize,
    pub min_timestamp: u64,
}

impl fmt::Display for PageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "first={} skip={} min_timestamp={}",
            self.first, self.skip, self.min_timestamp
        )
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
