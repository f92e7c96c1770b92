use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::checkpoint::{CheckpointStore, Cursor};
use crate::error::{CheckpointError, SinkError, SourceError};
use crate::json_util::parse_u64;
use crate::sink::{TradeQueue, TradeStore};
use crate::source::SwapSource;
use crate::types::{CanonicalTrade, LatestBlock, PageRequest, TradeKey};

/// Builds raw swap records shaped like the subgraph response.
#[derive(Clone, Debug)]
pub struct SwapBuilder {
    ts: u64,
    log_index: u64,
    tx: String,
    block: u64,
    amounts: [String; 4],
}

impl SwapBuilder {
    pub const TOKEN0: &'static str = "0x4200000000000000000000000000000000000006";
    pub const TOKEN1: &'static str = "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913";
    pub const POOL: &'static str = "0xcdac0d6c6c59727a65f871236188350531885c43";

    pub fn new(ts: u64, log_index: u64) -> Self {
        Self {
            ts,
            log_index,
            tx: tx_hash(ts, log_index),
            block: 20_000_000 + ts / 2,
            amounts: ["1".into(), "0".into(), "0".into(), "2".into()],
        }
    }

    pub fn amounts(mut self, a0_in: &str, a0_out: &str, a1_in: &str, a1_out: &str) -> Self {
        self.amounts = [a0_in.into(), a0_out.into(), a1_in.into(), a1_out.into()];
        self
    }

    pub fn tx(mut self, hash: impl Into<String>) -> Self {
        self.tx = hash.into();
        self
    }

    pub fn block(mut self, block: u64) -> Self {
        self.block = block;
        self
    }

    pub fn build(&self) -> Value {
        let [a0_in, a0_out, a1_in, a1_out] = &self.amounts;
        json!({
            "id": format!("{}-{}", self.tx, self.log_index),
            "transaction": { "id": self.tx, "blockNumber": self.block.to_string() },
            "timestamp": self.ts.to_string(),
            "pool": {
                "id": Self::POOL,
                "token0": { "id": Self::TOKEN0, "symbol": "WETH", "decimals": "18" },
                "token1": { "id": Self::TOKEN1, "symbol": "USDC", "decimals": "6" }
            },
            "sender": "0x6cb442acf35158d5eda88fe602669e6b30ff8d6c",
            "to": "0x6cb442acf35158d5eda88fe602669e6b30ff8d6c",
            "amount0In": a0_in,
            "amount0Out": a0_out,
            "amount1In": a1_in,
            "amount1Out": a1_out,
            "logIndex": self.log_index.to_string()
        })
    }
}

/// Deterministic 32-byte transaction hash for a `(ts, log_index)` pair.
pub fn tx_hash(ts: u64, log_index: u64) -> String {
    format!("0x{ts:032x}{log_index:032x}")
}

/// `count` swaps at `ts` with log indexes `first_log_index..`.
pub fn swaps_at(ts: u64, first_log_index: u64, count: usize) -> Vec<Value> {
    (0..count as u64)
        .map(|i| SwapBuilder::new(ts, first_log_index + i).build())
        .collect()
}

/// Offset-paginated swap source with the same ordering and filter semantics as the
/// subgraph query.
#[derive(Default)]
pub struct MockSource {
    records: Mutex<Vec<Value>>,
    max_skip: Option<usize>,
    failures: Mutex<VecDeque<SourceError>>,
    requests: Mutex<Vec<PageRequest>>,
    delay: Option<Duration>,
}

impl MockSource {
    pub fn new(records: Vec<Value>) -> Self {
        let src = Self::default();
        src.push_records(records);
        src
    }

    /// Reject pages whose `skip` exceeds `max_skip`, the way hosted indexers do.
    pub fn with_max_skip(mut self, max_skip: usize) -> Self {
        self.max_skip = Some(max_skip);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Records become visible to the next page request.
    pub fn push_records(&self, records: Vec<Value>) {
        let mut all = lock(&self.records);
        all.extend(records);
        all.sort_by_key(record_ts);
    }

    /// The next page request fails with `e` instead of returning data.
    pub fn fail_next(&self, e: SourceError) {
        lock(&self.failures).push_back(e);
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl SwapSource for MockSource {
    async fn latest_block(&self) -> Result<LatestBlock, SourceError> {
        let records = lock(&self.records).clone();
        let last = records.last();
        Ok(LatestBlock {
            block_number: last
                .and_then(|r| parse_u64(r.pointer("/transaction/blockNumber")))
                .unwrap_or(0),
            timestamp: last.map(record_ts).unwrap_or(0),
        })
    }

    async fn swaps_page(&self, req: &PageRequest) -> Result<Vec<Value>, SourceError> {
        lock(&self.requests).push(*req);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = lock(&self.failures).pop_front() {
            return Err(e);
        }
        if let Some(max) = self.max_skip {
            if req.skip > max {
                return Err(SourceError::OffsetLimit(format!(
                    "The `skip` argument must be between 0 and {max}, but is {}",
                    req.skip
                )));
            }
        }
        let page = lock(&self.records)
            .iter()
            .filter(|r| record_ts(r) >= req.min_timestamp)
            .skip(req.skip)
            .take(req.first)
            .cloned()
            .collect();
        Ok(page)
    }
}

fn record_ts(r: &Value) -> u64 {
    parse_u64(r.get("timestamp")).unwrap_or(0)
}

#[derive(Default)]
pub struct MemoryQueue {
    pushed: Mutex<Vec<CanonicalTrade>>,
    flushes: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryQueue {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn trades(&self) -> Vec<CanonicalTrade> {
        lock(&self.pushed).clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TradeQueue for MemoryQueue {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn push(&self, trade: &CanonicalTrade) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Queue {
                backend: "memory",
                source: "queue unavailable".into(),
            });
        }
        lock(&self.pushed).push(trade.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Insert-or-ignore keyed like the `raw_trades` primary key.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<TradeKey, CanonicalTrade>>,
    batches: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<CanonicalTrade> {
        lock(&self.rows).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn upsert_batch(&self, trades: &[CanonicalTrade]) -> Result<u64, SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Store {
                backend: "memory",
                source: "store unavailable".into(),
            });
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        let mut rows = lock(&self.rows);
        let mut inserted = 0;
        for t in trades {
            if !rows.contains_key(&t.key()) {
                rows.insert(t.key(), t.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    cursors: Mutex<HashMap<String, Cursor>>,
    saves: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, source_id: &str) -> Option<Cursor> {
        lock(&self.cursors).get(source_id).cloned()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), CheckpointError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CheckpointError::Io {
                path: "memory".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "checkpoint unavailable"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, source_id: &str) -> Result<Option<Cursor>, CheckpointError> {
        self.check()?;
        Ok(self.get(source_id))
    }

    async fn save(&self, source_id: &str, cursor: &Cursor) -> Result<(), CheckpointError> {
        self.check()?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        lock(&self.cursors).insert(source_id.to_string(), cursor.clone());
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<bool, CheckpointError> {
        self.check()?;
        Ok(lock(&self.cursors).remove(source_id).is_some())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
