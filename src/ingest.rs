use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointManager, Cursor};
use crate::error::IngestError;
use crate::graceful_shutdown::sleep_or_shutdown;
use crate::health::HealthCounters;
use crate::paginate::PaginationEngine;
use crate::sink::{TradeQueue, TradeStore};
use crate::source::SwapSource;
use crate::types::{now_ms, CanonicalTrade};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Fetching,
    Forwarding,
    Checkpointing,
    Backoff,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub backoff: Duration,
    pub heartbeat: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(60),
            backoff: Duration::from_secs(30),
            heartbeat: Duration::from_secs(60),
        }
    }
}

/// Totals returned by `run` after a clean shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub trades_forwarded: u64,
    pub rows_inserted: u64,
    pub backoffs: u64,
}

/// What one cycle or backfill pushed downstream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Forwarded {
    pub trades: usize,
    pub inserted: u64,
}

/// One source's poll loop. A recoverable error moves to `Backoff`; the next cycle starts
/// again from the in-memory cursor, which only moves after a successful persist.
pub struct IngestLoop<S: SwapSource + ?Sized> {
    engine: PaginationEngine<S>,
    checkpoints: CheckpointManager,
    queue: Arc<dyn TradeQueue>,
    store: Arc<dyn TradeStore>,
    cfg: LoopConfig,
    health: Arc<HealthCounters>,
    state: LoopState,
    cursor: Option<Cursor>,
}

impl<S: SwapSource + ?Sized> IngestLoop<S> {
    pub fn new(
        engine: PaginationEngine<S>,
        checkpoints: CheckpointManager,
        queue: Arc<dyn TradeQueue>,
        store: Arc<dyn TradeStore>,
        cfg: LoopConfig,
        health: Arc<HealthCounters>,
    ) -> Self {
        Self {
            engine,
            checkpoints,
            queue,
            store,
            cfg,
            health,
            state: LoopState::Idle,
            cursor: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// In-memory cursor; `None` until the first cycle has loaded it.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    /// Runs until shutdown is requested or a fatal error occurs.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<LoopStats, IngestError> {
        let exchange = self.engine.exchange_id().to_string();
        let mut stats = LoopStats::default();
        let mut last_heartbeat = Instant::now();
        info!(exchange = %exchange, batch_size = self.cfg.batch_size, "ingestion loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.cycle().await {
                Ok(f) => {
                    stats.cycles += 1;
                    stats.trades_forwarded += f.trades as u64;
                    stats.rows_inserted += f.inserted;
                    self.state = LoopState::Idle;
                    self.cfg.poll_interval
                }
                Err(e) if e.is_recoverable() => {
                    warn!(
                        exchange = %exchange,
                        state = ?self.state,
                        error = %e,
                        backoff_ms = self.cfg.backoff.as_millis() as u64,
                        "cycle failed; backing off"
                    );
                    stats.backoffs += 1;
                    self.health.inc_backoffs(1);
                    self.state = LoopState::Backoff;
                    self.cfg.backoff
                }
                Err(e) => {
                    error!(exchange = %exchange, state = ?self.state, error = %e, "fatal ingestion error");
                    return Err(e);
                }
            };

            if last_heartbeat.elapsed() >= self.cfg.heartbeat {
                self.heartbeat(&exchange);
                last_heartbeat = Instant::now();
            }

            if sleep_or_shutdown(pause, &mut shutdown).await {
                break;
            }
        }

        info!(
            exchange = %exchange,
            cycles = stats.cycles,
            trades_forwarded = stats.trades_forwarded,
            backoffs = stats.backoffs,
            "ingestion loop stopped"
        );
        Ok(stats)
    }

    /// One fetch/forward/checkpoint pass.
    pub async fn cycle(&mut self) -> Result<Forwarded, IngestError> {
        let cursor = match &self.cursor {
            Some(c) => c.clone(),
            None => {
                let c = self.checkpoints.load().await?;
                self.health.set_cursor_ts(c.timestamp);
                self.cursor = Some(c.clone());
                c
            }
        };

        self.state = LoopState::Fetching;
        let batch = self
            .engine
            .fetch_from_cursor(&cursor, self.cfg.batch_size)
            .await?;
        self.health.inc_cycles(1);
        self.health.set_last_cycle_ms(now_ms());
        if batch.is_empty() {
            debug!(exchange = %self.engine.exchange_id(), cursor_ts = cursor.timestamp, "no new swaps");
            return Ok(Forwarded::default());
        }

        self.state = LoopState::Forwarding;
        let forwarded = self.forward(&batch).await?;

        self.state = LoopState::Checkpointing;
        let next = self.checkpoints.advance(&cursor, &batch);
        self.checkpoints.persist(&next).await?;
        info!(
            exchange = %self.engine.exchange_id(),
            trades = forwarded.trades,
            inserted = forwarded.inserted,
            cursor_ts = next.timestamp,
            boundary_keys = next.last_seen_keys.len(),
            "batch ingested"
        );
        self.health.set_cursor_ts(next.timestamp);
        self.cursor = Some(next);
        Ok(forwarded)
    }

    /// Fetch `[start, end]` and forward it. The cursor is neither read nor written.
    pub async fn backfill(&self, start: u64, end: u64) -> Result<Forwarded, IngestError> {
        let trades = self.engine.fetch_window(start, end).await?;
        if trades.is_empty() {
            return Ok(Forwarded::default());
        }
        let mut total = Forwarded::default();
        for chunk in trades.chunks(self.cfg.batch_size.max(1)) {
            let f = self.forward(chunk).await?;
            total.trades += f.trades;
            total.inserted += f.inserted;
        }
        info!(
            exchange = %self.engine.exchange_id(),
            start,
            end,
            trades = total.trades,
            inserted = total.inserted,
            "backfill complete"
        );
        Ok(total)
    }

    async fn forward(&self, batch: &[CanonicalTrade]) -> Result<Forwarded, IngestError> {
        for trade in batch {
            self.queue.push(trade).await?;
        }
        self.queue.flush().await?;
        let inserted = self.store.upsert_batch(batch).await?;

        self.health.inc_trades_forwarded(batch.len() as u64);
        self.health.inc_rows_inserted(inserted);
        Ok(Forwarded {
            trades: batch.len(),
            inserted,
        })
    }

    fn heartbeat(&self, exchange: &str) {
        let s = self.health.snapshot();
        info!(
            exchange,
            cycles = s.cycles,
            pages = s.pages_fetched,
            reanchors = s.reanchors,
            forwarded = s.trades_forwarded,
            inserted = s.rows_inserted,
            malformed = s.records_malformed,
            backoffs = s.backoffs,
            cursor_ts = s.cursor_ts,
            "heartbeat"
        );
    }
}
