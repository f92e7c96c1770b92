use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::checkpoint::Cursor;
use crate::error::{FetchError, MalformedRecordError, SourceError};
use crate::health::HealthCounters;
use crate::normalize::normalize;
use crate::source::SwapSource;
use crate::types::{CanonicalTrade, LatestBlock, PageRequest, TradeKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaginationConfig {
    pub page_size: usize,
    /// Re-anchor before `skip` goes past this. `None` relies on the source rejecting
    /// the offset.
    pub max_skip: Option<usize>,
    pub page_timeout: Duration,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_skip: Some(5_000),
            page_timeout: Duration::from_secs(10),
        }
    }
}

/// Offset pagination over a `SwapSource`.
///
/// When the offset ceiling is hit the engine moves `min_timestamp` up to the last emitted
/// timestamp and restarts at `skip = 0`, filtering already-emitted trades at that
/// timestamp through the boundary key set.
pub struct PaginationEngine<S: SwapSource + ?Sized> {
    source: Arc<S>,
    exchange_id: String,
    cfg: PaginationConfig,
    health: Arc<HealthCounters>,
}

/// Per-call accumulator. Never outlives one `fetch_*` call.
struct Walk {
    anchor: u64,
    skip: usize,
    boundary_ts: u64,
    boundary_keys: HashSet<TradeKey>,
    out: Vec<CanonicalTrade>,
}

impl<S: SwapSource + ?Sized> PaginationEngine<S> {
    pub fn new(
        source: Arc<S>,
        exchange_id: impl Into<String>,
        cfg: PaginationConfig,
        health: Arc<HealthCounters>,
    ) -> Self {
        Self {
            source,
            exchange_id: exchange_id.into(),
            cfg,
            health,
        }
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    pub async fn latest_block(&self) -> Result<LatestBlock, SourceError> {
        self.source.latest_block().await
    }

    /// Up to `max_results` trades with `timestamp >= min_timestamp`, ordered by
    /// `(timestamp, log_index)`.
    pub async fn fetch_since(
        &self,
        min_timestamp: u64,
        max_results: usize,
    ) -> Result<Vec<CanonicalTrade>, FetchError> {
        self.fetch_from_cursor(&Cursor::starting_at(min_timestamp), max_results)
            .await
    }

    /// Like `fetch_since`, skipping trades the cursor already recorded at its timestamp.
    pub async fn fetch_from_cursor(
        &self,
        cursor: &Cursor,
        max_results: usize,
    ) -> Result<Vec<CanonicalTrade>, FetchError> {
        if max_results == 0 {
            return Ok(Vec::new());
        }
        self.walk(cursor, max_results, None).await
    }

    /// All trades with `start <= timestamp <= end`.
    pub async fn fetch_window(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<CanonicalTrade>, FetchError> {
        if start > end {
            return Ok(Vec::new());
        }
        self.walk(&Cursor::starting_at(start), usize::MAX, Some(end))
            .await
    }

    async fn walk(
        &self,
        cursor: &Cursor,
        max_results: usize,
        end: Option<u64>,
    ) -> Result<Vec<CanonicalTrade>, FetchError> {
        let page_size = self.cfg.page_size.max(1);
        let mut w = Walk {
            anchor: cursor.timestamp,
            skip: 0,
            boundary_ts: cursor.timestamp,
            boundary_keys: cursor.last_seen_keys.iter().cloned().collect(),
            out: Vec::new(),
        };

        while w.out.len() < max_results {
            if let Some(max_skip) = self.cfg.max_skip {
                if w.skip > max_skip {
                    self.reanchor(&mut w, page_size)?;
                }
            }

            let req = PageRequest {
                first: page_size,
                skip: w.skip,
                min_timestamp: w.anchor,
            };
            let page = match tokio::time::timeout(self.cfg.page_timeout, self.source.swaps_page(&req))
                .await
            {
                Err(_) => {
                    return Err(FetchError::SourceQuery {
                        request: req,
                        source: SourceError::Timeout(self.cfg.page_timeout),
                    })
                }
                Ok(Err(SourceError::OffsetLimit(msg))) if w.skip > 0 => {
                    debug!(exchange = %self.exchange_id, %req, %msg, "offset ceiling reported by source");
                    self.reanchor(&mut w, page_size)?;
                    continue;
                }
                Ok(Err(source)) => return Err(FetchError::SourceQuery { request: req, source }),
                Ok(Ok(page)) => page,
            };
            self.health.inc_pages_fetched(1);

            let fetched = page.len();
            let emitted_before = w.out.len();
            let mut malformed = 0usize;
            let mut first_malformed: Option<MalformedRecordError> = None;
            let mut past_end = false;

            for raw in &page {
                let trade = match normalize(raw, &self.exchange_id) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(
                            exchange = %self.exchange_id,
                            field = %e.field,
                            reason = %e.reason,
                            id = raw.get("id").and_then(|v| v.as_str()).unwrap_or("?"),
                            "skipping malformed swap"
                        );
                        malformed += 1;
                        first_malformed.get_or_insert(e);
                        continue;
                    }
                };

                let ts = trade.unix_ts();
                if end.is_some_and(|end| ts > end) {
                    past_end = true;
                    continue;
                }
                if ts < w.anchor || ts < w.boundary_ts {
                    continue;
                }
                if ts > w.boundary_ts {
                    w.boundary_ts = ts;
                    w.boundary_keys.clear();
                }
                if !w.boundary_keys.insert(trade.key()) {
                    self.health.inc_records_duplicate(1);
                    continue;
                }
                w.out.push(trade);
            }

            if let Some(first) = first_malformed {
                self.health.inc_records_malformed(malformed as u64);
                if malformed * 2 > fetched {
                    return Err(FetchError::MalformedPage {
                        request: req,
                        malformed,
                        fetched,
                        first,
                    });
                }
            }

            debug!(
                exchange = %self.exchange_id,
                %req,
                fetched,
                emitted = w.out.len() - emitted_before,
                boundary_ts = w.boundary_ts,
                "page fetched"
            );

            w.skip += fetched;
            if fetched < page_size || past_end {
                break;
            }
        }

        let mut out = w.out;
        out.sort_by_key(|t| (t.unix_ts(), t.log_index));
        out.truncate(max_results);
        Ok(out)
    }

    fn reanchor(&self, w: &mut Walk, page_size: usize) -> Result<(), FetchError> {
        let request = PageRequest {
            first: page_size,
            skip: w.skip,
            min_timestamp: w.anchor,
        };
        if w.boundary_ts <= w.anchor {
            return Err(FetchError::Stalled {
                timestamp: w.anchor,
                request,
            });
        }
        info!(
            exchange = %self.exchange_id,
            from = w.anchor,
            to = w.boundary_ts,
            skip = w.skip,
            boundary_keys = w.boundary_keys.len(),
            "re-anchoring pagination"
        );
        self.health.inc_reanchors(1);
        w.anchor = w.boundary_ts;
        w.skip = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{swaps_at, MockSource, SwapBuilder};

    fn engine(src: MockSource, page_size: usize) -> (PaginationEngine<MockSource>, Arc<MockSource>) {
        let src = Arc::new(src);
        let cfg = PaginationConfig {
            page_size,
            ..PaginationConfig::default()
        };
        let e = PaginationEngine::new(src.clone(), "aerodrome", cfg, Arc::new(HealthCounters::default()));
        (e, src)
    }

    #[tokio::test]
    async fn zero_max_results_does_not_query() {
        let (e, src) = engine(MockSource::new(swaps_at(100, 0, 5)), 10);
        assert!(e.fetch_since(0, 0).await.unwrap().is_empty());
        assert!(src.requests().is_empty());
    }

    #[tokio::test]
    async fn cursor_keys_are_not_re_emitted() {
        let records = swaps_at(100, 0, 4);
        let (e, _src) = engine(MockSource::new(records), 10);
        let first = e.fetch_since(100, 2).await.unwrap();
        assert_eq!(first.len(), 2);

        let mut cursor = Cursor::starting_at(100);
        cursor.last_seen_keys = first.iter().map(CanonicalTrade::key).collect();
        let rest = e.fetch_from_cursor(&cursor, 10).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|t| !cursor.last_seen_keys.contains(&t.key())));
    }

    #[tokio::test]
    async fn single_malformed_record_is_skipped() {
        let mut records = swaps_at(100, 0, 4);
        records[1]["logIndex"] = serde_json::json!("0x1");
        let (e, _src) = engine(MockSource::new(records), 10);
        let out = e.fetch_since(0, 10).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(e.health.snapshot().records_malformed, 1);
    }

    #[tokio::test]
    async fn mostly_malformed_page_is_fatal() {
        let mut records = swaps_at(100, 0, 3);
        for r in records.iter_mut().take(2) {
            r["amount0In"] = serde_json::json!("not-a-number");
        }
        let (e, _src) = engine(MockSource::new(records), 10);
        let err = e.fetch_since(0, 10).await.unwrap_err();
        match err {
            FetchError::MalformedPage { malformed, fetched, first, .. } => {
                assert_eq!((malformed, fetched), (2, 3));
                assert_eq!(first.field, "amount0In");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn page_error_discards_partial_results() {
        let (e, src) = engine(MockSource::new(swaps_at(100, 0, 25)), 10);
        src.fail_next(SourceError::GraphQl("warming up".into()));
        let err = e.fetch_since(0, 100).await.unwrap_err();
        assert!(matches!(err, FetchError::SourceQuery { request, .. } if request.skip == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_page_times_out() {
        let src = MockSource::new(swaps_at(100, 0, 5)).with_delay(Duration::from_secs(30));
        let (e, _src) = engine(src, 10);
        let err = e.fetch_since(0, 10).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::SourceQuery { source: SourceError::Timeout(_), .. }
        ));
    }

    #[tokio::test]
    async fn window_excludes_records_after_end() {
        let mut records = swaps_at(100, 0, 3);
        records.extend(swaps_at(200, 0, 3));
        records.push(SwapBuilder::new(300, 0).build());
        let (e, _src) = engine(MockSource::new(records), 2);
        let out = e.fetch_window(150, 200).await.unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|t| t.unix_ts() == 200));
        assert!(e.fetch_window(300, 100).await.unwrap().is_empty());
    }
}
