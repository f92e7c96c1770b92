use std::collections::HashSet;
use std::sync::Arc;

use swap_ingest::error::FetchError;
use swap_ingest::health::HealthCounters;
use swap_ingest::paginate::{PaginationConfig, PaginationEngine};
use swap_ingest::testing::{swaps_at, MockSource};
use swap_ingest::types::{CanonicalTrade, TradeKey};

const T0: u64 = 1_729_153_055;

fn engine(
    source: MockSource,
    page_size: usize,
    max_skip: Option<usize>,
) -> (PaginationEngine<MockSource>, Arc<MockSource>, Arc<HealthCounters>) {
    let source = Arc::new(source);
    let health = Arc::new(HealthCounters::default());
    let cfg = PaginationConfig {
        page_size,
        max_skip,
        ..PaginationConfig::default()
    };
    let e = PaginationEngine::new(source.clone(), "aerodrome", cfg, health.clone());
    (e, source, health)
}

/// `total` swaps, `per_ts` per second starting at `T0`.
fn grouped(total: usize, per_ts: usize) -> Vec<serde_json::Value> {
    let mut out = Vec::with_capacity(total);
    let mut ts = T0;
    while out.len() < total {
        let n = per_ts.min(total - out.len());
        out.extend(swaps_at(ts, 0, n));
        ts += 1;
    }
    out
}

fn assert_ordered_and_unique(trades: &[CanonicalTrade]) {
    let mut seen: HashSet<TradeKey> = HashSet::new();
    for t in trades {
        assert!(seen.insert(t.key()), "duplicate {}", t.key());
    }
    for w in trades.windows(2) {
        let a = (w[0].unix_ts(), w[0].log_index);
        let b = (w[1].unix_ts(), w[1].log_index);
        assert!(a <= b, "out of order: {a:?} then {b:?}");
    }
}

#[tokio::test]
async fn two_timestamps_across_two_pages() {
    let mut records = swaps_at(T0, 0, 80);
    records.extend(swaps_at(T0 + 12, 0, 70));
    let (e, src, _) = engine(MockSource::new(records), 100, Some(5_000));

    let out = e.fetch_since(T0, 150).await.unwrap();
    assert_eq!(out.len(), 150);
    assert_ordered_and_unique(&out);
    assert!(out[..80].iter().all(|t| t.unix_ts() == T0));
    assert!(out[80..].iter().all(|t| t.unix_ts() == T0 + 12));
    // Insertion order within each timestamp.
    assert_eq!(out[0].log_index, 0);
    assert_eq!(out[79].log_index, 79);
    assert_eq!(out[80].log_index, 0);

    let skips: Vec<usize> = src.requests().iter().map(|r| r.skip).collect();
    assert_eq!(skips, vec![0, 100]);
}

#[tokio::test]
async fn never_exceeds_max_results_nor_goes_below_min_timestamp() {
    let (e, _, _) = engine(MockSource::new(grouped(450, 7)), 100, Some(5_000));
    for (min_ts, n) in [(T0, 1), (T0, 99), (T0 + 10, 100), (T0 + 30, 250), (T0 + 60, 1_000)] {
        let out = e.fetch_since(min_ts, n).await.unwrap();
        assert!(out.len() <= n, "{} > {n}", out.len());
        assert!(out.iter().all(|t| t.unix_ts() >= min_ts));
        assert_ordered_and_unique(&out);
    }
}

#[tokio::test]
async fn reanchors_when_source_rejects_deep_offset() {
    // Groups of 70 so the re-anchor lands in the middle of a timestamp tie.
    let records = grouped(6_000, 70);
    let (e, src, health) = engine(MockSource::new(records).with_max_skip(5_000), 100, None);

    let out = e.fetch_since(T0, 10_000).await.unwrap();
    assert_eq!(out.len(), 6_000);
    assert_ordered_and_unique(&out);
    assert!(health.snapshot().reanchors >= 1);

    let reqs = src.requests();
    assert!(reqs.iter().any(|r| r.skip > 5_000), "ceiling never hit");
    assert!(reqs.iter().any(|r| r.skip == 0 && r.min_timestamp > T0));
}

#[tokio::test]
async fn reanchors_proactively_at_configured_depth() {
    let records = grouped(6_000, 70);
    let (e, src, health) = engine(MockSource::new(records), 100, Some(5_000));

    let out = e.fetch_since(T0, 10_000).await.unwrap();
    assert_eq!(out.len(), 6_000);
    assert_ordered_and_unique(&out);
    assert!(health.snapshot().reanchors >= 1);
    assert!(src.requests().iter().all(|r| r.skip <= 5_000));
}

#[tokio::test]
async fn tie_larger_than_ceiling_stalls() {
    let records = swaps_at(T0, 0, 5_200);
    let (e, _, _) = engine(MockSource::new(records).with_max_skip(5_000), 100, None);

    let err = e.fetch_since(T0, 10_000).await.unwrap_err();
    assert!(matches!(err, FetchError::Stalled { timestamp, .. } if timestamp == T0));
}

#[tokio::test]
async fn future_timestamp_is_empty_not_an_error() {
    let (e, src, _) = engine(MockSource::new(grouped(300, 10)), 100, Some(5_000));
    let out = e.fetch_since(T0 + 86_400, 100).await.unwrap();
    assert!(out.is_empty());
    assert_eq!(src.requests().len(), 1);
}

#[tokio::test]
async fn window_is_inclusive_on_both_ends() {
    let (e, _, _) = engine(MockSource::new(grouped(600, 9)), 50, Some(5_000));
    let (a, b) = (T0 + 5, T0 + 20);

    let out = e.fetch_window(a, b).await.unwrap();
    assert_eq!(out.len(), 16 * 9);
    assert!(out.iter().all(|t| (a..=b).contains(&t.unix_ts())));
    assert_eq!(out.first().map(|t| t.unix_ts()), Some(a));
    assert_eq!(out.last().map(|t| t.unix_ts()), Some(b));
    assert_ordered_and_unique(&out);
}
