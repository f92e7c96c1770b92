use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use swap_ingest::checkpoint::{CheckpointManager, CheckpointStore, FileCheckpointStore};
use swap_ingest::graceful_shutdown;
use swap_ingest::health::HealthCounters;
use swap_ingest::ingest::{IngestLoop, LoopConfig};
use swap_ingest::paginate::{PaginationConfig, PaginationEngine};
use swap_ingest::sink::{open_queue, TradeStore};
use swap_ingest::testing::{swaps_at, MemoryStore, MockSource};
use swap_ingest::types::CanonicalTrade;

const T0: u64 = 1_729_153_055;

fn build(
    source: Arc<MockSource>,
    queue: Arc<dyn swap_ingest::sink::TradeQueue>,
    store: Arc<MemoryStore>,
    checkpoints: Arc<dyn CheckpointStore>,
) -> IngestLoop<MockSource> {
    let health = Arc::new(HealthCounters::default());
    let engine = PaginationEngine::new(
        source,
        "aerodrome",
        PaginationConfig {
            page_size: 40,
            ..PaginationConfig::default()
        },
        health.clone(),
    );
    let mgr = CheckpointManager::new("aerodrome", checkpoints, u64::MAX, 1_024);
    let store: Arc<dyn TradeStore> = store;
    IngestLoop::new(
        engine,
        mgr,
        queue,
        store,
        LoopConfig {
            batch_size: 100,
            poll_interval: Duration::from_secs(60),
            backoff: Duration::from_secs(30),
            heartbeat: Duration::from_secs(120),
        },
        health,
    )
}

fn queued(path: &std::path::Path) -> Vec<CanonicalTrade> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn drains_backlog_then_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let queue_path = dir.path().join("buffer.jsonl");
    let queue_url = format!("file://{}", queue_path.display());
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::new(dir.path().join("cursors")));
    let store = Arc::new(MemoryStore::default());

    let mut records = Vec::new();
    for i in 0..25 {
        records.extend(swaps_at(T0 + i * 3, 0, 10));
    }
    let source = Arc::new(MockSource::new(records));

    {
        let queue = open_queue(&queue_url, "unused").await.unwrap();
        let mut lp = build(source.clone(), queue, store.clone(), checkpoints.clone());
        let (tx, rx) = graceful_shutdown::channel();
        let handle = tokio::spawn(async move { lp.run(rx).await });
        // Cycles at 0s, 60s, 120s and 180s.
        tokio::time::sleep(Duration::from_secs(190)).await;
        graceful_shutdown::request(&tx);
        let stats = handle.await.unwrap().unwrap();
        assert!(stats.cycles >= 3);
        assert_eq!(stats.trades_forwarded, 250);
        assert_eq!(stats.backoffs, 0);
    }

    assert_eq!(store.len(), 250);
    let cursor = checkpoints.load("aerodrome").await.unwrap().unwrap();
    assert_eq!(cursor.timestamp, T0 + 24 * 3);
    assert_eq!(cursor.last_seen_keys.len(), 10);

    // New swaps at the cursor timestamp and after it.
    source.push_records(swaps_at(T0 + 24 * 3, 10, 5));
    source.push_records(swaps_at(T0 + 100, 0, 5));

    {
        let queue = open_queue(&queue_url, "unused").await.unwrap();
        let mut lp = build(source.clone(), queue, store.clone(), checkpoints.clone());
        let (tx, rx) = graceful_shutdown::channel();
        let handle = tokio::spawn(async move { lp.run(rx).await });
        tokio::time::sleep(Duration::from_secs(10)).await;
        graceful_shutdown::request(&tx);
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.trades_forwarded, 10);
    }

    let lines = queued(&queue_path);
    assert_eq!(lines.len(), 260);
    let unique: HashSet<_> = lines.iter().map(CanonicalTrade::key).collect();
    assert_eq!(unique.len(), 260);
    assert_eq!(store.len(), 260);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_poll_sleep_is_prompt() {
    let source = Arc::new(MockSource::new(swaps_at(T0, 0, 3)));
    let store = Arc::new(MemoryStore::default());
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(swap_ingest::testing::MemoryCheckpointStore::default());
    let queue: Arc<dyn swap_ingest::sink::TradeQueue> =
        Arc::new(swap_ingest::testing::MemoryQueue::default());
    let mut lp = build(source, queue, store.clone(), checkpoints);

    let (tx, rx) = graceful_shutdown::channel();
    let started = tokio::time::Instant::now();
    let handle = tokio::spawn(async move { lp.run(rx).await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    graceful_shutdown::request(&tx);

    let stats = handle.await.unwrap().unwrap();
    assert_eq!(stats.cycles, 1);
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(store.len(), 3);
}
