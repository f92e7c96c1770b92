use std::collections::BTreeSet;

use swap_ingest::checkpoint::{CheckpointStore, Cursor, PgCheckpointStore};
use swap_ingest::normalize::normalize;
use swap_ingest::sink::{PgTradeStore, TradeStore};
use swap_ingest::testing::SwapBuilder;
use swap_ingest::types::{now_secs, CanonicalTrade, TradeKey};

async fn store() -> Option<PgTradeStore> {
    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(v) if !v.trim().is_empty() => v,
        _ => {
            eprintln!("TEST_DATABASE_URL not set; skipping");
            return None;
        }
    };
    let store = PgTradeStore::connect(&url, 2).await.unwrap();
    store.ensure_schema().await.unwrap();
    Some(store)
}

fn trades(run: u128, range: std::ops::Range<u64>) -> Vec<CanonicalTrade> {
    range
        .map(|i| {
            let raw = SwapBuilder::new(now_secs(), i)
                .tx(format!("0x{run:032x}{i:032x}"))
                .build();
            normalize(&raw, "pg-test").unwrap()
        })
        .collect()
}

#[tokio::test]
async fn overlapping_batches_leave_one_row_per_key() {
    let Some(store) = store().await else { return };
    // Fresh transaction hashes per run so reruns against the same database stay independent.
    let run = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();

    let first = trades(run, 0..6);
    let second = trades(run, 3..9);
    assert_eq!(store.upsert_batch(&first).await.unwrap(), 6);
    assert_eq!(store.upsert_batch(&second).await.unwrap(), 3);
    assert_eq!(store.upsert_batch(&second).await.unwrap(), 0);

    let hashes: Vec<String> = trades(run, 0..9).iter().map(|t| t.transaction_hash.clone()).collect();
    let rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM raw_trades WHERE transaction_hash = ANY($1)",
    )
    .bind(&hashes[..])
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(rows, 9);
}

#[tokio::test]
async fn cursor_row_round_trips() {
    let Some(store) = store().await else { return };
    let cp = PgCheckpointStore::new(store.pool().clone());
    cp.ensure_schema().await.unwrap();

    let source_id = format!("pg-test-{}", std::process::id());
    let cursor = Cursor {
        timestamp: 1_729_153_055,
        last_seen_keys: BTreeSet::from([TradeKey::new("0xabc", 1), TradeKey::new("0xabc", 2)]),
    };
    cp.save(&source_id, &cursor).await.unwrap();
    assert_eq!(cp.load(&source_id).await.unwrap(), Some(cursor));
    assert!(cp.delete(&source_id).await.unwrap());
    assert_eq!(cp.load(&source_id).await.unwrap(), None);
}
