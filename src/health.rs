use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::types::now_ms;

/// Process-wide counters shared by the pagination engine and the loop of one source.
#[derive(Default)]
pub struct HealthCounters {
    pages_fetched: AtomicU64,
    reanchors: AtomicU64,
    records_malformed: AtomicU64,
    records_duplicate: AtomicU64,
    cycles: AtomicU64,
    trades_forwarded: AtomicU64,
    rows_inserted: AtomicU64,
    backoffs: AtomicU64,
    cursor_ts: AtomicU64,
    last_cycle_ms: AtomicU64,
}

impl HealthCounters {
    pub fn inc_pages_fetched(&self, n: u64) {
        self.pages_fetched.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_reanchors(&self, n: u64) {
        self.reanchors.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_records_malformed(&self, n: u64) {
        self.records_malformed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_records_duplicate(&self, n: u64) {
        self.records_duplicate.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_cycles(&self, n: u64) {
        self.cycles.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_trades_forwarded(&self, n: u64) {
        self.trades_forwarded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_rows_inserted(&self, n: u64) {
        self.rows_inserted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_backoffs(&self, n: u64) {
        self.backoffs.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_cursor_ts(&self, ts: u64) {
        self.cursor_ts.store(ts, Ordering::Relaxed);
    }

    pub fn set_last_cycle_ms(&self, ts_ms: u64) {
        self.last_cycle_ms.store(ts_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            ts_ms: now_ms(),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            reanchors: self.reanchors.load(Ordering::Relaxed),
            records_malformed: self.records_malformed.load(Ordering::Relaxed),
            records_duplicate: self.records_duplicate.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            trades_forwarded: self.trades_forwarded.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            backoffs: self.backoffs.load(Ordering::Relaxed),
            cursor_ts: self.cursor_ts.load(Ordering::Relaxed),
            last_cycle_ms: self.last_cycle_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub ts_ms: u64,
    pub pages_fetched: u64,
    pub reanchors: u64,
    pub records_malformed: u64,
    pub records_duplicate: u64,
    pub cycles: u64,
    pub trades_forwarded: u64,
    pub rows_inserted: u64,
    pub backoffs: u64,
    pub cursor_ts: u64,
    pub last_cycle_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let h = HealthCounters::default();
        h.inc_pages_fetched(3);
        h.inc_reanchors(1);
        h.inc_trades_forwarded(250);
        h.inc_trades_forwarded(50);
        h.set_cursor_ts(1_729_153_055);
        h.set_cursor_ts(1_729_153_060);

        let s = h.snapshot();
        assert_eq!(s.pages_fetched, 3);
        assert_eq!(s.reanchors, 1);
        assert_eq!(s.trades_forwarded, 300);
        assert_eq!(s.cursor_ts, 1_729_153_060);
        assert_eq!(s.backoffs, 0);
        assert!(s.ts_ms > 0);
    }
}
