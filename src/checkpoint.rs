use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row as _;
use tracing::{info, warn};

use crate::error::CheckpointError;
use crate::schema::{FILE_CURSOR_SUFFIX, INGESTION_CURSORS_DDL, TABLE_INGESTION_CURSORS};
use crate::types::{now_secs, CanonicalTrade, TradeKey};

/// Position after the last forwarded batch.
///
/// `last_seen_keys` are the trades already forwarded at exactly `timestamp`; the next
/// fetch starts at `timestamp` inclusive and filters them out.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub timestamp: u64,
    #[serde(default)]
    pub last_seen_keys: BTreeSet<TradeKey>,
}

impl Cursor {
    pub fn starting_at(timestamp: u64) -> Self {
        Self {
            timestamp,
            last_seen_keys: BTreeSet::new(),
        }
    }
}

/// Pure cursor step. Never moves backward; an empty batch leaves the cursor as is.
///
/// Every forwarded key at the new timestamp is kept. Dropping any of them would let the
/// next fetch return the same trades and crowd out the ones not yet delivered.
pub fn advance_cursor(cursor: &Cursor, batch: &[CanonicalTrade]) -> Cursor {
    let Some(last) = batch.last() else {
        return cursor.clone();
    };
    let last_ts = last.unix_ts();
    if last_ts < cursor.timestamp {
        return cursor.clone();
    }

    let at_last = batch
        .iter()
        .filter(|t| t.unix_ts() == last_ts)
        .map(CanonicalTrade::key);

    let keys: BTreeSet<TradeKey> = if last_ts == cursor.timestamp {
        cursor.last_seen_keys.iter().cloned().chain(at_last).collect()
    } else {
        at_last.collect()
    };

    Cursor {
        timestamp: last_ts,
        last_seen_keys: keys,
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, source_id: &str) -> Result<Option<Cursor>, CheckpointError>;

    async fn save(&self, source_id: &str, cursor: &Cursor) -> Result<(), CheckpointError>;

    /// Returns whether a cursor existed.
    async fn delete(&self, source_id: &str) -> Result<bool, CheckpointError>;
}

/// Cursor ownership for one exchange source.
pub struct CheckpointManager {
    source_id: String,
    store: Arc<dyn CheckpointStore>,
    lookback_secs: u64,
    max_keys: usize,
}

impl CheckpointManager {
    pub fn new(
        source_id: impl Into<String>,
        store: Arc<dyn CheckpointStore>,
        lookback_secs: u64,
        max_keys: usize,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            store,
            lookback_secs,
            max_keys,
        }
    }

    pub async fn load(&self) -> Result<Cursor, CheckpointError> {
        self.load_at(now_secs()).await
    }

    /// Like `load`, with the first-run lookback measured from `now_secs`.
    pub async fn load_at(&self, now_secs: u64) -> Result<Cursor, CheckpointError> {
        if let Some(cursor) = self.store.load(&self.source_id).await? {
            info!(
                source = %self.source_id,
                cursor_ts = cursor.timestamp,
                boundary_keys = cursor.last_seen_keys.len(),
                "resuming from persisted cursor"
            );
            return Ok(cursor);
        }
        let start = now_secs.saturating_sub(self.lookback_secs);
        info!(
            source = %self.source_id,
            cursor_ts = start,
            lookback_secs = self.lookback_secs,
            "no persisted cursor; starting from lookback window"
        );
        Ok(Cursor::starting_at(start))
    }

    /// `max_keys` is a warning threshold only; the key set is never truncated.
    pub fn advance(&self, cursor: &Cursor, batch: &[CanonicalTrade]) -> Cursor {
        let next = advance_cursor(cursor, batch);
        if next.last_seen_keys.len() > self.max_keys {
            warn!(
                source = %self.source_id,
                cursor_ts = next.timestamp,
                boundary_keys = next.last_seen_keys.len(),
                max_keys = self.max_keys,
                "boundary key set above configured size"
            );
        }
        next
    }

    pub async fn persist(&self, cursor: &Cursor) -> Result<(), CheckpointError> {
        self.store.save(&self.source_id, cursor).await
    }

    pub async fn reset(&self) -> Result<bool, CheckpointError> {
        self.store.delete(&self.source_id).await
    }
}

/// One JSON file per source under `dir`. Writes go to a temp file that is renamed over
/// the previous cursor, so a crash leaves either the old or the new cursor.
#[derive(Clone, Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, source_id: &str) -> PathBuf {
        let safe: String = source_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}{FILE_CURSOR_SUFFIX}"))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, source_id: &str) -> Result<Option<Cursor>, CheckpointError> {
        let path = self.path_for(source_id);
        let raw = match std::fs::read(&path) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path, e)),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn save(&self, source_id: &str, cursor: &Cursor) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let path = self.path_for(source_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(cursor)?;
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<bool, CheckpointError> {
        let path = self.path_for(source_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path, e)),
        }
    }
}

/// Cursor rows in `ingestion_cursors`, next to the trade table.
#[derive(Clone, Debug)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), CheckpointError> {
        sqlx::query(INGESTION_CURSORS_DDL).execute(&self.pool).await?;
        Ok(())
    }
}

/// A negative column value is a corrupt row, not the epoch.
fn cursor_ts_from_row(source_id: &str, timestamp: i64) -> Result<u64, CheckpointError> {
    u64::try_from(timestamp).map_err(|_| CheckpointError::Corrupt {
        source_id: source_id.to_string(),
        reason: format!("negative cursor_timestamp {timestamp}"),
    })
}

fn cursor_ts_to_row(source_id: &str, timestamp: u64) -> Result<i64, CheckpointError> {
    i64::try_from(timestamp).map_err(|_| CheckpointError::Corrupt {
        source_id: source_id.to_string(),
        reason: format!("cursor_timestamp {timestamp} exceeds BIGINT"),
    })
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, source_id: &str) -> Result<Option<Cursor>, CheckpointError> {
        let row = sqlx::query(&format!(
            "SELECT cursor_timestamp, last_seen_keys FROM {TABLE_INGESTION_CURSORS} WHERE source_id = $1"
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let timestamp: i64 = row.try_get("cursor_timestamp")?;
        let keys: sqlx::types::Json<BTreeSet<TradeKey>> = row.try_get("last_seen_keys")?;
        Ok(Some(Cursor {
            timestamp: cursor_ts_from_row(source_id, timestamp)?,
            last_seen_keys: keys.0,
        }))
    }

    async fn save(&self, source_id: &str, cursor: &Cursor) -> Result<(), CheckpointError> {
        sqlx::query(&format!(
            "INSERT INTO {TABLE_INGESTION_CURSORS} (source_id, cursor_timestamp, last_seen_keys, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (source_id) DO UPDATE SET \
               cursor_timestamp = EXCLUDED.cursor_timestamp, \
               last_seen_keys = EXCLUDED.last_seen_keys, \
               updated_at = now()"
        ))
        .bind(source_id)
        .bind(cursor_ts_to_row(source_id, cursor.timestamp)?)
        .bind(sqlx::types::Json(&cursor.last_seen_keys))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<bool, CheckpointError> {
        let res = sqlx::query(&format!(
            "DELETE FROM {TABLE_INGESTION_CURSORS} WHERE source_id = $1"
        ))
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }
}
