use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};

use super::TradeStore;
use crate::error::SinkError;
use crate::schema::{
    RAW_TRADES_COLUMNS, RAW_TRADES_DDL, RAW_TRADES_TS_INDEX_DDL, SCHEMA_VERSION, TABLE_RAW_TRADES,
};
use crate::types::CanonicalTrade;

const BACKEND: &str = "postgres";

// Postgres caps a statement at 65535 bind parameters.
const ROWS_PER_STATEMENT: usize = 1_000;

/// `raw_trades` writer. Conflicts on `(transaction_hash, log_index)` are ignored.
#[derive(Clone, Debug)]
pub struct PgTradeStore {
    pool: PgPool,
}

impl PgTradeStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(store_err)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), SinkError> {
        for ddl in [RAW_TRADES_DDL, RAW_TRADES_TS_INDEX_DDL] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        info!(schema = SCHEMA_VERSION, table = TABLE_RAW_TRADES, "trade table ready");
        Ok(())
    }
}

#[async_trait]
impl TradeStore for PgTradeStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn upsert_batch(&self, trades: &[CanonicalTrade]) -> Result<u64, SinkError> {
        if trades.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0u64;
        for chunk in trades.chunks(ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {TABLE_RAW_TRADES} ({}) ",
                RAW_TRADES_COLUMNS.join(", ")
            ));
            qb.push_values(chunk, |mut row, t| {
                row.push_bind(t.transaction_hash.clone())
                    .push_bind(t.log_index as i64)
                    .push_bind(t.base_token_address.clone())
                    .push_bind(t.quote_token_address.clone())
                    .push_bind(t.exchange_id.clone())
                    .push_bind(t.trade_timestamp)
                    .push_bind(t.block_number as i64)
                    .push_bind(t.trader_address.clone())
                    .push_bind(t.amount_in.clone())
                    .push_unseparated("::numeric")
                    .push_bind(t.token_in_address.clone())
                    .push_bind(t.amount_out.clone())
                    .push_unseparated("::numeric")
                    .push_bind(t.token_out_address.clone())
                    .push_bind(t.price.clone())
                    .push_unseparated("::numeric")
                    .push_bind(sqlx::types::Json(t.source_data.clone()));
            });
            qb.push(" ON CONFLICT (transaction_hash, log_index) DO NOTHING");

            let res = qb.build().execute(&self.pool).await.map_err(store_err)?;
            inserted += res.rows_affected();
        }

        debug!(
            batch = trades.len(),
            inserted,
            ignored = trades.len() as u64 - inserted.min(trades.len() as u64),
            "raw trades upserted"
        );
        Ok(inserted)
    }
}

fn store_err(e: sqlx::Error) -> SinkError {
    SinkError::Store {
        backend: BACKEND,
        source: Box::new(e),
    }
}
