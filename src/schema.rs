pub const SCHEMA_VERSION: &str = "raw_trades.v1";

/// Redis list the queue sink pushes onto (LPUSH, consumers RPOP).
pub const QUEUE_KEY_RAW_TRADES: &str = "raw_trades_buffer";

pub const FILE_CURSOR_SUFFIX: &str = ".cursor.json";

pub const TABLE_RAW_TRADES: &str = "raw_trades";
pub const TABLE_INGESTION_CURSORS: &str = "ingestion_cursors";

pub const RAW_TRADES_COLUMNS: [&str; 14] = [
    "transaction_hash",
    "log_index",
    "base_token_address",
    "quote_token_address",
    "dex_id",
    "trade_timestamp",
    "block_number",
    "trader_address",
    "amount_in",
    "token_in_address",
    "amount_out",
    "token_out_address",
    "price",
    "source_data_payload",
];

pub const RAW_TRADES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS raw_trades (
    transaction_hash     TEXT        NOT NULL,
    log_index            BIGINT      NOT NULL,
    base_token_address   TEXT        NOT NULL,
    quote_token_address  TEXT        NOT NULL,
    dex_id               TEXT        NOT NULL,
    trade_timestamp      TIMESTAMPTZ NOT NULL,
    block_number         BIGINT      NOT NULL,
    trader_address       TEXT,
    amount_in            NUMERIC     NOT NULL,
    token_in_address     TEXT        NOT NULL,
    amount_out           NUMERIC     NOT NULL,
    token_out_address    TEXT        NOT NULL,
    price                NUMERIC,
    source_data_payload  JSONB,
    ingested_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (transaction_hash, log_index)
)
"#;

pub const RAW_TRADES_TS_INDEX_DDL: &str = r#"
CREATE INDEX IF NOT EXISTS raw_trades_dex_ts_idx
    ON raw_trades (dex_id, trade_timestamp)
"#;

pub const INGESTION_CURSORS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS ingestion_cursors (
    source_id         TEXT        PRIMARY KEY,
    cursor_timestamp  BIGINT      NOT NULL,
    last_seen_keys    JSONB       NOT NULL DEFAULT '[]'::jsonb,
    updated_at        TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;
