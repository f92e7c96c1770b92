use std::str::FromStr as _;

use chrono::DateTime;
use rust_decimal::Decimal;
use serde::Deserialize as _;

use crate::error::MalformedRecordError;
use crate::types::{CanonicalTrade, RawSwap};

const TX_HASH_BYTES: usize = 32;

/// Decode and normalize one raw swap record as returned by the indexer.
pub fn normalize(
    raw: &serde_json::Value,
    exchange_id: &str,
) -> Result<CanonicalTrade, MalformedRecordError> {
    let swap = RawSwap::deserialize(raw)
        .map_err(|e| MalformedRecordError::new(serde_field(&e), e.to_string()))?;
    normalize_swap(&swap, raw.clone(), exchange_id)
}

pub fn normalize_swap(
    swap: &RawSwap,
    source_data: serde_json::Value,
    exchange_id: &str,
) -> Result<CanonicalTrade, MalformedRecordError> {
    let transaction_hash = check_tx_hash(&swap.transaction.id)?;
    let log_index = parse_uint("logIndex", &swap.log_index)?;
    let block_number = parse_uint("transaction.blockNumber", &swap.transaction.block_number)?;
    let unix_ts = parse_uint("timestamp", &swap.timestamp)?;
    let trade_timestamp = i64::try_from(unix_ts)
        .ok()
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .ok_or_else(|| MalformedRecordError::new("timestamp", "out of range"))?;

    let token0 = non_empty("pool.token0.id", &swap.pool.token0.id)?;
    let token1 = non_empty("pool.token1.id", &swap.pool.token1.id)?;
    if token0.eq_ignore_ascii_case(token1) {
        return Err(MalformedRecordError::new(
            "pool.token1.id",
            "both pool legs reference the same token",
        ));
    }

    let amount0_in = parse_amount("amount0In", &swap.amount0_in)?;
    let amount0_out = parse_amount("amount0Out", &swap.amount0_out)?;
    let amount1_in = parse_amount("amount1In", &swap.amount1_in)?;
    let amount1_out = parse_amount("amount1Out", &swap.amount1_out)?;

    let (token_in, amount_in, dec_in, token_out, amount_out, dec_out) =
        if amount0_in > Decimal::ZERO {
            (token0, &swap.amount0_in, amount0_in, token1, &swap.amount1_out, amount1_out)
        } else if amount1_in > Decimal::ZERO {
            (token1, &swap.amount1_in, amount1_in, token0, &swap.amount0_out, amount0_out)
        } else {
            return Err(MalformedRecordError::new(
                "amount0In/amount1In",
                "no leg has a positive inbound amount",
            ));
        };

    let price = dec_out
        .checked_div(dec_in)
        .map(|p| p.normalize().to_string());

    let trader_address = swap
        .sender
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(CanonicalTrade {
        transaction_hash,
        log_index,
        base_token_address: token0.to_string(),
        quote_token_address: token1.to_string(),
        exchange_id: exchange_id.to_string(),
        trade_timestamp,
        block_number,
        trader_address,
        amount_in: amount_in.clone(),
        amount_out: amount_out.clone(),
        token_in_address: token_in.to_string(),
        token_out_address: token_out.to_string(),
        price,
        source_data,
    })
}

fn check_tx_hash(raw: &str) -> Result<String, MalformedRecordError> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let bytes = hex::decode(digits)
        .map_err(|e| MalformedRecordError::new("transaction.id", format!("not hex: {e}")))?;
    if bytes.len() != TX_HASH_BYTES {
        return Err(MalformedRecordError::new(
            "transaction.id",
            format!("expected {TX_HASH_BYTES} bytes, got {}", bytes.len()),
        ));
    }
    Ok(trimmed.to_string())
}

fn non_empty<'a>(field: &str, v: &'a str) -> Result<&'a str, MalformedRecordError> {
    let v = v.trim();
    if v.is_empty() {
        return Err(MalformedRecordError::new(field, "empty"));
    }
    Ok(v)
}

/// Base-10 only. Log indexes are compared numerically for tie-breaks, so anything the
/// indexer renders differently is rejected rather than guessed at.
fn parse_uint(field: &str, v: &str) -> Result<u64, MalformedRecordError> {
    let v = v.trim();
    if v.is_empty() || !v.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MalformedRecordError::new(
            field,
            format!("expected base-10 unsigned integer, got {v:?}"),
        ));
    }
    v.parse::<u64>()
        .map_err(|e| MalformedRecordError::new(field, e.to_string()))
}

fn parse_amount(field: &str, v: &str) -> Result<Decimal, MalformedRecordError> {
    let v = v.trim();
    let parsed = if v.contains(['e', 'E']) {
        Decimal::from_scientific(v)
    } else {
        Decimal::from_str(v)
    };
    parsed.map_err(|e| MalformedRecordError::new(field, format!("{v:?}: {e}")))
}

fn serde_field(e: &serde_json::Error) -> String {
    let msg = e.to_string();
    if !msg.starts_with("missing field") {
        return "record".to_string();
    }
    msg.split('`')
        .nth(1)
        .filter(|f| !f.is_empty())
        .unwrap_or("record")
        .to_string()
}
