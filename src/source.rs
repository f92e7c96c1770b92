use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SourceError;
use crate::json_util::parse_u64;
use crate::types::{LatestBlock, PageRequest};

/// Swaps strictly ordered by timestamp, filtered from `minTimestamp` inclusive.
pub const SWAPS_QUERY: &str = r#"
query GetRecentSwaps($first: Int!, $skip: Int!, $minTimestamp: BigInt!) {
  swaps(
    first: $first
    skip: $skip
    orderBy: timestamp
    orderDirection: asc
    where: { timestamp_gte: $minTimestamp }
  ) {
    id
    transaction { id blockNumber }
    timestamp
    pool {
      id
      token0 { id symbol decimals }
      token1 { id symbol decimals }
    }
    sender
    to
    amount0In
    amount0Out
    amount1In
    amount1Out
    logIndex
  }
}
"#;

pub const LATEST_BLOCK_QUERY: &str = r#"
query GetLatestBlock {
  _meta { block { number timestamp } }
}
"#;

const ERROR_BODY_MAX_CHARS: usize = 512;

#[async_trait]
pub trait SwapSource: Send + Sync {
    async fn latest_block(&self) -> Result<LatestBlock, SourceError>;

    /// One offset page of raw swap records, verbatim.
    async fn swaps_page(&self, req: &PageRequest) -> Result<Vec<serde_json::Value>, SourceError>;
}

#[derive(Serialize)]
struct GraphRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

#[derive(Deserialize)]
struct GraphResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Option<Vec<GraphErrorMessage>>,
}

#[derive(Deserialize)]
struct GraphErrorMessage {
    message: String,
}

#[derive(Deserialize)]
struct SwapsData {
    swaps: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct MetaData {
    #[serde(rename = "_meta")]
    meta: MetaBlock,
}

#[derive(Deserialize)]
struct MetaBlock {
    block: serde_json::Value,
}

/// GraphQL client bound to a single subgraph endpoint.
#[derive(Clone, Debug)]
pub struct GraphClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl GraphClient {
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("swap-ingest/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| SourceError::Transport(Box::new(e)))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, SourceError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&GraphRequest { query, variables })
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_MAX_CHARS).collect(),
            });
        }

        let body: GraphResponse<T> = resp
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        decode_response(body)
    }

    fn map_transport(&self, e: reqwest::Error) -> SourceError {
        if e.is_timeout() {
            SourceError::Timeout(self.timeout)
        } else {
            SourceError::Transport(Box::new(e))
        }
    }
}

#[async_trait]
impl SwapSource for GraphClient {
    async fn latest_block(&self) -> Result<LatestBlock, SourceError> {
        let data: MetaData = self
            .request(LATEST_BLOCK_QUERY, serde_json::json!({}))
            .await?;
        parse_meta_block(&data.meta.block)
    }

    async fn swaps_page(&self, req: &PageRequest) -> Result<Vec<serde_json::Value>, SourceError> {
        debug!(endpoint = %self.endpoint, %req, "swaps page");
        let data: SwapsData = self
            .request(
                SWAPS_QUERY,
                serde_json::json!({
                    "first": req.first,
                    "skip": req.skip,
                    "minTimestamp": req.min_timestamp.to_string(),
                }),
            )
            .await?;
        Ok(data.swaps)
    }
}

fn decode_response<T>(body: GraphResponse<T>) -> Result<T, SourceError> {
    if let Some(errors) = body.errors.filter(|e| !e.is_empty()) {
        let msg = errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join("; ");
        if is_offset_limit(&msg) {
            return Err(SourceError::OffsetLimit(msg));
        }
        return Err(SourceError::GraphQl(msg));
    }
    body.data
        .ok_or_else(|| SourceError::Decode("response has neither data nor errors".to_string()))
}

/// graph-node rejects deep offsets with e.g.
/// "The `skip` argument must be between 0 and 5000, but is 5100".
fn is_offset_limit(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("skip")
        && (lower.contains("between") || lower.contains("must") || lower.contains("exceed"))
}

fn parse_meta_block(block: &serde_json::Value) -> Result<LatestBlock, SourceError> {
    let block_number = parse_u64(block.get("number"))
        .ok_or_else(|| SourceError::Decode(format!("_meta.block.number missing: {block}")))?;
    let timestamp = parse_u64(block.get("timestamp"))
        .ok_or_else(|| SourceError::Decode(format!("_meta.block.timestamp missing: {block}")))?;
    Ok(LatestBlock {
        block_number,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn skip_rejection_is_classified_as_offset_limit() {
        let body: GraphResponse<SwapsData> = serde_json::from_value(json!({
            "errors": [{ "message": "The `skip` argument must be between 0 and 5000, but is 5100" }]
        }))
        .unwrap();
        assert!(matches!(decode_response(body), Err(SourceError::OffsetLimit(_))));
    }

    #[test]
    fn other_graphql_errors_stay_generic() {
        let body: GraphResponse<SwapsData> = serde_json::from_value(json!({
            "data": null,
            "errors": [{ "message": "indexing_error" }, { "message": "bad gateway" }]
        }))
        .unwrap();
        match decode_response(body) {
            Err(SourceError::GraphQl(msg)) => assert_eq!(msg, "indexing_error; bad gateway"),
            other => panic!("unexpected: {:?}", other.map(|d| d.swaps.len())),
        }
    }

    #[test]
    fn empty_errors_array_is_success() {
        let body: GraphResponse<SwapsData> = serde_json::from_value(json!({
            "data": { "swaps": [] },
            "errors": []
        }))
        .unwrap();
        assert!(decode_response(body).unwrap().swaps.is_empty());
    }

    #[test]
    fn meta_block_accepts_numbers_and_strings() {
        let b = parse_meta_block(&json!({ "number": 21_000_000, "timestamp": "1729153055" })).unwrap();
        assert_eq!(b.block_number, 21_000_000);
        assert_eq!(b.timestamp, 1_729_153_055);
        assert!(parse_meta_block(&json!({ "number": 1 })).is_err());
    }
}
