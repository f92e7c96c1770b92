use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::ingest::LoopConfig;
use crate::paginate::PaginationConfig;

// Hosted indexers cap `first` at 1000.
const MAX_PAGE_SIZE: usize = 1_000;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// One JSON file per source under `ingest.checkpoint_dir`.
    #[default]
    File,
    /// `ingestion_cursors` table in the trade store database.
    Store,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IngestConfig {
    /// `redis://host:port/db` or `file://<path>.jsonl`. Required.
    #[serde(default)]
    pub queue_url: String,
    /// Postgres connection string. Required.
    #[serde(default)]
    pub store_url: String,
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// First-run cursor: `now - lookback_secs`.
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
    #[serde(default = "default_max_boundary_keys")]
    pub max_boundary_keys: usize,
    #[serde(default)]
    pub checkpoint: CheckpointMode,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_store_max_connections")]
    pub store_max_connections: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            store_url: String::new(),
            polling_interval_ms: default_polling_interval_ms(),
            batch_size: default_batch_size(),
            backoff_ms: default_backoff_ms(),
            lookback_secs: default_lookback_secs(),
            max_boundary_keys: default_max_boundary_keys(),
            checkpoint: CheckpointMode::default(),
            checkpoint_dir: default_checkpoint_dir(),
            heartbeat_secs: default_heartbeat_secs(),
            store_max_connections: default_store_max_connections(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Name of the environment variable holding the gateway API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Proactive re-anchor depth; 0 disables and relies on the source's rejection.
    #[serde(default = "default_max_skip")]
    pub max_skip: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            api_key_env: default_api_key_env(),
            page_size: default_page_size(),
            max_skip: default_max_skip(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SourceConfig {
    pub exchange_id: String,
    /// Full subgraph URL. Takes precedence over `subgraph_id`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub subgraph_id: Option<String>,
}

fn default_polling_interval_ms() -> u64 {
    60_000
}

fn default_batch_size() -> usize {
    100
}

fn default_backoff_ms() -> u64 {
    30_000
}

fn default_lookback_secs() -> u64 {
    86_400
}

fn default_max_boundary_keys() -> usize {
    1_024
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("data/checkpoints")
}

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_store_max_connections() -> u32 {
    4
}

fn default_gateway_url() -> String {
    "https://gateway.thegraph.com/api".to_string()
}

fn default_api_key_env() -> String {
    "GRAPH_API_KEY".to_string()
}

fn default_page_size() -> usize {
    100
}

fn default_max_skip() -> usize {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn required(key: &str, v: &str) -> Result<(), ConfigError> {
            if v.trim().is_empty() {
                return Err(ConfigError::invalid(key, "required"));
            }
            Ok(())
        }
        fn positive(key: &str, v: u64) -> Result<(), ConfigError> {
            if v == 0 {
                return Err(ConfigError::invalid(key, "must be > 0"));
            }
            Ok(())
        }

        required("ingest.queue_url", &self.ingest.queue_url)?;
        required("ingest.store_url", &self.ingest.store_url)?;
        positive("ingest.polling_interval_ms", self.ingest.polling_interval_ms)?;
        positive("ingest.batch_size", self.ingest.batch_size as u64)?;
        positive("ingest.max_boundary_keys", self.ingest.max_boundary_keys as u64)?;
        if self.ingest.max_boundary_keys < self.ingest.batch_size {
            return Err(ConfigError::invalid(
                "ingest.max_boundary_keys",
                format!(
                    "must be >= ingest.batch_size ({}), got {}",
                    self.ingest.batch_size, self.ingest.max_boundary_keys
                ),
            ));
        }
        positive("ingest.heartbeat_secs", self.ingest.heartbeat_secs)?;
        positive("ingest.store_max_connections", u64::from(self.ingest.store_max_connections))?;
        positive("graph.request_timeout_ms", self.graph.request_timeout_ms)?;
        positive("graph.connect_timeout_ms", self.graph.connect_timeout_ms)?;

        if self.graph.page_size == 0 || self.graph.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::invalid(
                "graph.page_size",
                format!("must be in [1, {MAX_PAGE_SIZE}], got {}", self.graph.page_size),
            ));
        }
        if self.graph.max_skip != 0 && self.graph.max_skip < self.graph.page_size {
            return Err(ConfigError::invalid(
                "graph.max_skip",
                format!(
                    "must be 0 or >= graph.page_size ({}), got {}",
                    self.graph.page_size, self.graph.max_skip
                ),
            ));
        }

        if self.sources.is_empty() {
            return Err(ConfigError::invalid("sources", "at least one [[sources]] entry required"));
        }
        let mut seen = HashSet::new();
        for (i, s) in self.sources.iter().enumerate() {
            required(&format!("sources[{i}].exchange_id"), &s.exchange_id)?;
            if !seen.insert(s.exchange_id.as_str()) {
                return Err(ConfigError::invalid(
                    format!("sources[{i}].exchange_id"),
                    format!("duplicate exchange_id {:?}", s.exchange_id),
                ));
            }
            let has_endpoint = s.endpoint.as_deref().is_some_and(|v| !v.trim().is_empty());
            let has_subgraph = s.subgraph_id.as_deref().is_some_and(|v| !v.trim().is_empty());
            if !has_endpoint && !has_subgraph {
                return Err(ConfigError::invalid(
                    format!("sources[{i}].endpoint"),
                    "either endpoint or subgraph_id is required",
                ));
            }
        }
        Ok(())
    }

    pub fn source(&self, exchange_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.exchange_id == exchange_id)
    }

    /// Resolves the subgraph URL, reading the API key from `graph.api_key_env` when the
    /// source is addressed by subgraph id.
    pub fn endpoint_for(&self, source: &SourceConfig) -> Result<String, ConfigError> {
        let key = std::env::var(&self.graph.api_key_env).ok();
        self.endpoint_with_key(source, key.as_deref())
    }

    pub fn endpoint_with_key(
        &self,
        source: &SourceConfig,
        api_key: Option<&str>,
    ) -> Result<String, ConfigError> {
        if let Some(endpoint) = source.endpoint.as_deref().filter(|v| !v.trim().is_empty()) {
            return Ok(endpoint.trim().to_string());
        }
        let id = source.subgraph_id.as_deref().unwrap_or_default().trim();
        let key = api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ConfigError::invalid(
                    format!("env {}", self.graph.api_key_env),
                    format!("API key required for subgraph {id} ({})", source.exchange_id),
                )
            })?;
        Ok(format!(
            "{}/{key}/subgraphs/id/{id}",
            self.graph.gateway_url.trim_end_matches('/')
        ))
    }

    pub fn max_skip(&self) -> Option<usize> {
        (self.graph.max_skip > 0).then_some(self.graph.max_skip)
    }

    pub fn pagination(&self) -> PaginationConfig {
        PaginationConfig {
            page_size: self.graph.page_size,
            max_skip: self.max_skip(),
            page_timeout: Duration::from_millis(self.graph.request_timeout_ms),
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            batch_size: self.ingest.batch_size,
            poll_interval: Duration::from_millis(self.ingest.polling_interval_ms),
            backoff: Duration::from_millis(self.ingest.backoff_ms),
            heartbeat: Duration::from_secs(self.ingest.heartbeat_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [ingest]
        queue_url = "redis://127.0.0.1:6379/0"
        store_url = "postgres://ingest@localhost/trades"

        [[sources]]
        exchange_id = "aerodrome"
        subgraph_id = "GENunSHWLBXm59mBSgPzQ8metBEp9YDfdqwFr91Av1UM"
    "#;

    fn invalid_key(raw: &str) -> String {
        match Config::from_toml_str(raw) {
            Err(ConfigError::Invalid { key, .. }) => key,
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn defaults_apply() {
        let cfg = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.ingest.polling_interval_ms, 60_000);
        assert_eq!(cfg.ingest.batch_size, 100);
        assert_eq!(cfg.ingest.backoff_ms, 30_000);
        assert_eq!(cfg.ingest.checkpoint, CheckpointMode::File);
        assert_eq!(cfg.graph.page_size, 100);
        assert_eq!(cfg.max_skip(), Some(5_000));
        assert_eq!(cfg.loop_config().poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.pagination().page_timeout, Duration::from_secs(10));
    }

    #[test]
    fn example_config_is_valid() {
        let cfg = Config::from_toml_str(include_str!("../config.example.toml")).unwrap();
        assert_eq!(cfg.sources.len(), 1);
        assert!(cfg.source("aerodrome").is_some());
    }

    #[test]
    fn missing_queue_url_is_named() {
        let raw = MINIMAL.replace("queue_url = \"redis://127.0.0.1:6379/0\"", "");
        assert_eq!(invalid_key(&raw), "ingest.queue_url");
    }

    #[test]
    fn missing_store_url_is_named() {
        let raw = MINIMAL.replace("store_url = \"postgres://ingest@localhost/trades\"", "");
        assert_eq!(invalid_key(&raw), "ingest.store_url");
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let raw = MINIMAL.replace("[ingest]", "[ingest]\nbatch_size = 0");
        assert_eq!(invalid_key(&raw), "ingest.batch_size");
    }

    #[test]
    fn boundary_keys_below_batch_size_are_rejected() {
        let raw = MINIMAL.replace("[ingest]", "[ingest]\nbatch_size = 100\nmax_boundary_keys = 4");
        assert_eq!(invalid_key(&raw), "ingest.max_boundary_keys");
    }

    #[test]
    fn source_needs_an_address() {
        let raw = MINIMAL.replace(
            "subgraph_id = \"GENunSHWLBXm59mBSgPzQ8metBEp9YDfdqwFr91Av1UM\"",
            "",
        );
        assert_eq!(invalid_key(&raw), "sources[0].endpoint");
    }

    #[test]
    fn no_sources_is_rejected() {
        let raw = r#"
            [ingest]
            queue_url = "file://data/trades.jsonl"
            store_url = "postgres://localhost/trades"
        "#;
        assert_eq!(invalid_key(raw), "sources");
    }

    #[test]
    fn zero_max_skip_disables_proactive_reanchor() {
        let raw = format!("{MINIMAL}\n[graph]\nmax_skip = 0\n");
        let cfg = Config::from_toml_str(&raw).unwrap();
        assert_eq!(cfg.pagination().max_skip, None);
    }

    #[test]
    fn gateway_endpoint_uses_api_key() {
        let cfg = Config::from_toml_str(MINIMAL).unwrap();
        let src = &cfg.sources[0];
        let url = cfg.endpoint_with_key(src, Some("k3y")).unwrap();
        assert_eq!(
            url,
            "https://gateway.thegraph.com/api/k3y/subgraphs/id/GENunSHWLBXm59mBSgPzQ8metBEp9YDfdqwFr91Av1UM"
        );
        assert!(matches!(
            cfg.endpoint_with_key(src, None),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn explicit_endpoint_wins() {
        let raw = MINIMAL.replace(
            "exchange_id = \"aerodrome\"",
            "exchange_id = \"aerodrome\"\nendpoint = \"http://localhost:8000/subgraphs/name/aero\"",
        );
        let cfg = Config::from_toml_str(&raw).unwrap();
        let url = cfg.endpoint_with_key(&cfg.sources[0], None).unwrap();
        assert_eq!(url, "http://localhost:8000/subgraphs/name/aero");
    }
}
