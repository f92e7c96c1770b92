use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use swap_ingest::checkpoint::{
    CheckpointManager, CheckpointStore, FileCheckpointStore, PgCheckpointStore,
};
use swap_ingest::config::{CheckpointMode, Config, SourceConfig};
use swap_ingest::graceful_shutdown;
use swap_ingest::health::HealthCounters;
use swap_ingest::ingest::{IngestLoop, LoopStats};
use swap_ingest::paginate::PaginationEngine;
use swap_ingest::schema::QUEUE_KEY_RAW_TRADES;
use swap_ingest::sink::{open_queue, PgTradeStore, TradeQueue, TradeStore};
use swap_ingest::source::GraphClient;

#[derive(Parser, Debug)]
#[command(
    name = "swap-ingest",
    version,
    about = "Subgraph swap ingestion into a Redis buffer and Postgres"
)]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll every configured source until Ctrl-C (default).
    Run {
        /// Restrict to these exchange ids.
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Print the indexer's latest block for a source.
    LatestBlock {
        #[arg(long)]
        source: String,
    },
    /// Forward `[start, end]` (unix seconds) once, leaving the cursor untouched.
    Backfill {
        #[arg(long)]
        source: String,
        #[arg(long)]
        start: u64,
        #[arg(long)]
        end: u64,
    },
    /// Delete the persisted cursor so the next run starts from the lookback window.
    ResetCursor {
        #[arg(long)]
        source: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;

    match args.command.unwrap_or(Command::Run { sources: Vec::new() }) {
        Command::Run { sources } => run(cfg, &sources).await,
        Command::LatestBlock { source } => latest_block(&cfg, &source).await,
        Command::Backfill { source, start, end } => backfill(&cfg, &source, start, end).await,
        Command::ResetCursor { source } => reset_cursor(&cfg, &source).await,
    }
}

async fn run(cfg: Config, only: &[String]) -> anyhow::Result<()> {
    let selected: Vec<SourceConfig> = cfg
        .sources
        .iter()
        .filter(|s| only.is_empty() || only.contains(&s.exchange_id))
        .cloned()
        .collect();
    if selected.is_empty() {
        return Err(anyhow!("no configured source matches {only:?}"));
    }

    let queue = open_queue(&cfg.ingest.queue_url, QUEUE_KEY_RAW_TRADES)
        .await
        .context("open queue")?;
    let store = connect_store(&cfg).await?;
    let checkpoints = open_checkpoints(&cfg, Some(&store)).await?;

    let (shutdown_tx, shutdown_rx) = graceful_shutdown::channel();
    let shutdown_tx = Arc::new(shutdown_tx);
    let ctrl_c = graceful_shutdown::spawn_ctrl_c(shutdown_tx.clone());

    let mut tasks: JoinSet<(String, anyhow::Result<LoopStats>)> = JoinSet::new();
    for source in selected {
        let mut lp = build_loop(&cfg, &source, queue.clone(), store.clone(), checkpoints.clone())?;
        let rx = shutdown_rx.clone();
        let id = source.exchange_id.clone();
        tasks.spawn(async move {
            let res = lp.run(rx).await.map_err(anyhow::Error::from);
            (id, res)
        });
    }

    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, Ok(stats))) => info!(
                exchange = %id,
                cycles = stats.cycles,
                trades_forwarded = stats.trades_forwarded,
                rows_inserted = stats.rows_inserted,
                backoffs = stats.backoffs,
                "source stopped"
            ),
            Ok((id, Err(e))) => {
                error!(exchange = %id, error = %e, "source failed; stopping all sources");
                graceful_shutdown::request(&shutdown_tx);
                failure.get_or_insert(e.context(format!("ingest {id}")));
            }
            Err(e) => {
                error!(error = %e, "ingest task panicked");
                graceful_shutdown::request(&shutdown_tx);
                failure.get_or_insert(anyhow!(e).context("ingest task join"));
            }
        }
    }
    ctrl_c.abort();

    match failure {
        Some(e) => Err(e),
        None => {
            info!("done");
            Ok(())
        }
    }
}

async fn latest_block(cfg: &Config, exchange_id: &str) -> anyhow::Result<()> {
    let source = find_source(cfg, exchange_id)?;
    let client = graph_client(cfg, source)?;
    let engine = PaginationEngine::new(
        Arc::new(client),
        exchange_id,
        cfg.pagination(),
        Arc::new(HealthCounters::default()),
    );
    let block = engine.latest_block().await.context("query latest block")?;
    println!("{}", serde_json::to_string(&block)?);
    Ok(())
}

async fn backfill(cfg: &Config, exchange_id: &str, start: u64, end: u64) -> anyhow::Result<()> {
    if start > end {
        return Err(anyhow!("backfill start {start} is after end {end}"));
    }
    let source = find_source(cfg, exchange_id)?;
    let queue = open_queue(&cfg.ingest.queue_url, QUEUE_KEY_RAW_TRADES)
        .await
        .context("open queue")?;
    let store = connect_store(cfg).await?;
    let checkpoints = open_checkpoints(cfg, Some(&store)).await?;

    let lp = build_loop(cfg, source, queue, store, checkpoints)?;
    let done = lp.backfill(start, end).await.context("backfill")?;
    info!(
        exchange = exchange_id,
        trades = done.trades,
        inserted = done.inserted,
        "backfill finished"
    );
    Ok(())
}

async fn reset_cursor(cfg: &Config, exchange_id: &str) -> anyhow::Result<()> {
    find_source(cfg, exchange_id)?;
    let store = match cfg.ingest.checkpoint {
        CheckpointMode::File => None,
        CheckpointMode::Store => Some(connect_store(cfg).await?),
    };
    let checkpoints = open_checkpoints(cfg, store.as_ref()).await?;
    let mgr = CheckpointManager::new(
        exchange_id,
        checkpoints,
        cfg.ingest.lookback_secs,
        cfg.ingest.max_boundary_keys,
    );
    if mgr.reset().await.context("reset cursor")? {
        info!(exchange = exchange_id, "cursor removed");
    } else {
        warn!(exchange = exchange_id, "no persisted cursor");
    }
    Ok(())
}

fn find_source<'a>(cfg: &'a Config, exchange_id: &str) -> anyhow::Result<&'a SourceConfig> {
    cfg.source(exchange_id)
        .ok_or_else(|| anyhow!("unknown source {exchange_id:?}"))
}

fn graph_client(cfg: &Config, source: &SourceConfig) -> anyhow::Result<GraphClient> {
    let endpoint = cfg.endpoint_for(source)?;
    let client = GraphClient::new(
        endpoint,
        Duration::from_millis(cfg.graph.request_timeout_ms),
        Duration::from_millis(cfg.graph.connect_timeout_ms),
    )
    .context("build graph client")?;
    Ok(client)
}

async fn connect_store(cfg: &Config) -> anyhow::Result<PgTradeStore> {
    let store = PgTradeStore::connect(&cfg.ingest.store_url, cfg.ingest.store_max_connections)
        .await
        .context("connect trade store")?;
    store.ensure_schema().await.context("ensure trade schema")?;
    Ok(store)
}

async fn open_checkpoints(
    cfg: &Config,
    store: Option<&PgTradeStore>,
) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    match (cfg.ingest.checkpoint, store) {
        (CheckpointMode::File, _) => Ok(Arc::new(FileCheckpointStore::new(
            cfg.ingest.checkpoint_dir.clone(),
        ))),
        (CheckpointMode::Store, Some(store)) => {
            let cp = PgCheckpointStore::new(store.pool().clone());
            cp.ensure_schema().await.context("ensure cursor schema")?;
            Ok(Arc::new(cp))
        }
        (CheckpointMode::Store, None) => Err(anyhow!("store checkpoints need a trade store")),
    }
}

fn build_loop(
    cfg: &Config,
    source: &SourceConfig,
    queue: Arc<dyn TradeQueue>,
    store: PgTradeStore,
    checkpoints: Arc<dyn CheckpointStore>,
) -> anyhow::Result<IngestLoop<GraphClient>> {
    let client = graph_client(cfg, source)?;
    let health = Arc::new(HealthCounters::default());
    let engine = PaginationEngine::new(
        Arc::new(client),
        source.exchange_id.clone(),
        cfg.pagination(),
        health.clone(),
    );
    let mgr = CheckpointManager::new(
        source.exchange_id.clone(),
        checkpoints,
        cfg.ingest.lookback_secs,
        cfg.ingest.max_boundary_keys,
    );
    let store: Arc<dyn TradeStore> = Arc::new(store);
    Ok(IngestLoop::new(
        engine,
        mgr,
        queue,
        store,
        cfg.loop_config(),
        health,
    ))
}
