//! Pool Fee Indexer
//!
//! Run with: cargo run -- run
//!
//! Discovers swap transactions for one pool (live events + Etherscan
//! backfill), queues them, and records each with its fee priced at block time.

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod discovery;
mod pricing;
mod queue;
mod storage;
mod types;
mod worker;

#[cfg(test)]
mod testing;

use config::Config;
use discovery::{AlloyChainSource, EtherscanClient, HistoricalSync, ListenerHandle, SwapListener, SyncReport};
use pricing::{BinanceClient, MemoryPriceCache, PriceCache, PriceResolver, PriceSettings, RedisPriceCache};
use queue::{RedisQueueBackend, RetryPolicy, TransactionQueue};
use storage::{MemoryStore, PostgresStore, TransactionQuery, TransactionStore};
use worker::{TransactionWorker, WorkerSettings};

#[derive(Parser)]
#[command(name = "pool-fee-indexer")]
#[command(about = "Swap fee indexer for a single liquidity pool")]
struct Cli {
    /// TOML configuration file (environment variables otherwise)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool and the live listener until Ctrl-C
    Run {
        /// Only process queued jobs
        #[arg(long)]
        no_listener: bool,

        /// Keep queue, price cache and records in process (nothing persists)
        #[arg(long)]
        in_memory: bool,

        /// Backfill this block range on startup
        #[arg(long, requires = "backfill_to")]
        backfill_from: Option<u64>,

        #[arg(long, requires = "backfill_from")]
        backfill_to: Option<u64>,
    },

    /// Backfill a block range from the history API
    Sync {
        #[arg(long)]
        start_block: u64,

        #[arg(long)]
        end_block: u64,

        /// Pool address (defaults to UNISWAP_POOL_ADDRESS)
        #[arg(long)]
        pool: Option<String>,
    },

    /// List stored transactions as JSON
    Transactions {
        /// Inclusive, Unix seconds
        #[arg(long)]
        start_timestamp: Option<u64>,

        /// Inclusive, Unix seconds
        #[arg(long)]
        end_timestamp: Option<u64>,

        #[arg(long)]
        hash: Option<String>,

        #[arg(long)]
        page: Option<u32>,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Total fees of all stored transactions as JSON
    Summary,

    /// Job counts and recent failures
    QueueStatus {
        /// How many failed jobs to show
        #[arg(long, default_value_t = 10)]
        failed: usize,
    },
}

fn print_banner() {
    println!();
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!(
        "{}",
        style(" 🧾 POOL FEE INDEXER").cyan().bold()
    );
    println!(
        "{}",
        style("    Live Swaps | Etherscan Backfill | Binance Pricing").cyan()
    );
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env(),
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        error!("Please check your .env file");
        return Err(e.into());
    }

    Ok(config)
}

async fn connect_queue(config: &Config) -> Result<TransactionQueue> {
    let backend = RedisQueueBackend::connect(&config.redis_queue_url, &config.queue_name).await?;
    Ok(TransactionQueue::new(config.queue_name.clone(), Arc::new(backend)))
}

async fn connect_store(config: &Config) -> Result<Arc<dyn TransactionStore>> {
    let url = config.require_database_url()?;
    Ok(Arc::new(PostgresStore::connect(&url).await?))
}

fn record_policy(config: &Config) -> RetryPolicy {
    RetryPolicy::exponential(config.job_attempts, config.job_backoff())
}

fn history_client(config: &Config) -> Result<EtherscanClient> {
    Ok(EtherscanClient::from_config(config, config.require_etherscan_key()?)?)
}

fn history_sync(config: &Config, client: EtherscanClient, queue: &TransactionQueue) -> HistoricalSync {
    HistoricalSync::new(Arc::new(client), queue.clone(), record_policy(config))
        .with_batch_size(config.sync_batch_size)
}

fn print_sync_report(report: &SyncReport) {
    println!();
    println!("{}", style("═══ BACKFILL REPORT ═══").blue().bold());
    println!("   Synced:      {}", style(report.total_synced).green());
    println!("   Enqueued:    {}", report.enqueued);
    println!("   Ended at:    block {}", report.next_start_block);
    if let Some(e) = &report.error {
        println!("   {}", style(format!("Stopped early: {}", e)).red());
    }
    println!();
}

/// Clients built from settings alone, before any connection or task
struct Startup {
    chain: Option<AlloyChainSource>,
    backfill: Option<(EtherscanClient, String, (u64, u64))>,
    api: BinanceClient,
}

/// Fail on missing credentials before `run` opens connections or spawns
/// workers.
fn prepare(config: &Config, no_listener: bool, backfill: Option<(u64, u64)>) -> Result<Startup> {
    let chain = if no_listener {
        warn!("Live listener disabled");
        None
    } else {
        config.require_pool_address()?;
        Some(AlloyChainSource::connect(&config.require_rpc_url()?, config.log_poll_interval())?)
    };
    let backfill = match backfill {
        Some(range) => Some((history_client(config)?, config.require_pool_address()?.to_string(), range)),
        None => None,
    };

    Ok(Startup {
        chain,
        backfill,
        api: BinanceClient::from_config(config)?,
    })
}

// ============================================
// COMMANDS
// ============================================

async fn run(config: Config, no_listener: bool, in_memory: bool, backfill: Option<(u64, u64)>) -> Result<()> {
    print_banner();
    config.print_summary();
    println!();

    let Startup { chain, backfill, api } = prepare(&config, no_listener, backfill)?;

    let queue: TransactionQueue;
    let store: Arc<dyn TransactionStore>;
    let cache: Arc<dyn PriceCache>;
    if in_memory {
        warn!("🧪 In-memory queue, cache and store: nothing survives a restart");
        queue = TransactionQueue::in_memory();
        store = Arc::new(MemoryStore::new());
        cache = Arc::new(MemoryPriceCache::new());
    } else {
        queue = connect_queue(&config).await?;
        store = connect_store(&config).await?;
        cache = Arc::new(RedisPriceCache::connect(&config.redis_cache_url).await?);
    }

    let resolver = Arc::new(PriceResolver::new(cache, Arc::new(api), PriceSettings::from_config(&config)));
    info!("💱 Pricing fees in {}", resolver.symbol());

    let listener = match chain {
        Some(chain) => Some(SwapListener::new(&config, Arc::new(chain), queue.clone())?),
        None => None,
    };

    let worker = Arc::new(TransactionWorker::new(
        queue.clone(),
        resolver,
        store,
        WorkerSettings::from_config(&config),
    ));
    let workers = worker.start();

    let mut listener: Option<ListenerHandle> = listener.map(|listener| {
        info!("📡 Listening for swaps on {}", listener.pool());
        listener.start()
    });

    let backfill = backfill.map(|(client, pool, (from, to))| {
        let sync = history_sync(&config, client, &queue);
        tokio::spawn(async move { sync.sync(&pool, from, to).await })
    });

    info!("🚀 Indexer running, press Ctrl-C to stop");

    let listener_exit = {
        let listener_done = async {
            match listener.as_mut() {
                Some(handle) => Some(handle.wait().await),
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => None,
            exit = listener_done => exit,
        }
    };

    if let Some(task) = backfill {
        if task.is_finished() {
            if let Ok(total) = task.await {
                info!("📜 Backfill synced {} transactions", total);
            }
        } else {
            warn!("Backfill still running, aborting");
            task.abort();
        }
    }

    match listener_exit {
        None => {
            info!("🛑 Shutting down...");
            if let Some(handle) = listener {
                if let Err(e) = handle.stop().await {
                    error!("Listener error: {}", e);
                }
            }
            workers.shutdown().await;
            Ok(())
        }
        Some(result) => {
            workers.shutdown().await;
            result?;
            Err(eyre!("listener exited unexpectedly"))
        }
    }
}

async fn sync(config: Config, start_block: u64, end_block: u64, pool: Option<String>) -> Result<()> {
    let pool = match pool {
        Some(pool) => pool,
        None => config.require_pool_address()?.to_string(),
    };
    let client = history_client(&config)?;
    let queue = connect_queue(&config).await?;
    let sync = history_sync(&config, client, &queue);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} [{elapsed}]")?);
    spinner.set_message(format!("Backfilling {} blocks {}..={}", pool, start_block, end_block));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let report = sync.sync_with_report(&pool, start_block, end_block).await;
    spinner.finish_and_clear();

    print_sync_report(&report);
    Ok(())
}

async fn list_transactions(config: Config, query: TransactionQuery) -> Result<()> {
    let store = connect_store(&config).await?;
    let page = store.transactions(&query).await?;
    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}

async fn summary(config: Config) -> Result<()> {
    let store = connect_store(&config).await?;
    let summary = store.summary().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn queue_status(config: Config, failed: usize) -> Result<()> {
    let queue = connect_queue(&config).await?;
    let counts = queue.counts().await?;

    println!();
    println!("{}", style(format!("═══ QUEUE: {} ═══", queue.name())).blue().bold());
    println!("   Waiting:     {}", counts.waiting);
    println!("   Delayed:     {}", counts.delayed);
    println!("   Active:      {}", counts.active);
    println!("   Completed:   {}", style(counts.completed).green());
    println!("   Failed:      {}", style(counts.failed).red());

    let jobs = queue.failed_jobs(failed).await?;
    if !jobs.is_empty() {
        println!();
        println!("{}", style("Recent failures:").yellow());
        for job in jobs {
            println!(
                "   #{} {} after {} attempts: {}",
                job.id,
                job.payload.subject(),
                job.attempts_made,
                job.failed_reason.as_deref().unwrap_or("unknown")
            );
        }
    }
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pool_fee_indexer=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run {
            no_listener,
            in_memory,
            backfill_from,
            backfill_to,
        } => run(config, no_listener, in_memory, backfill_from.zip(backfill_to)).await,
        Command::Sync {
            start_block,
            end_block,
            pool,
        } => sync(config, start_block, end_block, pool).await,
        Command::Transactions {
            start_timestamp,
            end_timestamp,
            hash,
            page,
            limit,
        } => {
            let query = TransactionQuery {
                start_timestamp,
                end_timestamp,
                hash,
                page,
                limit,
            };
            list_transactions(config, query).await
        }
        Command::Summary => summary(config).await,
        Command::QueueStatus { failed } => queue_status(config, failed).await,
    }
}
