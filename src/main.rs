//! feedreaper daemon and maintenance commands
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | FEEDREAPER_CONF | feedreaper.toml | Config file path |
//! | FEEDREAPER_DB | feedreaper.db | Store directory |
//! | FEEDREAPER_POLL_INTERVAL_MS | 300000 | Poll interval (minimum 60000) |
//! | FEEDREAPER_BATCH_LIMIT | 10 | Feeds dispatched per poll pass |
//! | FEEDREAPER_FETCH_WORKERS | 10 | Concurrent fetch workers |
//! | FEEDREAPER_MAX_BODY_BYTES | 16777216 | Largest response body accepted |
//! | FEEDREAPER_LOG_LEVEL | info | Default log level |
//! | FEEDREAPER_LOG_JSON | false | JSON log lines |
//! | RUST_LOG | - | Full tracing filter, overrides the level |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use feedreaper::clock::{Clock, SharedClock, SystemClock};
use feedreaper::config::Config;
use feedreaper::fetch::{Fetcher, HttpFetcher};
use feedreaper::observability::init_tracing;
use feedreaper::parser::ParserSet;
use feedreaper::pipeline::Pipeline;
use feedreaper::repository::Repository;
use feedreaper::store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "feedreaper", version, about = "Feed aggregation backend")]
struct Cli {
    /// Store directory (overrides config and FEEDREAPER_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the poll/fetch/reap pipeline until interrupted
    Serve,
    /// Subscribe to one or more feed URLs
    Add {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// List feeds with their schedule and status
    List,
    /// Show fetch attempts for one feed, newest first
    Log {
        feed_id: u64,
        /// Only attempts at or after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
    /// Merge feeds that share a URL
    Cleanup {
        /// Report duplicates without changing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Write a snapshot and truncate the journal
    Checkpoint,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(db) = cli.db {
        config.database.location = db;
    }
    init_tracing(&config.logging)?;

    let store = Arc::new(Store::open(
        &config.database.location,
        config.database.store_options(),
    )?);

    let result = run(cli.command, &config, store.clone()).await;
    if let Err(e) = store.close() {
        error!(error = %e, "store close failed");
    }
    result
}

async fn run(command: Command, config: &Config, store: Arc<Store>) -> Result<(), BoxError> {
    let clock: SharedClock = Arc::new(SystemClock);
    match command {
        Command::Serve => serve(config, store, clock).await,
        Command::Add { urls } => {
            let repo = Repository::open(store)?;
            for url in urls {
                let feed = repo.add_feed(&url, clock.now())?;
                println!("{}\t{}", feed.id, feed.url);
            }
            Ok(())
        }
        Command::List => {
            let repo = Repository::open(store)?;
            for feed in repo.list_feeds()? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    feed.id,
                    feed.status.map(|s| s.code()).unwrap_or("--"),
                    format_time(feed.next_fetch),
                    feed.url,
                    feed.title
                );
            }
            Ok(())
        }
        Command::Log { feed_id, since } => {
            let repo = Repository::open(store)?;
            for t in repo.transmissions_for_feed(feed_id, since)? {
                println!(
                    "{}\t{}\t{}\t{}ms\t{}/{}\t{}",
                    format_time(t.start_time),
                    t.result.map(|r| r.code()).unwrap_or("--"),
                    t.status_code,
                    t.duration.as_millis(),
                    t.new_items,
                    t.item_count,
                    t.result_message
                );
            }
            Ok(())
        }
        Command::Cleanup { dry_run } => {
            let repo = Repository::open(store)?;
            if dry_run {
                for (url, ids) in repo.find_duplicates()? {
                    println!("{}\t{:?}", url, ids);
                }
                return Ok(());
            }
            let report = repo.cleanup_duplicates()?;
            for (url, (kept, removed)) in &report.merged {
                println!("{}\tkept {}\tremoved {:?}", url, kept, removed);
            }
            info!(
                feeds_removed = report.feeds_removed(),
                transmissions_moved = report.transmissions_moved,
                items_moved = report.items_moved,
                items_merged = report.items_merged,
                "duplicate cleanup finished"
            );
            Ok(())
        }
        Command::Checkpoint => {
            store.checkpoint()?;
            info!(txid = store.last_txid(), "checkpoint written");
            Ok(())
        }
    }
}

async fn serve(config: &Config, store: Arc<Store>, clock: SharedClock) -> Result<(), BoxError> {
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(
        &config.fetch,
        ParserSet::bundled(),
        clock.clone(),
    )?);
    let pipeline = Pipeline::start(store.clone(), config, fetcher, clock)?;

    signal::ctrl_c().await?;
    info!("interrupt received, draining pipeline");
    let stats = pipeline.stop().await;
    info!(
        dispatched = stats.dispatched,
        reaped = stats.reaped,
        failed = stats.reap_failures,
        "shutdown complete"
    );

    store.checkpoint()?;
    Ok(())
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}
