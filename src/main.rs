use std::{collections::HashMap, fs::OpenOptions, future::Future, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt::time::ChronoLocal, EnvFilter};

use crate::{
    config::{Overrides, Settings},
    crawler::{CrawlStats, Crawler},
    fetcher::{Fetcher, FetcherOptions},
    spiders::hacker_news::HackerNewsSpider,
    storage::PageStore,
};

mod config;
mod crawler;
mod error;
mod fetcher;
mod spiders;
mod storage;

const LOG_TIME_FORMAT: &str = "[%Y.%m.%d %H:%M:%S]";

/// Mirrors the Hacker News top stories and the pages linked from their comments.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Seconds to wait between two crawl cycles
    #[arg(long)]
    period: Option<u64>,
    /// Append the log to this file instead of stdout
    #[arg(long)]
    logfile: Option<PathBuf>,
    /// Directory the pages are saved into
    #[arg(long)]
    root: Option<PathBuf>,
    /// Detailed output
    #[arg(long)]
    verbose: bool,
    /// Settings file (defaults to hn_crawler.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    if let Err(err) = try_main().await {
        eprintln!("Error: {:?}", err);
        std::process::exit(1);
    }
}

async fn try_main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.clone())
        .context("loading settings")?
        .apply_overrides(Overrides {
            period_secs: args.period,
            root: args.root.clone(),
            logfile: args.logfile.clone(),
            verbose: args.verbose,
        });
    init_tracing(&settings)?;

    tracing::info!("starting to download pages");
    let max_cycles = args.once.then_some(1);
    let result = crawl(&settings, max_cycles, ctrl_c(), |_| {}).await;
    match &result {
        Ok(()) => tracing::info!("finished downloading pages"),
        Err(err) => tracing::error!("{:?}", err),
    }
    result
}

fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    let default_filter = if settings.verbose {
        "hn_crawler=debug,warn"
    } else {
        "hn_crawler=info,warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("telemetry: Creating EnvFilter")?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()));

    // construct a subscriber that prints formatted traces to stdout or the log file
    match (&settings.logfile, settings.log_json) {
        (Some(path), json) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file '{}'", path.display()))?;
            let builder = builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file));
            if json {
                tracing::subscriber::set_global_default(builder.json().finish())?;
            } else {
                tracing::subscriber::set_global_default(builder.finish())?;
            }
        }
        (None, true) => tracing::subscriber::set_global_default(builder.json().finish())?,
        (None, false) => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}

/// Outcome of one crawl cycle.
#[derive(Debug)]
struct CycleReport {
    stats: CrawlStats,
    /// Successful downloads during the cycle, repeated URLs included.
    downloaded: usize,
    /// URLs that failed every attempt during the cycle, with the last error.
    failed: HashMap<String, String>,
}

/// Runs crawl cycles `period` apart until `max_cycles` are done or `shutdown`
/// completes.
async fn crawl<F>(
    settings: &Settings,
    max_cycles: Option<usize>,
    shutdown: F,
    mut on_cycle: impl FnMut(CycleReport),
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    std::fs::create_dir_all(&settings.root)
        .with_context(|| format!("creating '{}'", settings.root.display()))?;
    let store = PageStore::new(&settings.root);
    let fetcher = Arc::new(Fetcher::new(FetcherOptions {
        user_agent: settings.user_agent.clone(),
        timeout: settings.fetch_timeout(),
        max_attempts: settings.max_attempts,
    })?);
    let spider = Arc::new(HackerNewsSpider::new(
        fetcher.clone(),
        store.clone(),
        &settings.base_url,
    )?);
    let crawler = Crawler::new(
        settings.delay(),
        settings.crawling_concurrency,
        settings.processing_concurrency,
    );
    tracing::info!(root = %store.root().display(), period = ?settings.period(), "mirroring {}", settings.base_url);

    tokio::pin!(shutdown);
    let mut cycles = 0usize;
    loop {
        let before = fetcher.downloaded_count();
        let cycle = async {
            let report = CycleReport {
                stats: crawler.run(spider.clone()).await,
                downloaded: fetcher.downloaded_count() - before,
                failed: fetcher.take_errors(),
            };
            tracing::debug!(
                requests = report.stats.requests,
                failed = report.stats.failed,
                items = report.stats.items,
                saved = report.stats.processed,
                "cycle done"
            );
            tracing::info!("downloaded {} resources", report.downloaded);
            if !report.failed.is_empty() {
                tracing::warn!(
                    count = report.failed.len(),
                    "failed resources: {:?}",
                    report.failed
                );
            }
            report
        };

        tokio::select! {
            report = cycle => on_cycle(report),
            _ = &mut shutdown => {
                tracing::info!("interrupted");
                return Ok(());
            }
        }

        cycles += 1;
        if max_cycles.is_some_and(|max| cycles >= max) {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(settings.period()) => {}
            _ = &mut shutdown => {
                tracing::info!("interrupted");
                return Ok(());
            }
        }
    }
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("listening for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
}

// Sent unless `user_agent` is configured.
pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
