mod failures;
mod fetcher;
mod parser;
mod pipeline;
mod renderer;
mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::failures::FailureTracker;
use crate::fetcher::PageFetcher;
use crate::pipeline::DEFAULT_TEST_ID;
use crate::renderer::WebDriver;
use crate::store::RecordStore;

#[derive(Parser)]
#[command(
    name = "minifig_scraper",
    about = "Minifig market-data scraper for brickeconomy.com"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape the given catalog ids and append new rows to the canonical CSV
    Scrape {
        /// Catalog ids, e.g. SW0091 SW0315
        #[arg(required = true)]
        ids: Vec<String>,
        /// Bounded worker pool size
        #[arg(short = 'j', long, default_value_t = 1)]
        concurrency: usize,
    },
    /// Re-attempt every id in the failure queue, dropping those that yield new rows
    RetryFailures,
    /// Run the pipeline for one id with per-row output
    Test {
        /// Catalog id to probe
        #[arg(default_value = DEFAULT_TEST_ID)]
        id: String,
    },
    /// Show store and failure-queue counts
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Scrape { ids, concurrency } => {
            let (fetcher, cancel) = setup_pipeline().await?;
            let mut store = RecordStore::open(store::STORE_PATH)?;
            let failures = FailureTracker::new(failures::QUEUE_PATH);
            println!(
                "Scraping {} ids (streaming to {})...",
                ids.len(),
                store.path().display()
            );
            let stats =
                pipeline::run_batch(fetcher, &mut store, &failures, ids, concurrency, cancel)
                    .await?;
            stats.print();
            Ok(())
        }
        Commands::RetryFailures => {
            let (fetcher, cancel) = setup_pipeline().await?;
            let mut store = RecordStore::open(store::STORE_PATH)?;
            let failures = FailureTracker::new(failures::QUEUE_PATH);
            let stats = pipeline::run_retry(fetcher, &mut store, &failures, cancel).await?;
            stats.print();
            Ok(())
        }
        Commands::Test { id } => {
            let (fetcher, _cancel) = setup_pipeline().await?;
            let mut store = RecordStore::open(store::STORE_PATH)?;
            let failures = FailureTracker::new(failures::QUEUE_PATH);
            pipeline::run_single(&fetcher, &mut store, &failures, &id).await
        }
        Commands::Stats => {
            let store = RecordStore::open(store::STORE_PATH)?;
            let queue = FailureTracker::new(failures::QUEUE_PATH).load()?;
            println!("Records:       {}", store.record_count());
            println!("Distinct ids:  {}", store.item_count());
            println!("Failure queue: {}", queue.len());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Probe the renderer once (an unavailable renderer is a setup failure,
/// not a per-item one) and wire the interrupt flag.
async fn setup_pipeline() -> anyhow::Result<(Arc<PageFetcher>, Arc<AtomicBool>)> {
    let renderer = WebDriver::from_env();
    renderer
        .check_available()
        .await
        .context("renderer unavailable (is a WebDriver endpoint running at WEBDRIVER_URL?)")?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight work");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let fetcher = Arc::new(PageFetcher::new(
        Arc::new(renderer),
        Arc::clone(&cancel),
    ));
    Ok((fetcher, cancel))
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
