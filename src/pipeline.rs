use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::failures::FailureTracker;
use crate::fetcher::{FetchError, PageFetcher};
use crate::parser::{self, ParseOutcome};
use crate::store::{MarketRecord, RecordStore};

pub const DEFAULT_TEST_ID: &str = "SW0091";

/// Expected, retryable-by-rerun failure classes. All of them become one
/// failure-queue entry; the distinction survives only in the logs.
#[derive(Debug, Error)]
pub enum FailureReason {
    #[error("timed out waiting for chart data")]
    RenderTimeout,
    #[error("renderer error: {0}")]
    Render(String),
    #[error("no data blocks found in page")]
    NoBlocks,
    #[error("selected block matched no rows")]
    NoRows,
}

enum Outcome {
    Rows(Vec<MarketRecord>),
    Failed(FailureReason),
    Interrupted,
}

struct ItemReport {
    item_id: String,
    outcome: Outcome,
}

#[derive(Default)]
pub struct BatchStats {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
    pub skipped: usize,
    pub new_rows: usize,
}

impl BatchStats {
    pub fn print(&self) {
        if self.skipped > 0 {
            println!(
                "Done: {} ids ({} ok, {} failed, {} skipped after interrupt), {} new rows persisted.",
                self.total, self.ok, self.failed, self.skipped, self.new_rows
            );
        } else {
            println!(
                "Done: {} ids ({} ok, {} failed), {} new rows persisted.",
                self.total, self.ok, self.failed, self.new_rows
            );
        }
    }
}

#[derive(Default)]
pub struct RetryStats {
    pub total: usize,
    pub resolved: usize,
    pub still_failed: usize,
    pub new_rows: usize,
}

impl RetryStats {
    pub fn print(&self) {
        println!(
            "Done: {} retried, {} resolved ({} new rows), {} still queued.",
            self.total, self.resolved, self.new_rows, self.still_failed
        );
    }
}

/// Full pipeline for one id: fetch → extract → parse, with the four
/// expected failure classes folded into `Outcome::Failed`.
async fn process_item(fetcher: &PageFetcher, item_id: &str) -> Outcome {
    let markup = match fetcher.fetch(item_id).await {
        Ok(markup) => markup,
        Err(FetchError::Interrupted) => return Outcome::Interrupted,
        Err(FetchError::Timeout { .. }) => return Outcome::Failed(FailureReason::RenderTimeout),
        Err(FetchError::Render(e)) => {
            return Outcome::Failed(FailureReason::Render(e.to_string()))
        }
    };

    match parser::parse_market_records(item_id, &markup) {
        ParseOutcome::Rows(records) => Outcome::Rows(records),
        ParseOutcome::NoBlocks => Outcome::Failed(FailureReason::NoBlocks),
        ParseOutcome::NoRows => Outcome::Failed(FailureReason::NoRows),
    }
}

/// Run the pipeline over `ids` with a bounded worker pool, funneling every
/// report to a single consumer. All store/queue writes happen in that
/// consumer, so appends are serialized by construction.
async fn sweep<F>(
    fetcher: Arc<PageFetcher>,
    ids: Vec<String>,
    concurrency: usize,
    cancel: Arc<AtomicBool>,
    mut on_report: F,
) -> Result<()>
where
    F: FnMut(ItemReport) -> Result<()>,
{
    let total = ids.len() as u64;
    let workers = concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(workers));
    let (tx, mut rx) = mpsc::channel::<ItemReport>(workers * 2);

    for item_id in ids {
        let fetcher = Arc::clone(&fetcher);
        let sem = Arc::clone(&semaphore);
        let cancel = Arc::clone(&cancel);
        let tx = tx.clone();

        tokio::spawn(async move {
            let _permit = sem.acquire().await.unwrap();
            let outcome = if cancel.load(Ordering::Relaxed) {
                Outcome::Interrupted
            } else {
                process_item(&fetcher, &item_id).await
            };
            let _ = tx.send(ItemReport { item_id, outcome }).await;
        });
    }

    // Drop our copy of tx so rx closes when all spawned tasks finish
    drop(tx);

    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    while let Some(report) = rx.recv().await {
        on_report(report)?;
        pb.inc(1);
    }

    pb.finish_and_clear();
    Ok(())
}

/// Batch workflow: every id gets a full pipeline run; failures become
/// queue entries and never abort the batch.
pub async fn run_batch(
    fetcher: Arc<PageFetcher>,
    store: &mut RecordStore,
    failures: &FailureTracker,
    ids: Vec<String>,
    concurrency: usize,
    cancel: Arc<AtomicBool>,
) -> Result<BatchStats> {
    let mut stats = BatchStats {
        total: ids.len(),
        ..Default::default()
    };

    sweep(fetcher, ids, concurrency, cancel, |report| {
        match report.outcome {
            Outcome::Rows(records) => {
                let written = store.append(&records)?;
                stats.ok += 1;
                stats.new_rows += written;
                info!("{}: parsed {} rows, {} new", report.item_id, records.len(), written);
            }
            Outcome::Failed(reason) => {
                failures.record(&report.item_id)?;
                stats.failed += 1;
                warn!("{} failed: {}", report.item_id, reason);
            }
            Outcome::Interrupted => {
                stats.skipped += 1;
                info!("{} skipped after interrupt", report.item_id);
            }
        }
        Ok(())
    })
    .await?;

    Ok(stats)
}

/// Retry workflow: re-drive the pipeline over the failure queue. An id
/// leaves the queue only when its attempt appended at least one genuinely
/// new record; the retained list is persisted only after the full sweep.
pub async fn run_retry(
    fetcher: Arc<PageFetcher>,
    store: &mut RecordStore,
    failures: &FailureTracker,
    cancel: Arc<AtomicBool>,
) -> Result<RetryStats> {
    let queued = failures.load()?;
    let mut stats = RetryStats {
        total: queued.len(),
        ..Default::default()
    };
    if queued.is_empty() {
        println!("Failure queue is empty. Nothing to retry.");
        return Ok(stats);
    }

    info!("retrying {} failed ids", queued.len());
    let mut resolved: HashSet<String> = HashSet::new();

    sweep(fetcher, queued.clone(), 1, cancel, |report| {
        match report.outcome {
            Outcome::Rows(records) => {
                let written = store.append(&records)?;
                if written > 0 {
                    stats.new_rows += written;
                    resolved.insert(report.item_id.clone());
                    info!("{}: recovered {} new rows", report.item_id, written);
                } else {
                    info!("{}: rows already present, keeping queued", report.item_id);
                }
            }
            Outcome::Failed(reason) => {
                warn!("{} still failing: {}", report.item_id, reason);
            }
            Outcome::Interrupted => {
                info!("{} not attempted after interrupt", report.item_id);
            }
        }
        Ok(())
    })
    .await?;

    let retained: Vec<String> = queued
        .into_iter()
        .filter(|id| !resolved.contains(id))
        .collect();
    stats.resolved = resolved.len();
    stats.still_failed = retained.len();
    failures.save(&retained)?;

    Ok(stats)
}

/// Single-test workflow: the identical pipeline for one id, with verbose
/// per-row output for grammar validation.
pub async fn run_single(
    fetcher: &PageFetcher,
    store: &mut RecordStore,
    failures: &FailureTracker,
    item_id: &str,
) -> Result<()> {
    println!("Testing {} -> {}", item_id, PageFetcher::page_url(item_id));

    match process_item(fetcher, item_id).await {
        Outcome::Rows(records) => {
            println!("Parsed {} rows:", records.len());
            for record in &records {
                let [id, date, low, q1, q3, high, tooltip] = record.as_fields();
                println!(
                    "  {} {} low={} q1={} q3={} high={} '{}'",
                    id, date, low, q1, q3, high, tooltip
                );
            }
            let written = store.append(&records)?;
            println!(
                "{} new rows persisted ({} already present).",
                written,
                records.len() - written
            );
        }
        Outcome::Failed(reason) => {
            failures.record(item_id)?;
            println!("Failed: {} (recorded in failure queue)", reason);
        }
        Outcome::Interrupted => println!("Interrupted before completion."),
    }

    Ok(())
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::fetcher::FetchConfig;
    use crate::renderer::fakes::{FakePage, FakeRenderer};

    const QUARTILE_MARKUP: &str = "\
        <script>data.addRows([ [new Date(2021, 0, 1), 1.00, 2.00, 3.00, 4.00, 'history'] ]);</script>\n\
        <script>data.addRows([ [new Date(2022, 0, 1), 79.35, 81.00, 85.96, 89.27, 'January 2022   $81.00 - $85.96'] ]);</script>";
    const SINGLE_PRICE_MARKUP: &str =
        "<script>data.addRows([ [new Date(2008, 3, 28), 18.00, '$18.00', null, null] ]);</script>";
    // Marker present (so the fetch completes) but the call never closes.
    const TORN_MARKUP: &str = "<script>data.addRows([ [new Date(2022, 0, 1)";
    // No marker at all: the fetch polls out.
    const BLANK_MARKUP: &str = "<html><body>no charts</body></html>";

    fn fetcher_for(renderer: FakeRenderer, dir: &Path) -> Arc<PageFetcher> {
        let config = FetchConfig {
            poll_interval: Duration::ZERO,
            max_polls: 3,
            debug_dir: dir.join("debug"),
        };
        Arc::new(PageFetcher::with_config(
            Arc::new(renderer),
            Arc::new(AtomicBool::new(false)),
            config,
        ))
    }

    fn stores_in(dir: &Path) -> (RecordStore, FailureTracker) {
        (
            RecordStore::open(dir.join("out.csv")).unwrap(),
            FailureTracker::new(dir.join("failed.txt")),
        )
    }

    #[tokio::test]
    async fn batch_persists_successes_and_queues_failures() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FakeRenderer::new()
            .with_page("SW0091", FakePage::ready(QUARTILE_MARKUP))
            .with_page("SW0315", FakePage::ready(SINGLE_PRICE_MARKUP))
            .with_page("SW0400", FakePage::ready(TORN_MARKUP))
            .with_page("SW0500", FakePage::ready(BLANK_MARKUP));
        let fetcher = fetcher_for(renderer, dir.path());
        let (mut store, failures) = stores_in(dir.path());

        let ids = vec!["SW0091", "SW0315", "SW0400", "SW0500"]
            .into_iter()
            .map(String::from)
            .collect();
        let stats = run_batch(
            fetcher,
            &mut store,
            &failures,
            ids,
            1,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(stats.ok, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.new_rows, 2);
        assert_eq!(store.record_count(), 2);
        // SW0400: blocks absent (torn call); SW0500: render timeout. Both
        // collapse to plain queue entries.
        assert_eq!(failures.load().unwrap(), vec!["SW0400", "SW0500"]);
    }

    #[tokio::test]
    async fn failure_queued_exactly_once_per_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FakeRenderer::new().with_page("SW0400", FakePage::ready(TORN_MARKUP));
        let fetcher = fetcher_for(renderer, dir.path());
        let (mut store, failures) = stores_in(dir.path());

        run_batch(
            fetcher,
            &mut store,
            &failures,
            vec!["SW0400".to_string()],
            1,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("failed.txt")).unwrap();
        assert_eq!(raw, "SW0400\n");
    }

    #[tokio::test]
    async fn rerunning_a_batch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let make_renderer =
            || FakeRenderer::new().with_page("SW0091", FakePage::ready(QUARTILE_MARKUP));
        let (mut store, failures) = stores_in(dir.path());

        let first = run_batch(
            fetcher_for(make_renderer(), dir.path()),
            &mut store,
            &failures,
            vec!["SW0091".to_string()],
            1,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();
        let second = run_batch(
            fetcher_for(make_renderer(), dir.path()),
            &mut store,
            &failures,
            vec!["SW0091".to_string()],
            1,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(first.new_rows, 1);
        assert_eq!(second.new_rows, 0);
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn bounded_concurrency_keeps_appends_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FakeRenderer::new()
            .with_page("SW0091", FakePage::ready(QUARTILE_MARKUP))
            .with_page("SW0315", FakePage::ready(SINGLE_PRICE_MARKUP))
            .with_page("SW0700", FakePage::ready(QUARTILE_MARKUP));
        let fetcher = fetcher_for(renderer, dir.path());
        let (mut store, failures) = stores_in(dir.path());

        let ids = vec!["SW0091", "SW0315", "SW0700"]
            .into_iter()
            .map(String::from)
            .collect();
        let stats = run_batch(
            fetcher,
            &mut store,
            &failures,
            ids,
            3,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(stats.ok, 3);
        assert!(failures.load().unwrap().is_empty());
        // SW0700 serves the same chart rows as SW0091, but the item id is
        // part of the identity tuple, so all three ids persist one row each.
        assert_eq!(store.record_count(), 3);
    }

    #[tokio::test]
    async fn retry_drops_only_ids_that_yield_new_records() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FakeRenderer::new()
            .with_page("SW0091", FakePage::ready(QUARTILE_MARKUP))
            .with_page("SW0315", FakePage::ready(SINGLE_PRICE_MARKUP))
            .with_page("SW0500", FakePage::ready(BLANK_MARKUP));
        let fetcher = fetcher_for(renderer, dir.path());
        let (mut store, failures) = stores_in(dir.path());

        // SW0315's rows are already on disk: its retry succeeds but appends
        // nothing new, so it must stay queued.
        store
            .append(&crate::parser::rows::parse_single_price_rows(
                "SW0315",
                "[new Date(2008, 3, 28), 18.00, '$18.00', null, null]",
            ))
            .unwrap();

        for id in ["SW0091", "SW0315", "SW0500"] {
            failures.record(id).unwrap();
        }

        let stats = run_retry(
            fetcher,
            &mut store,
            &failures,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(stats.total, 3);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.new_rows, 1);
        assert_eq!(failures.load().unwrap(), vec!["SW0315", "SW0500"]);
    }

    #[tokio::test]
    async fn retry_with_empty_queue_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FakeRenderer::new();
        let fetcher = fetcher_for(renderer, dir.path());
        let (mut store, failures) = stores_in(dir.path());

        let stats = run_retry(
            fetcher,
            &mut store,
            &failures,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn single_test_persists_like_batch() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FakeRenderer::new().with_page("SW0091", FakePage::ready(QUARTILE_MARKUP));
        let fetcher = fetcher_for(renderer, dir.path());
        let (mut store, failures) = stores_in(dir.path());

        run_single(&fetcher, &mut store, &failures, "SW0091")
            .await
            .unwrap();
        assert_eq!(store.record_count(), 1);
        assert!(failures.load().unwrap().is_empty());
    }
}
