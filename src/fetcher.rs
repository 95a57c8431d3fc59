use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::renderer::{PageRenderer, PageSession, RenderError};

const PAGE_URL_PREFIX: &str = "https://www.brickeconomy.com/minifig/";

/// Opening of the positional data-block syntax. Once it appears in the
/// document the chart scripts have run and the markup is usable.
pub const READY_MARKER: &str = "data.addRows([";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_POLLS: u32 = 30;
const DEBUG_DIR: &str = "debug_timeouts";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out waiting for chart data after {polls} polls")]
    Timeout { polls: u32 },
    #[error("interrupted before the page was ready")]
    Interrupted,
    #[error(transparent)]
    Render(#[from] RenderError),
}

#[derive(Clone)]
pub struct FetchConfig {
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub debug_dir: PathBuf,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
            debug_dir: PathBuf::from(DEBUG_DIR),
        }
    }
}

/// Drives the renderer against one item page at a time, polling the live
/// document until the chart data marker appears or the poll budget runs
/// out.
pub struct PageFetcher {
    renderer: Arc<dyn PageRenderer>,
    cancel: Arc<AtomicBool>,
    config: FetchConfig,
}

impl PageFetcher {
    pub fn new(renderer: Arc<dyn PageRenderer>, cancel: Arc<AtomicBool>) -> Self {
        Self::with_config(renderer, cancel, FetchConfig::default())
    }

    pub fn with_config(
        renderer: Arc<dyn PageRenderer>,
        cancel: Arc<AtomicBool>,
        config: FetchConfig,
    ) -> Self {
        PageFetcher {
            renderer,
            cancel,
            config,
        }
    }

    pub fn page_url(item_id: &str) -> String {
        format!("{}{}", PAGE_URL_PREFIX, item_id)
    }

    /// Render the item's page and return its markup once the chart data
    /// marker appears. One renderer session per call, torn down before
    /// returning on every path.
    pub async fn fetch(&self, item_id: &str) -> Result<String, FetchError> {
        let url = Self::page_url(item_id);
        info!("loading {}", url);

        let mut session = self.renderer.open(&url).await?;
        let result = self.wait_for_chart_data(&mut *session, item_id).await;
        if let Err(e) = session.close().await {
            warn!("failed to close renderer session for {}: {}", item_id, e);
        }
        result
    }

    async fn wait_for_chart_data(
        &self,
        session: &mut dyn PageSession,
        item_id: &str,
    ) -> Result<String, FetchError> {
        let mut last = String::new();
        for poll in 0..self.config.max_polls {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(FetchError::Interrupted);
            }
            last = session.markup().await?;
            if last.contains(READY_MARKER) {
                debug!("chart data for {} appeared after {} polls", item_id, poll + 1);
                return Ok(last);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        self.snapshot_timeout(item_id, &last);
        Err(FetchError::Timeout {
            polls: self.config.max_polls,
        })
    }

    /// Keep the last markup we saw for operator debugging. The snapshot
    /// content is irrelevant downstream; a failed write only logs.
    fn snapshot_timeout(&self, item_id: &str, markup: &str) {
        let path = self
            .config
            .debug_dir
            .join(format!("timeout_{}.html", item_id));
        let write = std::fs::create_dir_all(&self.config.debug_dir)
            .and_then(|_| std::fs::write(&path, markup));
        match write {
            Ok(()) => warn!(
                "timed out waiting for chart data for {}, snapshot at {}",
                item_id,
                path.display()
            ),
            Err(e) => warn!("timed out for {}, snapshot write failed: {}", item_id, e),
        }
    }
}

// ── Tests ──
