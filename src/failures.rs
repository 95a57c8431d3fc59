use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::store::StoreError;

pub const QUEUE_PATH: &str = "failed_minifigs.txt";

/// Durable queue of item ids that produced no usable data, one id per
/// line. Ids are appended the moment a failure is observed so a crash
/// mid-batch loses nothing already recorded.
pub struct FailureTracker {
    path: PathBuf,
}

impl FailureTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FailureTracker { path: path.into() }
    }

    /// Append one id immediately. One line per call.
    pub fn record(&self, item_id: &str) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", item_id)?;
        file.flush()?;
        Ok(())
    }

    /// Current queue, first-seen order, duplicates collapsed. A missing
    /// file is an empty queue.
    pub fn load(&self) -> Result<Vec<String>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut seen = HashSet::new();
        let ids = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|id| seen.insert(id.to_string()))
            .map(str::to_string)
            .collect();
        Ok(ids)
    }

    /// Replace the queue with `ids`. Written to a sibling temp file and
    /// renamed over the target, so a crash mid-save cannot leave a torn
    /// queue behind. Callers must only invoke this after every loaded
    /// entry has been attempted.
    pub fn save(&self, ids: &[String]) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        let mut content = ids.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ── Tests ──
