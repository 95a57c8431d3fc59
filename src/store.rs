use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const STORE_PATH: &str = "all_minifig_value_sales.csv";

const HEADER: [&str; 7] = ["SW_ID", "Date", "Low", "Q1", "Q3", "High", "Tooltip"];

/// Filesystem-level failure on the canonical store or the failure queue.
/// The only error class that aborts a workflow invocation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("store csv failure: {0}")]
    Csv(#[from] csv::Error),
}

/// One observed price-quartile sample for one item. Created by the row
/// parser, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarketRecord {
    #[serde(rename = "SW_ID")]
    pub item_id: String,
    #[serde(rename = "Date")]
    pub date: NaiveDate,
    #[serde(rename = "Low")]
    pub low: f64,
    #[serde(rename = "Q1")]
    pub q1: f64,
    #[serde(rename = "Q3")]
    pub q3: f64,
    #[serde(rename = "High")]
    pub high: f64,
    #[serde(rename = "Tooltip")]
    pub tooltip: String,
}

impl MarketRecord {
    /// Canonical CSV field strings: date as YYYY-MM-DD, money with
    /// exactly 2 fractional digits.
    pub fn as_fields(&self) -> [String; 7] {
        [
            self.item_id.clone(),
            self.date.format("%Y-%m-%d").to_string(),
            format!("{:.2}", self.low),
            format!("{:.2}", self.q1),
            format!("{:.2}", self.q3),
            format!("{:.2}", self.high),
            self.tooltip.clone(),
        ]
    }

    /// Identity tuple in serialized form. Two records with equal keys are
    /// the same observation and must never both be persisted.
    pub fn dedup_key(&self) -> String {
        self.as_fields().join("\x1f")
    }
}

/// Append-only canonical CSV with dedup-on-write. The novelty index is
/// built once at open and kept in sync with appends, so replaying the
/// same scrape never grows the file.
pub struct RecordStore {
    path: PathBuf,
    seen: HashSet<String>,
    items: HashSet<String>,
    has_header: bool,
    rewrite: bool,
}

impl RecordStore {
    /// Open the store, tolerating an absent, empty, or crash-partial file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut store = RecordStore {
            path,
            seen: HashSet::new(),
            items: HashSet::new(),
            has_header: false,
            rewrite: false,
        };

        match fs::metadata(&store.path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(e) => return Err(e.into()),
            Ok(meta) if meta.len() == 0 => return Ok(store),
            Ok(_) => {}
        }

        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&store.path)?;

        let headers = rdr.headers()?.clone();
        if headers.iter().ne(HEADER.iter().copied()) {
            // Leftover from a crashed run: treat as empty, rewrite on next append.
            warn!(
                "{} has an unexpected leading record, treating as empty",
                store.path.display()
            );
            store.rewrite = true;
            return Ok(store);
        }
        store.has_header = true;

        for result in rdr.deserialize::<MarketRecord>() {
            match result {
                Ok(record) => {
                    store.items.insert(record.item_id.clone());
                    store.seen.insert(record.dedup_key());
                }
                Err(e) => warn!("skipping unreadable row in {}: {}", store.path.display(), e),
            }
        }

        Ok(store)
    }

    /// Append the records whose identity tuple is not already on disk.
    /// Returns the count actually written.
    pub fn append(&mut self, records: &[MarketRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(!self.rewrite)
            .truncate(self.rewrite)
            .open(&self.path)?;
        let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(file);

        if !self.has_header || self.rewrite {
            wtr.write_record(HEADER)?;
            self.has_header = true;
            self.rewrite = false;
        }

        let mut written = 0;
        for record in records {
            let key = record.dedup_key();
            if self.seen.contains(&key) {
                continue;
            }
            wtr.write_record(record.as_fields())?;
            self.seen.insert(key);
            self.items.insert(record.item_id.clone());
            written += 1;
        }
        wtr.flush()?;

        Ok(written)
    }

    pub fn record_count(&self) -> usize {
        self.seen.len()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ── Tests ──
