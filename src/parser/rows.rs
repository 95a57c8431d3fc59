use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::store::MarketRecord;

// [new Date(2022, 0, 1), 79.35, 81.00, 85.96, 89.27, 'January 2022   $81.00 - $85.96']
static QUARTILE_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[new Date\((\d+), (\d+), (\d+)\), ([\d.]+), ([\d.]+), ([\d.]+), ([\d.]+), '([^']+)'\]",
    )
    .unwrap()
});

// [new Date(2008, 3, 28), 18.00, '$18.00', null, null]
static SINGLE_PRICE_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[new Date\((\d+), (\d+), (\d+)\), ([\d.]+), '\$[\d.]+', null, null\]").unwrap()
});

/// Multipliers for deriving quartiles when the page only exposes a single
/// sale price per row.
const LOW_FACTOR: f64 = 0.9;
const Q1_FACTOR: f64 = 0.8;
const Q3_FACTOR: f64 = 1.1;
const HIGH_FACTOR: f64 = 1.2;

/// Quartile grammar. One record per matching row literal; the source
/// encodes monthly buckets with an arbitrary day component, so the date is
/// pinned to the first of the stated month. Tooltip is kept verbatim.
pub fn parse_quartile_rows(item_id: &str, block: &str) -> Vec<MarketRecord> {
    QUARTILE_ROW_RE
        .captures_iter(block)
        .filter_map(|caps| {
            let date = js_date(&caps[1], &caps[2], None)?;
            Some(MarketRecord {
                item_id: item_id.to_string(),
                date,
                low: caps[4].parse().ok()?,
                q1: caps[5].parse().ok()?,
                q3: caps[6].parse().ok()?,
                high: caps[7].parse().ok()?,
                tooltip: caps[8].to_string(),
            })
        })
        .collect()
}

/// Single-price grammar. Keeps full day precision and derives the four
/// monetary fields from the one observed price; records are tagged as
/// approximated through their tooltip.
pub fn parse_single_price_rows(item_id: &str, block: &str) -> Vec<MarketRecord> {
    SINGLE_PRICE_ROW_RE
        .captures_iter(block)
        .filter_map(|caps| {
            let date = js_date(&caps[1], &caps[2], Some(&caps[3]))?;
            let price: f64 = caps[4].parse().ok()?;
            Some(MarketRecord {
                item_id: item_id.to_string(),
                date,
                low: round2(LOW_FACTOR * price),
                q1: round2(Q1_FACTOR * price),
                q3: round2(Q3_FACTOR * price),
                high: round2(HIGH_FACTOR * price),
                tooltip: format!("${:.2} (approximated quartiles)", price),
            })
        })
        .collect()
}

/// JavaScript Date components: the month is 0-based. `day` of None pins
/// the date to the first of the month. Rows with impossible dates are
/// dropped rather than erroring.
fn js_date(year: &str, month: &str, day: Option<&str>) -> Option<NaiveDate> {
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    let day: u32 = match day {
        Some(d) => d.parse().ok()?,
        None => 1,
    };
    NaiveDate::from_ymd_opt(year, month + 1, day)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ── Tests ──
