pub mod blocks;
pub mod rows;

use blocks::BlockKind;

use crate::store::MarketRecord;

/// What a page's markup yielded. NoBlocks and NoRows are both pipeline
/// failures, never errors; nothing in this layer panics or returns Err for
/// malformed-but-present text.
#[derive(Debug)]
pub enum ParseOutcome {
    Rows(Vec<MarketRecord>),
    NoBlocks,
    NoRows,
}

/// Two-pass pipeline: markup → positional data blocks → canonical records.
///
/// Selection is by block count: two or more blocks means the page carries
/// the full chart set, and the value/sales block (ordinal 1) is parsed
/// with the quartile grammar; exactly one block means a sparse page whose
/// only chart uses the single-price encoding.
pub fn parse_market_records(item_id: &str, markup: &str) -> ParseOutcome {
    let blocks = blocks::extract_blocks(markup);

    let records = match blocks.len() {
        0 => return ParseOutcome::NoBlocks,
        1 => rows::parse_single_price_rows(item_id, &blocks[0].body),
        _ => blocks
            .iter()
            .find(|b| b.kind == Some(BlockKind::ValueSales))
            .map(|b| rows::parse_quartile_rows(item_id, &b.body))
            .unwrap_or_default(),
    };

    if records.is_empty() {
        ParseOutcome::NoRows
    } else {
        ParseOutcome::Rows(records)
    }
}

// ── Tests ──
