use std::sync::LazyLock;

use regex::Regex;

static BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)data\.addRows\(\[(.*?)\]\);").unwrap());

/// Semantic category of an embedded data block. The source markup carries
/// no labels; ordinal position among all matches is the only disambiguator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    PriceHistory,
    ValueSales,
    ListedSales,
}

impl BlockKind {
    pub fn from_index(index: usize) -> Option<BlockKind> {
        match index {
            0 => Some(BlockKind::PriceHistory),
            1 => Some(BlockKind::ValueSales),
            2 => Some(BlockKind::ListedSales),
            _ => None,
        }
    }
}

/// One unlabeled textual span believed to encode a table of rows,
/// classified purely by its position in the document.
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub kind: Option<BlockKind>,
    pub body: String,
}

/// All non-overlapping `data.addRows([...]);` spans in document order.
/// No semantic validation happens here; meaning is assigned by ordinal.
pub fn extract_blocks(markup: &str) -> Vec<RawBlock> {
    BLOCK_RE
        .captures_iter(markup)
        .enumerate()
        .map(|(index, caps)| RawBlock {
            kind: BlockKind::from_index(index),
            body: caps[1].to_string(),
        })
        .collect()
}

// ── Tests ──
