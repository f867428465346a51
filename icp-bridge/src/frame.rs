//! ICP frame model: a fixed 5×25 text grid with inverted-video spans.
//!
//! Rows arrive as strings that may contain two zero-width markers:
//! [`INVERT_ON`] starts inverted video and [`INVERT_OFF`] ends it. Markers do
//! not occupy a cell and do not nest. An open marker while inversion is
//! already active, or a close marker while it is not, is ignored. A dangling
//! open marker inverts the rest of its own row only; every row starts
//! un-inverted.
//!
//! Visible characters beyond column 25 are dropped.
//!
//! ```text
//! "UHF ⟦305.000⟧"  →  "UHF 305.000"   inverted span (start 4, len 7)
//! ```

use serde::Serialize;

/// Number of rows on the ICP display.
pub const ROWS: usize = 5;

/// Visible character cells per row.
pub const COLUMNS: usize = 25;

/// Zero-width marker that starts inverted video.
pub const INVERT_ON: char = '\u{27E6}';

/// Zero-width marker that ends inverted video.
pub const INVERT_OFF: char = '\u{27E7}';

/// Font used when a draw does not name one.
pub const DEFAULT_FONT: &str = "DCS";

/// Symbolic glyphs and the atlas keys they render with.
const GLYPH_SUBSTITUTIONS: &[(char, char)] = &[
    ('\u{2195}', 'a'), // ↕ up/down arrow
    ('\u{2191}', 'u'), // ↑
    ('\u{2193}', 'd'), // ↓
    ('\u{2190}', 'l'), // ←
    ('\u{2192}', 'r'), // →
    ('\u{00B0}', 'o'), // °
];

/// Atlas key for a visible character.
///
/// Symbols from the substitution table map to their lower-case key; every
/// other character is upper-cased.
#[must_use]
pub fn glyph_key(ch: char) -> char {
    GLYPH_SUBSTITUTIONS
        .iter()
        .find(|(symbol, _)| *symbol == ch)
        .map(|(_, key)| *key)
        .unwrap_or_else(|| ch.to_uppercase().next().unwrap_or(ch))
}

/// A run of inverted cells in visible-cell coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvertedSpan {
    pub start: usize,
    pub len: usize,
}

/// One visible cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cell {
    pub ch: char,
    pub inverted: bool,
}

/// One decoded row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameRow {
    cells: Vec<Cell>,
}

impl FrameRow {
    /// Decode a marked-up row, truncating to [`COLUMNS`] visible cells.
    pub fn parse(raw: &str) -> Self {
        let mut cells = Vec::with_capacity(COLUMNS);
        let mut inverted = false;

        for ch in raw.chars() {
            match ch {
                INVERT_ON => inverted = true,
                INVERT_OFF => inverted = false,
                _ if cells.len() < COLUMNS => cells.push(Cell { ch, inverted }),
                // Markers after the cut-off still parse; visible text does not.
                _ => {}
            }
        }

        Self { cells }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// The visible text with markers stripped.
    pub fn text(&self) -> String {
        self.cells.iter().map(|c| c.ch).collect()
    }

    /// Maximal runs of inverted cells, left to right.
    pub fn inverted_spans(&self) -> Vec<InvertedSpan> {
        let mut spans = Vec::new();
        let mut current: Option<InvertedSpan> = None;

        for (i, cell) in self.cells.iter().enumerate() {
            match (cell.inverted, current.as_mut()) {
                (true, Some(span)) => span.len += 1,
                (true, None) => current = Some(InvertedSpan { start: i, len: 1 }),
                (false, Some(_)) => spans.extend(current.take()),
                (false, None) => {}
            }
        }
        spans.extend(current);
        spans
    }
}

/// Device pixel size of one glyph cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlyphMetrics {
    pub width: u32,
    pub height: u32,
}

impl Default for GlyphMetrics {
    fn default() -> Self {
        Self {
            width: 12,
            height: 24,
        }
    }
}

/// Where and how a single glyph is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlyphPlacement {
    pub row: usize,
    pub col: usize,
    /// Atlas key after substitution.
    pub key: char,
    pub inverted: bool,
    pub x: u32,
    pub y: u32,
}

/// A complete display frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayFrame {
    rows: Vec<FrameRow>,
    font: String,
}

impl DisplayFrame {
    /// Decode exactly [`ROWS`] marked-up lines.
    pub fn parse<S: AsRef<str>>(lines: &[S], font: Option<&str>) -> Result<Self, String> {
        if lines.len() != ROWS {
            return Err(format!("Expected {ROWS} lines, got {}", lines.len()));
        }

        Ok(Self {
            rows: lines.iter().map(|l| FrameRow::parse(l.as_ref())).collect(),
            font: font.unwrap_or(DEFAULT_FONT).to_string(),
        })
    }

    /// Five empty rows in the default font.
    pub fn blank() -> Self {
        Self {
            rows: vec![FrameRow::default(); ROWS],
            font: DEFAULT_FONT.to_string(),
        }
    }

    pub fn rows(&self) -> &[FrameRow] {
        &self.rows
    }

    pub fn font(&self) -> &str {
        &self.font
    }

    /// Glyph positions for every visible cell: `x = col * width`,
    /// `y = row * height`.
    pub fn placements(&self, metrics: GlyphMetrics) -> Vec<GlyphPlacement> {
        self.rows
            .iter()
            .enumerate()
            .flat_map(|(row, frame_row)| {
                frame_row
                    .cells()
                    .iter()
                    .enumerate()
                    .map(move |(col, cell)| GlyphPlacement {
                        row,
                        col,
                        key: glyph_key(cell.ch),
                        inverted: cell.inverted,
                        x: col as u32 * metrics.width,
                        y: row as u32 * metrics.height,
                    })
            })
            .collect()
    }
}
