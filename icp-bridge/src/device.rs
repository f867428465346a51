//! Display devices the driver renders frames onto.

use parking_lot::Mutex;

use crate::frame::{DisplayFrame, GlyphPlacement, COLUMNS, ROWS};

/// Something that can show an ICP frame.
pub trait IcpDevice: Send + Sync {
    /// Draw `frame`, whose glyph positions are already laid out in
    /// `placements`.
    fn render(&self, frame: &DisplayFrame, placements: &[GlyphPlacement]) -> anyhow::Result<()>;
}

/// One cell of the device's glyph buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCell {
    /// Atlas key, `' '` when nothing is drawn.
    pub key: char,
    pub inverted: bool,
}

impl Default for DeviceCell {
    fn default() -> Self {
        Self {
            key: ' ',
            inverted: false,
        }
    }
}

/// Copy of the device state at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub cells: Vec<[DeviceCell; COLUMNS]>,
    pub font: String,
    /// Number of frames rendered so far.
    pub frames: u64,
}

impl DeviceSnapshot {
    /// Row `r` as text, trailing blanks trimmed. Empty past the last row.
    pub fn row_text(&self, r: usize) -> String {
        let text: String = self
            .cells
            .get(r)
            .into_iter()
            .flatten()
            .map(|c| c.key)
            .collect();
        text.trim_end().to_string()
    }

    /// Per-cell inversion flags of row `r`. Empty past the last row.
    pub fn row_inverted(&self, r: usize) -> Vec<bool> {
        self.cells
            .get(r)
            .into_iter()
            .flatten()
            .map(|c| c.inverted)
            .collect()
    }

    /// Whether every cell is blank and un-inverted.
    pub fn is_blank(&self) -> bool {
        self.cells
            .iter()
            .flatten()
            .all(|c| *c == DeviceCell::default())
    }

    /// Render as a bordered text panel; inverted cells use ANSI reverse video.
    pub fn to_panel(&self) -> String {
        let mut out = String::new();
        out.push('+');
        out.push_str(&"-".repeat(COLUMNS));
        out.push_str("+\n");
        for row in &self.cells {
            out.push('|');
            for cell in row {
                if cell.inverted {
                    out.push_str("\x1b[7m");
                    out.push(cell.key);
                    out.push_str("\x1b[0m");
                } else {
                    out.push(cell.key);
                }
            }
            out.push_str("|\n");
        }
        out.push('+');
        out.push_str(&"-".repeat(COLUMNS));
        out.push('+');
        out
    }
}

/// In-memory 5×25 glyph buffer.
///
/// Each render replaces the whole buffer; no history is kept.
#[derive(Debug)]
pub struct VirtualDevice {
    state: Mutex<DeviceSnapshot>,
}

impl VirtualDevice {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceSnapshot {
                cells: vec![[DeviceCell::default(); COLUMNS]; ROWS],
                font: crate::frame::DEFAULT_FONT.to_string(),
                frames: 0,
            }),
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.state.lock().clone()
    }
}

impl Default for VirtualDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl IcpDevice for VirtualDevice {
    fn render(&self, frame: &DisplayFrame, placements: &[GlyphPlacement]) -> anyhow::Result<()> {
        let mut cells = vec![[DeviceCell::default(); COLUMNS]; ROWS];
        for p in placements {
            let slot = cells
                .get_mut(p.row)
                .and_then(|row| row.get_mut(p.col))
                .ok_or_else(|| anyhow::anyhow!("glyph outside display at {},{}", p.row, p.col))?;
            *slot = DeviceCell {
                key: p.key,
                inverted: p.inverted,
            };
        }

        let mut state = self.state.lock();
        state.cells = cells;
        state.font = frame.font().to_string();
        state.frames += 1;
        Ok(())
    }
}
