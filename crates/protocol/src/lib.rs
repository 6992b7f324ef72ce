use model::Rgba;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Tool strokes usually emit a handful of pixels per input sample.
pub const WRITE_BATCH_INLINE_CAPACITY: usize = 16;

pub type WriteBatch = SmallVec<[PixelWrite; WRITE_BATCH_INLINE_CAPACITY]>;

/// One `(x, y, color)` request produced by a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelWrite {
    pub x: u32,
    pub y: u32,
    pub color: Rgba,
}

impl PixelWrite {
    pub const fn new(x: u32, y: u32, color: Rgba) -> Self {
        Self { x, y, color }
    }
}

/// Commands the UI shell dispatches into the canvas engine.
///
/// Binding a render surface is not a command: the surface is a live object owned
/// by the host and is handed to the engine directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CanvasCommand {
    UpdateSize {
        width: Option<String>,
        height: Option<String>,
    },
    AddLayer,
    SelectLayer {
        index: usize,
    },
    DeleteLayer {
        index: usize,
    },
    Draw(PixelWrite),
    DrawBatch {
        writes: WriteBatch,
    },
    ResetState,
}

impl CanvasCommand {
    pub fn name(&self) -> &'static str {
        match self {
            CanvasCommand::UpdateSize { .. } => "update_size",
            CanvasCommand::AddLayer => "add_layer",
            CanvasCommand::SelectLayer { .. } => "select_layer",
            CanvasCommand::DeleteLayer { .. } => "delete_layer",
            CanvasCommand::Draw(_) => "draw",
            CanvasCommand::DrawBatch { .. } => "draw_batch",
            CanvasCommand::ResetState => "reset_state",
        }
    }

    pub fn draw(x: u32, y: u32, color: impl Into<Rgba>) -> Self {
        CanvasCommand::Draw(PixelWrite::new(x, y, color.into()))
    }
}

impl From<PixelWrite> for CanvasCommand {
    fn from(write: PixelWrite) -> Self {
        CanvasCommand::Draw(write)
    }
}

impl FromIterator<PixelWrite> for CanvasCommand {
    fn from_iter<I: IntoIterator<Item = PixelWrite>>(iter: I) -> Self {
        CanvasCommand::DrawBatch {
            writes: iter.into_iter().collect(),
        }
    }
}
