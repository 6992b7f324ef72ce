use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use model::{DirtyPixels, DirtyRect, PixelBuffer};

/// Display target the composite is pushed to.
pub trait RenderSurface: Send {
    /// Called after the composite changed. `dirty` marks the pixels that differ
    /// from the previous present.
    fn present(&mut self, composite: &PixelBuffer, dirty: &DirtyPixels);

    /// Called when the engine releases the surface.
    fn detach(&mut self) {}
}

#[derive(Debug, Default)]
pub struct MemoryFrame {
    pub pixels: Option<PixelBuffer>,
    pub present_count: u64,
    pub last_dirty_rect: Option<DirtyRect>,
    pub last_dirty_count: usize,
    pub detached: bool,
}

/// Surface that keeps the last presented frame in memory. Clones share the same
/// frame, so a caller can keep one handle and give the other to the engine.
#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    frame: Arc<Mutex<MemoryFrame>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(&self) -> MutexGuard<'_, MemoryFrame> {
        self.frame.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RenderSurface for MemorySurface {
    fn present(&mut self, composite: &PixelBuffer, dirty: &DirtyPixels) {
        let mut frame = self.frame();
        match frame.pixels.as_mut() {
            Some(pixels) if pixels.size() == composite.size() => {
                for offset in dirty.iter() {
                    pixels.set_pixel(offset, composite.pixel(offset));
                }
            }
            _ => frame.pixels = Some(composite.clone()),
        }
        frame.present_count += 1;
        frame.last_dirty_rect = dirty.bounding_rect();
        frame.last_dirty_count = dirty.len();
    }

    fn detach(&mut self) {
        let mut frame = self.frame();
        frame.pixels = None;
        frame.detached = true;
    }
}
