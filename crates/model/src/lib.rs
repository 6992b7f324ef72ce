use bitvec::prelude::{BitVec, Lsb0};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BYTES_PER_PIXEL: usize = 4;
pub const DEFAULT_CANVAS_WIDTH: u32 = 700;
pub const DEFAULT_CANVAS_HEIGHT: u32 = 500;
/// Largest accepted width or height. Keeps `byte_len` well inside `usize` and
/// bounds the allocation a single resize can request.
pub const MAX_CANVAS_DIMENSION: u32 = 16_384;

/// One RGBA8 pixel. All-zero is the only value treated as transparent; any other
/// value is opaque for occlusion purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    pub const TRANSPARENT: Self = Self([0, 0, 0, 0]);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self([r, g, b, a])
    }

    #[inline]
    pub fn is_transparent(self) -> bool {
        self.0 == [0, 0, 0, 0]
    }

    #[inline]
    pub fn is_opaque(self) -> bool {
        !self.is_transparent()
    }
}

impl From<[u8; 4]> for Rgba {
    fn from(channels: [u8; 4]) -> Self {
        Self(channels)
    }
}

/// Byte offset of a pixel inside a row-major RGBA buffer:
/// `y * width * 4 + x * 4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PixelOffset(usize);

impl PixelOffset {
    pub const fn from_byte_offset(byte_offset: usize) -> Self {
        Self(byte_offset)
    }

    #[inline]
    pub const fn byte_offset(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn pixel_index(self) -> usize {
        self.0 / BYTES_PER_PIXEL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("pixel ({x}, {y}) is outside the {width}x{height} canvas")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    #[error("canvas size {width}x{height} must be non-zero in both dimensions")]
    ZeroSize { width: u32, height: u32 },
    #[error("canvas size {width}x{height} exceeds {max} in some dimension")]
    TooLarge { width: u32, height: u32, max: u32 },
}

/// Canvas dimensions. Every buffer of one canvas shares the same size, so the
/// offset math lives here rather than on the buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CanvasSize {
    width: u32,
    height: u32,
}

impl Default for CanvasSize {
    fn default() -> Self {
        Self {
            width: DEFAULT_CANVAS_WIDTH,
            height: DEFAULT_CANVAS_HEIGHT,
        }
    }
}

impl CanvasSize {
    pub fn new(width: u32, height: u32) -> Result<Self, ModelError> {
        if width == 0 || height == 0 {
            return Err(ModelError::ZeroSize { width, height });
        }
        if width > MAX_CANVAS_DIMENSION || height > MAX_CANVAS_DIMENSION {
            return Err(ModelError::TooLarge {
                width,
                height,
                max: MAX_CANVAS_DIMENSION,
            });
        }
        Ok(Self { width, height })
    }

    /// Builds a size from loosely typed UI input. Each dimension that is missing,
    /// empty, non-numeric, not a positive integer or above
    /// [`MAX_CANVAS_DIMENSION`] falls back to its default.
    pub fn from_inputs(width: Option<&str>, height: Option<&str>) -> Self {
        Self {
            width: parse_dimension(width, DEFAULT_CANVAS_WIDTH, "width"),
            height: parse_dimension(height, DEFAULT_CANVAS_HEIGHT, "height"),
        }
    }

    pub const fn width(self) -> u32 {
        self.width
    }

    pub const fn height(self) -> u32 {
        self.height
    }

    pub const fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }

    pub const fn byte_len(self) -> usize {
        self.pixel_count() * BYTES_PER_PIXEL
    }

    pub fn pixel_offset(self, x: u32, y: u32) -> Result<PixelOffset, ModelError> {
        if x >= self.width || y >= self.height {
            return Err(ModelError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        let byte_offset =
            y as usize * self.width as usize * BYTES_PER_PIXEL + x as usize * BYTES_PER_PIXEL;
        Ok(PixelOffset(byte_offset))
    }

    pub fn offset_position(self, offset: PixelOffset) -> (u32, u32) {
        let pixel_index = offset.pixel_index();
        let x = pixel_index % self.width as usize;
        let y = pixel_index / self.width as usize;
        (x as u32, y as u32)
    }
}

fn parse_dimension(value: Option<&str>, default: u32, label: &str) -> u32 {
    let parsed = value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .and_then(|text| text.parse::<u32>().ok())
        .filter(|dimension| (1..=MAX_CANVAS_DIMENSION).contains(dimension));
    match parsed {
        Some(dimension) => dimension,
        None => {
            tracing::debug!(?value, default, "canvas {label} input rejected, using default");
            default
        }
    }
}

/// Fixed-size RGBA8 grid backing one layer or the composite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    size: CanvasSize,
    data: Box<[u8]>,
}

impl PixelBuffer {
    pub fn new(size: CanvasSize) -> Self {
        Self {
            size,
            data: vec![0; size.byte_len()].into_boxed_slice(),
        }
    }

    pub fn size(&self) -> CanvasSize {
        self.size
    }

    pub fn width(&self) -> u32 {
        self.size.width
    }

    pub fn height(&self) -> u32 {
        self.size.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Panics when `offset` was produced for a different canvas size.
    #[inline]
    pub fn pixel(&self, offset: PixelOffset) -> Rgba {
        let start = offset.byte_offset();
        let bytes = &self.data[start..start + BYTES_PER_PIXEL];
        Rgba([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[inline]
    pub fn is_transparent_at(&self, offset: PixelOffset) -> bool {
        self.pixel(offset).is_transparent()
    }

    /// Writes `color` at `offset` and returns the value it replaced.
    #[inline]
    pub fn set_pixel(&mut self, offset: PixelOffset, color: Rgba) -> Rgba {
        let previous = self.pixel(offset);
        let start = offset.byte_offset();
        self.data[start..start + BYTES_PER_PIXEL].copy_from_slice(&color.0);
        previous
    }

    pub fn pixel_at(&self, x: u32, y: u32) -> Result<Rgba, ModelError> {
        let offset = self.size.pixel_offset(x, y)?;
        Ok(self.pixel(offset))
    }

    pub fn iter_opaque_offsets(&self) -> impl Iterator<Item = PixelOffset> + '_ {
        self.data
            .chunks_exact(BYTES_PER_PIXEL)
            .enumerate()
            .filter(|(_, pixel)| pixel.iter().any(|channel| *channel != 0))
            .map(|(pixel_index, _)| PixelOffset(pixel_index * BYTES_PER_PIXEL))
    }

    pub fn opaque_pixel_count(&self) -> usize {
        self.iter_opaque_offsets().count()
    }
}

/// Pixel-space rectangle, max bounds exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

/// One bit per pixel, set when the composite changed there since the last
/// present.
#[derive(Debug, Clone)]
pub struct DirtyPixels {
    size: CanvasSize,
    bits: BitVec<usize, Lsb0>,
    dirty_count: usize,
}

impl DirtyPixels {
    pub fn new(size: CanvasSize) -> Self {
        Self {
            size,
            bits: BitVec::repeat(false, size.pixel_count()),
            dirty_count: 0,
        }
    }

    /// Returns true when the pixel was not dirty yet.
    pub fn mark(&mut self, offset: PixelOffset) -> bool {
        let index = offset.pixel_index();
        let was_dirty = self.bits[index];
        self.bits.set(index, true);
        self.dirty_count += !was_dirty as usize;
        !was_dirty
    }

    pub fn mark_all(&mut self) {
        self.bits.fill(true);
        self.dirty_count = self.bits.len();
    }

    pub fn len(&self) -> usize {
        self.dirty_count
    }

    pub fn is_empty(&self) -> bool {
        self.dirty_count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = PixelOffset> + '_ {
        self.bits
            .iter_ones()
            .map(|pixel_index| PixelOffset(pixel_index * BYTES_PER_PIXEL))
    }

    pub fn bounding_rect(&self) -> Option<DirtyRect> {
        let mut rect: Option<DirtyRect> = None;
        for offset in self.iter() {
            let (x, y) = self.size.offset_position(offset);
            rect = Some(match rect {
                None => DirtyRect {
                    min_x: x,
                    min_y: y,
                    max_x: x + 1,
                    max_y: y + 1,
                },
                Some(rect) => DirtyRect {
                    min_x: rect.min_x.min(x),
                    min_y: rect.min_y.min(y),
                    max_x: rect.max_x.max(x + 1),
                    max_y: rect.max_y.max(y + 1),
                },
            });
        }
        rect
    }

    pub fn clear(&mut self) {
        if self.dirty_count == 0 {
            return;
        }
        self.bits.fill(false);
        self.dirty_count = 0;
    }
}
