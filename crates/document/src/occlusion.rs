//! Binary occlusion over a bottom-to-top run of layer buffers.
//!
//! A pixel is either transparent (all four channels zero) or opaque. Both scans
//! are plain loops that stop at the first opaque hit, so stack depth never grows
//! the call stack.

use model::{PixelBuffer, PixelOffset, Rgba};

/// True when any buffer in `covering` is opaque at `offset`.
pub fn is_covered<'a, I>(covering: I, offset: PixelOffset) -> bool
where
    I: IntoIterator<Item = &'a PixelBuffer>,
{
    for buffer in covering {
        if !buffer.is_transparent_at(offset) {
            return true;
        }
    }
    false
}

/// Color of the topmost opaque buffer at `offset`, scanning downward from the
/// end of `bottom_to_top`.
pub fn topmost_opaque<'a, I>(bottom_to_top: I, offset: PixelOffset) -> Rgba
where
    I: IntoIterator<Item = &'a PixelBuffer>,
    I::IntoIter: DoubleEndedIterator,
{
    for buffer in bottom_to_top.into_iter().rev() {
        let color = buffer.pixel(offset);
        if color.is_opaque() {
            return color;
        }
    }
    Rgba::TRANSPARENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::CanvasSize;

    fn buffers(colors: &[Rgba]) -> (Vec<PixelBuffer>, PixelOffset) {
        let size = CanvasSize::new(1, 1).expect("non-zero size");
        let offset = size.pixel_offset(0, 0).expect("in bounds");
        let buffers = colors
            .iter()
            .map(|color| {
                let mut buffer = PixelBuffer::new(size);
                buffer.set_pixel(offset, *color);
                buffer
            })
            .collect();
        (buffers, offset)
    }

    #[test]
    fn topmost_opaque_prefers_upper_buffers() {
        let red = Rgba::new(255, 0, 0, 255);
        let blue = Rgba::new(0, 0, 255, 255);
        let (stack, offset) = buffers(&[red, blue, Rgba::TRANSPARENT]);
        assert_eq!(topmost_opaque(&stack, offset), blue);
        assert_eq!(topmost_opaque(&stack[..1], offset), red);
        assert_eq!(topmost_opaque(&stack[2..], offset), Rgba::TRANSPARENT);
    }

    #[test]
    fn is_covered_requires_one_opaque_buffer() {
        let (stack, offset) = buffers(&[Rgba::TRANSPARENT, Rgba::new(0, 0, 0, 1)]);
        assert!(is_covered(&stack, offset));
        assert!(!is_covered(&stack[..1], offset));
        assert!(!is_covered(std::iter::empty::<&PixelBuffer>(), offset));
    }
}
