use bitvec::prelude::{BitVec, Lsb0};
use model::{CanvasSize, PixelOffset};

/// Offsets of every pixel made non-transparent on one layer, in first-write
/// order. The membership bits keep the list free of duplicates when a pixel is
/// cleared and painted again.
#[derive(Debug, Clone)]
pub struct TouchedIndex {
    order: Vec<PixelOffset>,
    members: BitVec<usize, Lsb0>,
}

impl TouchedIndex {
    pub fn new(size: CanvasSize) -> Self {
        Self {
            order: Vec::new(),
            members: BitVec::repeat(false, size.pixel_count()),
        }
    }

    /// Returns true when `offset` was appended.
    pub fn record(&mut self, offset: PixelOffset) -> bool {
        let index = offset.pixel_index();
        if self.members[index] {
            return false;
        }
        self.members.set(index, true);
        self.order.push(offset);
        true
    }

    pub fn as_slice(&self) -> &[PixelOffset] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn into_offsets(self) -> Vec<PixelOffset> {
        self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keeps_first_write_order_without_duplicates() {
        let size = CanvasSize::new(4, 4).expect("non-zero size");
        let mut touched = TouchedIndex::new(size);
        let a = size.pixel_offset(3, 0).expect("in bounds");
        let b = size.pixel_offset(0, 2).expect("in bounds");

        assert!(touched.record(a));
        assert!(touched.record(b));
        assert!(!touched.record(a));

        assert_eq!(touched.as_slice(), &[a, b]);
        assert_eq!(touched.len(), 2);
    }
}
