//! Layered raster document.
//!
//! Layers are ordered bottom-to-top and the composite always equals, per pixel,
//! the topmost non-transparent layer. Writes update the composite incrementally;
//! deleting a layer hands an [`EvictionJob`] back to the caller that restores the
//! composite over just the coordinates the evicted layer could have covered.

pub mod eviction;
pub mod occlusion;
mod touched;

use std::sync::Arc;

use bitvec::prelude::{BitVec, Lsb0};
use model::{CanvasSize, DirtyPixels, ModelError, PixelBuffer, PixelOffset, Rgba};
use protocol::PixelWrite;
use slotmap::{SlotMap, new_key_type};
use thiserror::Error;

pub use eviction::{CompositePatch, EvictionCancelled, EvictionJob, EvictionResult};
use touched::TouchedIndex;

new_key_type! {
    /// Stable identity of a layer; survives reordering caused by deletions.
    pub struct LayerKey;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("layer index {index} is out of range for {layer_count} layers")]
    InvalidLayerIndex { index: usize, layer_count: usize },
    #[error("layer stack has no layers")]
    Empty,
    #[error(transparent)]
    Pixel(#[from] ModelError),
    #[error("eviction result for a {actual:?} canvas cannot be applied to {expected:?}")]
    EvictionSizeMismatch {
        expected: CanvasSize,
        actual: CanvasSize,
    },
}

pub struct Layer {
    buffer: Arc<PixelBuffer>,
    touched: TouchedIndex,
    // Opaque composite pixels copied in when the layer was created.
    inherited: BitVec<usize, Lsb0>,
}

impl Layer {
    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn touched_indexes(&self) -> &[PixelOffset] {
        self.touched.as_slice()
    }

    pub fn inherited_pixel_count(&self) -> usize {
        self.inherited.count_ones()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub offset: PixelOffset,
    pub visible: bool,
    pub first_touch: bool,
}

/// A layer already detached from the stack, waiting for its eviction recompute.
pub struct EvictedLayer {
    key: LayerKey,
    index: usize,
    layer: Layer,
}

impl EvictedLayer {
    pub fn index(&self) -> usize {
        self.index
    }
}

pub struct LayerStack {
    size: CanvasSize,
    layers: SlotMap<LayerKey, Layer>,
    order: Vec<LayerKey>,
    current_layer: usize,
    composite: PixelBuffer,
    dirty: DirtyPixels,
}

impl LayerStack {
    pub fn new(size: CanvasSize) -> Self {
        Self {
            size,
            layers: SlotMap::with_key(),
            order: Vec::new(),
            current_layer: 0,
            composite: PixelBuffer::new(size),
            dirty: DirtyPixels::new(size),
        }
    }

    pub fn size(&self) -> CanvasSize {
        self.size
    }

    pub fn layer_count(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn current_layer(&self) -> usize {
        self.current_layer
    }

    pub fn composite(&self) -> &PixelBuffer {
        &self.composite
    }

    pub fn dirty(&self) -> &DirtyPixels {
        &self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    pub fn layer(&self, index: usize) -> Result<&Layer, StackError> {
        self.check_index(index)?;
        Ok(&self.layers[self.order[index]])
    }

    /// Appends a layer whose pixels start as a copy of the current composite.
    /// The current layer selection is left unchanged.
    pub fn add_layer(&mut self) -> LayerKey {
        let mut inherited: BitVec<usize, Lsb0> = BitVec::repeat(false, self.size.pixel_count());
        for offset in self.composite.iter_opaque_offsets() {
            inherited.set(offset.pixel_index(), true);
        }
        let layer = Layer {
            buffer: Arc::new(self.composite.clone()),
            touched: TouchedIndex::new(self.size),
            inherited,
        };
        let inherited_count = layer.inherited_pixel_count();
        let key = self.layers.insert(layer);
        self.order.push(key);
        tracing::debug!(
            ?key,
            layer_count = self.order.len(),
            inherited_count,
            "layer added"
        );
        key
    }

    pub fn select_layer(&mut self, index: usize) -> Result<(), StackError> {
        self.check_index(index)?;
        self.current_layer = index;
        Ok(())
    }

    /// Paints one pixel on the current layer.
    ///
    /// The layer buffer always receives the color. The composite follows only
    /// when no layer above the current one is opaque at that pixel.
    pub fn write(&mut self, write: PixelWrite) -> Result<WriteOutcome, StackError> {
        if self.order.is_empty() {
            return Err(StackError::Empty);
        }
        let offset = self.size.pixel_offset(write.x, write.y)?;
        let current = self.current_layer;
        let visible = !occlusion::is_covered(self.buffers_above(current), offset);

        let layer = &mut self.layers[self.order[current]];
        let previous = Arc::make_mut(&mut layer.buffer).set_pixel(offset, write.color);
        let first_touch =
            previous.is_transparent() && write.color.is_opaque() && layer.touched.record(offset);

        if visible {
            let resolved = if write.color.is_opaque() {
                write.color
            } else {
                occlusion::topmost_opaque(self.buffers_below(current), offset)
            };
            self.set_composite(offset, resolved);
        }

        tracing::trace!(
            x = write.x,
            y = write.y,
            layer = current,
            visible,
            first_touch,
            "pixel written"
        );
        Ok(WriteOutcome {
            offset,
            visible,
            first_touch,
        })
    }

    /// Detaches the layer at `index`, keeping the relative order of the others.
    /// The current selection is clamped into the new range.
    ///
    /// The composite is stale at the evicted layer's coordinates until the job
    /// from [`LayerStack::eviction_job`] has run and been applied.
    pub fn remove_layer(&mut self, index: usize) -> Result<EvictedLayer, StackError> {
        self.check_index(index)?;
        let key = self.order.remove(index);
        let Some(layer) = self.layers.remove(key) else {
            unreachable!("layer order references missing layer {key:?}");
        };
        self.current_layer = self
            .current_layer
            .min(self.order.len().saturating_sub(1));
        tracing::debug!(
            ?key,
            index,
            layer_count = self.order.len(),
            current_layer = self.current_layer,
            touched = layer.touched.len(),
            inherited = layer.inherited_pixel_count(),
            "layer removed"
        );
        Ok(EvictedLayer { key, index, layer })
    }

    /// Snapshots the remaining stack for recomputing the evicted coordinates.
    /// Only buffer handles are cloned; pixel data is shared copy-on-write.
    pub fn eviction_job(&self, evicted: EvictedLayer, generation: u64) -> EvictionJob {
        let EvictedLayer { key, layer, .. } = evicted;
        let remaining = self
            .order
            .iter()
            .map(|layer_key| Arc::clone(&self.layers[*layer_key].buffer))
            .collect();
        EvictionJob::new(
            generation,
            key,
            self.size,
            layer.touched.into_offsets(),
            &layer.inherited,
            remaining,
        )
    }

    /// Writes recomputed pixels into the composite. Returns how many changed.
    pub fn apply_eviction(&mut self, result: &EvictionResult) -> Result<usize, StackError> {
        if result.size != self.size {
            return Err(StackError::EvictionSizeMismatch {
                expected: self.size,
                actual: result.size,
            });
        }
        let mut changed = 0;
        for patch in &result.patches {
            changed += self.set_composite(patch.offset, patch.color) as usize;
        }
        tracing::debug!(
            generation = result.generation,
            evicted_layer = ?result.evicted_layer,
            patches = result.patches.len(),
            changed,
            "eviction applied"
        );
        Ok(changed)
    }

    /// Runs the eviction recompute inline.
    pub fn evict_now(&mut self, evicted: EvictedLayer, generation: u64) -> Result<usize, StackError> {
        let result = self.eviction_job(evicted, generation).run();
        self.apply_eviction(&result)
    }

    /// Color the composite should hold at `offset` given the current stack.
    pub fn resolve_pixel(&self, offset: PixelOffset) -> Rgba {
        occlusion::topmost_opaque(self.buffers(), offset)
    }

    /// Rebuilds the whole composite from every layer. O(width * height * layers);
    /// meant for verification, the engine never calls it on the hot path.
    pub fn resolve_full_composite(&self) -> PixelBuffer {
        let mut composite = PixelBuffer::new(self.size);
        for pixel_index in 0..self.size.pixel_count() {
            let offset = PixelOffset::from_byte_offset(pixel_index * model::BYTES_PER_PIXEL);
            composite.set_pixel(offset, self.resolve_pixel(offset));
        }
        composite
    }

    /// Re-derives every composite pixel from the layers. Returns how many
    /// changed.
    pub fn rebuild_composite(&mut self) -> usize {
        let rebuilt = self.resolve_full_composite();
        let mut changed = 0;
        for pixel_index in 0..self.size.pixel_count() {
            let offset = PixelOffset::from_byte_offset(pixel_index * model::BYTES_PER_PIXEL);
            changed += self.set_composite(offset, rebuilt.pixel(offset)) as usize;
        }
        changed
    }

    pub fn mark_all_dirty(&mut self) {
        self.dirty.mark_all();
    }

    fn set_composite(&mut self, offset: PixelOffset, color: Rgba) -> bool {
        if self.composite.pixel(offset) == color {
            return false;
        }
        self.composite.set_pixel(offset, color);
        self.dirty.mark(offset);
        true
    }

    fn buffers(&self) -> impl DoubleEndedIterator<Item = &PixelBuffer> + '_ {
        self.order.iter().map(|key| self.layers[*key].buffer.as_ref())
    }

    fn buffers_above(&self, index: usize) -> impl DoubleEndedIterator<Item = &PixelBuffer> + '_ {
        self.order[index + 1..]
            .iter()
            .map(|key| self.layers[*key].buffer.as_ref())
    }

    fn buffers_below(&self, index: usize) -> impl DoubleEndedIterator<Item = &PixelBuffer> + '_ {
        self.order[..index]
            .iter()
            .map(|key| self.layers[*key].buffer.as_ref())
    }

    fn check_index(&self, index: usize) -> Result<(), StackError> {
        if index >= self.order.len() {
            return Err(StackError::InvalidLayerIndex {
                index,
                layer_count: self.order.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const RED: Rgba = Rgba::new(255, 0, 0, 255);
    const GREEN: Rgba = Rgba::new(0, 255, 0, 255);
    const BLUE: Rgba = Rgba::new(0, 0, 255, 255);

    fn stack(width: u32, height: u32) -> LayerStack {
        LayerStack::new(CanvasSize::new(width, height).expect("non-zero size"))
    }

    fn draw(stack: &mut LayerStack, x: u32, y: u32, color: Rgba) -> WriteOutcome {
        stack
            .write(PixelWrite::new(x, y, color))
            .expect("write must succeed")
    }

    fn composite_at(stack: &LayerStack, x: u32, y: u32) -> Rgba {
        stack.composite().pixel_at(x, y).expect("in bounds")
    }

    fn assert_composite_consistent(stack: &LayerStack) {
        assert_eq!(
            stack.composite(),
            &stack.resolve_full_composite(),
            "composite diverged from full recompute"
        );
    }

    fn delete(stack: &mut LayerStack, index: usize) {
        let evicted = stack.remove_layer(index).expect("remove layer");
        stack.evict_now(evicted, 1).expect("apply eviction");
    }

    #[test]
    fn upper_layer_write_covers_lower_layer() {
        let mut stack = stack(4, 4);
        stack.add_layer();
        draw(&mut stack, 0, 0, RED);
        assert_eq!(composite_at(&stack, 0, 0), RED);

        stack.add_layer();
        stack.select_layer(1).expect("select layer 1");
        let outcome = draw(&mut stack, 0, 0, BLUE);
        assert!(outcome.visible);
        assert_eq!(composite_at(&stack, 0, 0), BLUE);

        stack.select_layer(0).expect("select layer 0");
        let outcome = draw(&mut stack, 1, 1, GREEN);
        assert!(outcome.visible);
        assert_eq!(composite_at(&stack, 1, 1), GREEN);
        assert_composite_consistent(&stack);
    }

    #[test]
    fn deleting_top_layer_restores_lower_colors() {
        let mut stack = stack(4, 4);
        stack.add_layer();
        draw(&mut stack, 0, 0, RED);
        stack.add_layer();
        stack.select_layer(1).expect("select layer 1");
        draw(&mut stack, 0, 0, BLUE);
        stack.select_layer(0).expect("select layer 0");
        draw(&mut stack, 1, 1, GREEN);

        delete(&mut stack, 1);

        assert_eq!(stack.layer_count(), 1);
        assert_eq!(composite_at(&stack, 0, 0), RED);
        assert_eq!(composite_at(&stack, 1, 1), GREEN);
        assert_composite_consistent(&stack);
    }

    #[test]
    fn write_below_opaque_layer_is_hidden_but_stored() {
        let mut stack = stack(2, 2);
        stack.add_layer();
        stack.add_layer();
        stack.select_layer(1).expect("select layer 1");
        draw(&mut stack, 0, 0, BLUE);

        stack.select_layer(0).expect("select layer 0");
        let outcome = draw(&mut stack, 0, 0, RED);

        assert!(!outcome.visible);
        assert!(outcome.first_touch);
        assert_eq!(composite_at(&stack, 0, 0), BLUE);
        let layer_zero = stack.layer(0).expect("layer 0");
        assert_eq!(layer_zero.buffer().pixel_at(0, 0).expect("in bounds"), RED);
        assert_composite_consistent(&stack);
    }

    #[test]
    fn hidden_write_surfaces_after_covering_layer_is_deleted() {
        let mut stack = stack(3, 3);
        stack.add_layer();
        draw(&mut stack, 2, 2, RED);
        // Layer 1 inherits the red pixel from the composite snapshot.
        stack.add_layer();
        draw(&mut stack, 2, 2, GREEN);
        assert_eq!(composite_at(&stack, 2, 2), RED);

        delete(&mut stack, 1);
        assert_eq!(composite_at(&stack, 2, 2), GREEN);
        assert_composite_consistent(&stack);
    }

    #[test]
    fn new_layer_starts_as_composite_snapshot() {
        let mut stack = stack(2, 1);
        stack.add_layer();
        draw(&mut stack, 1, 0, RED);

        stack.add_layer();
        let layer = stack.layer(1).expect("layer 1");
        assert_eq!(layer.buffer(), stack.composite());
        assert!(layer.touched_indexes().is_empty());
        assert_eq!(layer.inherited_pixel_count(), 1);
        assert_eq!(stack.current_layer(), 0);
    }

    #[test]
    fn transparent_write_on_top_reveals_lower_layer() {
        let mut stack = stack(2, 2);
        stack.add_layer();
        draw(&mut stack, 0, 1, RED);
        stack.add_layer();
        stack.select_layer(1).expect("select layer 1");
        draw(&mut stack, 0, 1, BLUE);
        assert_eq!(composite_at(&stack, 0, 1), BLUE);

        draw(&mut stack, 0, 1, Rgba::TRANSPARENT);
        assert_eq!(composite_at(&stack, 0, 1), RED);
        assert_composite_consistent(&stack);
    }

    #[test]
    fn touched_indexes_record_first_opaque_write_once() {
        let mut stack = stack(4, 4);
        stack.add_layer();
        let first = draw(&mut stack, 1, 2, RED);
        let repeat = draw(&mut stack, 1, 2, BLUE);
        let cleared = draw(&mut stack, 1, 2, Rgba::TRANSPARENT);
        let repaint = draw(&mut stack, 1, 2, GREEN);
        let transparent_only = draw(&mut stack, 3, 3, Rgba::TRANSPARENT);

        assert!(first.first_touch);
        assert!(!repeat.first_touch);
        assert!(!cleared.first_touch);
        assert!(!repaint.first_touch);
        assert!(!transparent_only.first_touch);

        let offset = stack.size().pixel_offset(1, 2).expect("in bounds");
        assert_eq!(stack.layer(0).expect("layer 0").touched_indexes(), &[offset]);
    }

    #[test]
    fn remove_layer_clamps_current_selection() {
        let mut stack = stack(2, 2);
        for _ in 0..3 {
            stack.add_layer();
        }
        stack.select_layer(2).expect("select top");

        delete(&mut stack, 0);
        assert_eq!(stack.layer_count(), 2);
        assert_eq!(stack.current_layer(), 1);

        stack.select_layer(0).expect("select bottom");
        delete(&mut stack, 1);
        assert_eq!(stack.layer_count(), 1);
        assert_eq!(stack.current_layer(), 0);

        let evicted = stack.remove_layer(0).expect("remove last");
        assert!(stack.is_empty());
        assert_eq!(stack.current_layer(), 0);
        assert_eq!(evicted.index(), 0);
    }

    #[test]
    fn invalid_indexes_and_coordinates_are_rejected() {
        let mut stack = stack(2, 2);
        assert_eq!(
            stack.write(PixelWrite::new(0, 0, RED)),
            Err(StackError::Empty)
        );
        stack.add_layer();
        assert_eq!(
            stack.select_layer(1),
            Err(StackError::InvalidLayerIndex {
                index: 1,
                layer_count: 1
            })
        );
        assert!(matches!(
            stack.remove_layer(5),
            Err(StackError::InvalidLayerIndex { index: 5, .. })
        ));
        assert!(matches!(
            stack.write(PixelWrite::new(2, 0, RED)),
            Err(StackError::Pixel(ModelError::OutOfBounds { x: 2, .. }))
        ));
        assert_eq!(stack.layer_count(), 1);
    }

    #[test]
    fn eviction_job_visits_touched_then_inherited_without_duplicates() {
        let mut stack = stack(3, 1);
        stack.add_layer();
        draw(&mut stack, 0, 0, RED);
        stack.add_layer();
        stack.select_layer(1).expect("select layer 1");
        draw(&mut stack, 2, 0, BLUE);
        draw(&mut stack, 0, 0, GREEN);

        let evicted = stack.remove_layer(1).expect("remove layer 1");
        let job = stack.eviction_job(evicted, 7);
        let size = stack.size();
        assert_eq!(job.generation(), 7);
        assert_eq!(job.remaining_layer_count(), 1);
        assert_eq!(
            job.coordinates(),
            &[
                size.pixel_offset(2, 0).expect("in bounds"),
                size.pixel_offset(0, 0).expect("in bounds"),
            ]
        );
    }

    #[test]
    fn cancelled_eviction_reports_generation() {
        let mut stack = stack(2, 2);
        stack.add_layer();
        stack.add_layer();
        stack.select_layer(1).expect("select layer 1");
        draw(&mut stack, 0, 0, RED);
        let evicted = stack.remove_layer(1).expect("remove layer 1");
        let job = stack.eviction_job(evicted, 3);

        let cancel = std::sync::atomic::AtomicBool::new(true);
        assert_eq!(
            job.run_cancellable(&cancel),
            Err(EvictionCancelled { generation: 3 })
        );
    }

    #[test]
    fn eviction_result_for_other_size_is_rejected() {
        let mut stack = stack(2, 2);
        let result = EvictionResult {
            generation: 1,
            evicted_layer: LayerKey::default(),
            size: CanvasSize::new(3, 3).expect("non-zero size"),
            patches: Vec::new(),
        };
        assert!(matches!(
            stack.apply_eviction(&result),
            Err(StackError::EvictionSizeMismatch { .. })
        ));
    }

    #[test]
    fn rebuild_composite_repairs_unapplied_eviction() {
        let mut stack = stack(3, 3);
        stack.add_layer();
        draw(&mut stack, 1, 1, RED);
        stack.add_layer();
        stack.select_layer(1).expect("select layer 1");
        draw(&mut stack, 1, 1, BLUE);

        let _evicted = stack.remove_layer(1).expect("remove layer 1");
        assert_eq!(composite_at(&stack, 1, 1), BLUE);
        stack.clear_dirty();

        assert_eq!(stack.rebuild_composite(), 1);
        assert_eq!(composite_at(&stack, 1, 1), RED);
        assert_eq!(stack.dirty().len(), 1);
    }

    #[test]
    fn dirty_pixels_follow_composite_changes() {
        let mut stack = stack(4, 4);
        stack.add_layer();
        stack.add_layer();
        stack.select_layer(1).expect("select layer 1");
        draw(&mut stack, 3, 3, BLUE);
        stack.select_layer(0).expect("select layer 0");
        draw(&mut stack, 3, 3, RED);
        draw(&mut stack, 0, 0, RED);

        let offsets: Vec<_> = stack.dirty().iter().collect();
        let size = stack.size();
        assert_eq!(
            offsets,
            vec![
                size.pixel_offset(0, 0).expect("in bounds"),
                size.pixel_offset(3, 3).expect("in bounds"),
            ]
        );
        stack.clear_dirty();
        assert!(stack.dirty().is_empty());
    }

    #[test]
    fn randomized_edits_keep_composite_equal_to_full_recompute() {
        let palette = [RED, GREEN, BLUE, Rgba::TRANSPARENT, Rgba::new(9, 9, 9, 9)];
        for seed in [0x9e37_79b9_u64, 0x1234_5678, 0xdead_beef] {
            let mut stack = stack(6, 5);
            let mut rng = StdRng::seed_from_u64(seed);
            // Offsets that received a non-transparent write, per layer.
            let mut painted: Vec<HashSet<PixelOffset>> = Vec::new();
            stack.add_layer();
            painted.push(HashSet::new());
            for _ in 0..600 {
                match rng.gen_range(0..20) {
                    0..=1 => {
                        let count_before = stack.layer_count();
                        let current_before = stack.current_layer();
                        stack.add_layer();
                        painted.push(HashSet::new());
                        assert_eq!(stack.layer_count(), count_before + 1);
                        assert_eq!(stack.current_layer(), current_before);
                    }
                    2 if stack.layer_count() > 1 => {
                        let count_before = stack.layer_count();
                        let index = rng.gen_range(0..count_before);
                        delete(&mut stack, index);
                        painted.remove(index);
                        assert_eq!(stack.layer_count(), count_before - 1);
                        assert!(stack.current_layer() < stack.layer_count());
                        assert_composite_consistent(&stack);
                    }
                    3..=4 => {
                        let index = rng.gen_range(0..stack.layer_count());
                        stack.select_layer(index).expect("select in range");
                    }
                    _ => {
                        let x = rng.gen_range(0..6);
                        let y = rng.gen_range(0..5);
                        let color = palette[rng.gen_range(0..palette.len())];
                        let outcome = draw(&mut stack, x, y, color);
                        if color.is_opaque() {
                            painted[stack.current_layer()].insert(outcome.offset);
                        }
                    }
                }
            }
            assert_composite_consistent(&stack);
            assert_eq!(painted.len(), stack.layer_count());

            for (index, painted) in painted.iter().enumerate() {
                let touched = stack.layer(index).expect("layer in range").touched_indexes();
                let unique: HashSet<_> = touched.iter().copied().collect();
                assert_eq!(unique.len(), touched.len(), "duplicate touched index on layer {index}");
                for offset in touched {
                    assert!(
                        painted.contains(offset),
                        "layer {index} lists {offset:?} without a non-transparent write"
                    );
                }
            }
        }
    }
}
