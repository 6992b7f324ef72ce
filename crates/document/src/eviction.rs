use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bitvec::prelude::{BitSlice, Lsb0};
use model::{BYTES_PER_PIXEL, CanvasSize, PixelBuffer, PixelOffset, Rgba};
use thiserror::Error;

use crate::{LayerKey, occlusion};

const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Recompute request for the composite pixels a deleted layer may have been
/// showing. Owns a snapshot of the remaining stack so it can run on any thread.
#[derive(Debug)]
pub struct EvictionJob {
    generation: u64,
    evicted_layer: LayerKey,
    size: CanvasSize,
    coordinates: Vec<PixelOffset>,
    remaining: Vec<Arc<PixelBuffer>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositePatch {
    pub offset: PixelOffset,
    pub color: Rgba,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionResult {
    pub generation: u64,
    pub evicted_layer: LayerKey,
    pub size: CanvasSize,
    pub patches: Vec<CompositePatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("eviction recompute {generation} was cancelled")]
pub struct EvictionCancelled {
    pub generation: u64,
}

impl EvictionJob {
    pub(crate) fn new(
        generation: u64,
        evicted_layer: LayerKey,
        size: CanvasSize,
        touched: Vec<PixelOffset>,
        inherited: &BitSlice<usize, Lsb0>,
        remaining: Vec<Arc<PixelBuffer>>,
    ) -> Self {
        let mut inherited_only = inherited.to_bitvec();
        for offset in &touched {
            inherited_only.set(offset.pixel_index(), false);
        }
        let mut coordinates = touched;
        coordinates.extend(
            inherited_only
                .iter_ones()
                .map(|pixel_index| PixelOffset::from_byte_offset(pixel_index * BYTES_PER_PIXEL)),
        );
        Self {
            generation,
            evicted_layer,
            size,
            coordinates,
            remaining,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn coordinates(&self) -> &[PixelOffset] {
        &self.coordinates
    }

    pub fn remaining_layer_count(&self) -> usize {
        self.remaining.len()
    }

    pub fn run(self) -> EvictionResult {
        let patches = self
            .coordinates
            .iter()
            .map(|offset| self.patch_at(*offset))
            .collect();
        self.finish(patches)
    }

    /// Same as [`EvictionJob::run`] but polls `cancel` while walking the
    /// coordinates.
    pub fn run_cancellable(self, cancel: &AtomicBool) -> Result<EvictionResult, EvictionCancelled> {
        let mut patches = Vec::with_capacity(self.coordinates.len());
        for (visited, offset) in self.coordinates.iter().enumerate() {
            if visited % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Acquire) {
                return Err(EvictionCancelled {
                    generation: self.generation,
                });
            }
            patches.push(self.patch_at(*offset));
        }
        Ok(self.finish(patches))
    }

    fn patch_at(&self, offset: PixelOffset) -> CompositePatch {
        CompositePatch {
            offset,
            color: occlusion::topmost_opaque(self.remaining.iter().map(Arc::as_ref), offset),
        }
    }

    fn finish(self, patches: Vec<CompositePatch>) -> EvictionResult {
        let Self {
            generation,
            evicted_layer,
            size,
            remaining,
            ..
        } = self;
        // Drop the snapshot here so the owner's next write can mutate in place.
        drop(remaining);
        EvictionResult {
            generation,
            evicted_layer,
            size,
            patches,
        }
    }
}
