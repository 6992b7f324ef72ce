//! Canvas engine: owns the layer stack behind a single-writer handle, forwards
//! composite changes to the bound render surface and offloads layer eviction
//! recomputes to a background thread.
//!
//! Every stack mutation goes through [`CanvasEngine::submit`]. While an eviction
//! is in flight, submitted commands are queued in order and replayed once its
//! result has been applied, so the composite never mixes pre- and post-eviction
//! state.

mod command_queue;
mod eviction;
mod surface;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use document::{EvictedLayer, LayerStack, StackError};
use model::{CanvasSize, ModelError, PixelBuffer, Rgba};
use protocol::{CanvasCommand, PixelWrite};
use thiserror::Error;

pub use command_queue::{CommandReceiver, CommandSender, command_queue};
pub use surface::{MemoryFrame, MemorySurface, RenderSurface};

use eviction::{EvictionOutcome, EvictionWorker, WorkerDisconnected};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("canvas is not initialized: bind a render surface and add a layer first")]
    UninitializedCanvas,
    #[error("layer index {index} is out of range for {layer_count} layers")]
    InvalidLayerIndex { index: usize, layer_count: usize },
    #[error("pixel ({x}, {y}) is outside the {width}x{height} canvas")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    #[error("canvas size cannot change while {layer_count} layers exist")]
    ResizeWhileActive { layer_count: usize },
    #[error(transparent)]
    Stack(StackError),
}

impl From<StackError> for EngineError {
    fn from(error: StackError) -> Self {
        match error {
            StackError::InvalidLayerIndex { index, layer_count } => {
                EngineError::InvalidLayerIndex { index, layer_count }
            }
            StackError::Empty => EngineError::UninitializedCanvas,
            StackError::Pixel(ModelError::OutOfBounds {
                x,
                y,
                width,
                height,
            }) => EngineError::OutOfBounds {
                x,
                y,
                width,
                height,
            },
            other => EngineError::Stack(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionMode {
    /// Recompute on the `eviction_recompute` thread.
    #[default]
    Background,
    /// Recompute inline inside `delete_layer`.
    Synchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineConfig {
    pub default_size: CanvasSize,
    pub eviction: EvictionMode,
}

impl EngineConfig {
    pub fn synchronous() -> Self {
        Self {
            eviction: EvictionMode::Synchronous,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDisposition {
    Applied,
    /// Held until the in-flight eviction lands.
    Queued,
}

/// A queued command that failed when it was finally replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredError {
    pub command: &'static str,
    pub error: EngineError,
}

struct BoundCanvas {
    surface: Box<dyn RenderSurface>,
    stack: LayerStack,
    // Set once a queued reset cancelled the eviction; the composite is never
    // patched again, so nothing more is shown before the reset drops it.
    stale: bool,
}

impl BoundCanvas {
    fn new(surface: Box<dyn RenderSurface>, size: CanvasSize) -> Self {
        Self {
            surface,
            stack: LayerStack::new(size),
            stale: false,
        }
    }

    fn present_if_dirty(&mut self) {
        if self.stale || self.stack.dirty().is_empty() {
            return;
        }
        self.surface
            .present(self.stack.composite(), self.stack.dirty());
        self.stack.clear_dirty();
    }
}

struct InFlightEviction {
    generation: u64,
    cancel: Arc<AtomicBool>,
}

pub struct CanvasEngine {
    config: EngineConfig,
    size: CanvasSize,
    canvas: Option<BoundCanvas>,
    worker: Option<EvictionWorker>,
    in_flight: Option<InFlightEviction>,
    pending: VecDeque<CanvasCommand>,
    deferred_errors: Vec<DeferredError>,
    next_generation: u64,
}

impl CanvasEngine {
    pub fn new(config: EngineConfig) -> Self {
        let worker = match config.eviction {
            EvictionMode::Synchronous => None,
            EvictionMode::Background => match EvictionWorker::spawn() {
                Ok(worker) => Some(worker),
                Err(error) => {
                    tracing::warn!(%error, "eviction worker unavailable, recomputing inline");
                    None
                }
            },
        };
        Self {
            config,
            size: config.default_size,
            canvas: None,
            worker,
            in_flight: None,
            pending: VecDeque::new(),
            deferred_errors: Vec::new(),
            next_generation: 1,
        }
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    pub fn size(&self) -> CanvasSize {
        self.size
    }

    pub fn is_initialized(&self) -> bool {
        self.canvas.is_some()
    }

    pub fn layer_count(&self) -> usize {
        self.canvas
            .as_ref()
            .map_or(0, |canvas| canvas.stack.layer_count())
    }

    pub fn current_layer(&self) -> usize {
        self.canvas
            .as_ref()
            .map_or(0, |canvas| canvas.stack.current_layer())
    }

    pub fn composite(&self) -> Option<&PixelBuffer> {
        self.canvas.as_ref().map(|canvas| canvas.stack.composite())
    }

    pub fn layer_stack(&self) -> Option<&LayerStack> {
        self.canvas.as_ref().map(|canvas| &canvas.stack)
    }

    pub fn eviction_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn has_background_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    pub fn take_deferred_errors(&mut self) -> Vec<DeferredError> {
        std::mem::take(&mut self.deferred_errors)
    }

    /// Binds the display target. The first bind allocates a blank composite of
    /// the configured size; a later bind swaps the target and re-presents the
    /// current composite to it.
    pub fn init_canvas(&mut self, surface: Box<dyn RenderSurface>) {
        match self.canvas.as_mut() {
            Some(canvas) => {
                let mut previous = std::mem::replace(&mut canvas.surface, surface);
                previous.detach();
                canvas.stack.mark_all_dirty();
                canvas.present_if_dirty();
                tracing::info!("render surface replaced");
            }
            None => {
                let mut canvas = BoundCanvas::new(surface, self.size);
                canvas.stack.mark_all_dirty();
                canvas.present_if_dirty();
                tracing::info!(
                    width = self.size.width(),
                    height = self.size.height(),
                    "canvas initialized"
                );
                self.canvas = Some(canvas);
            }
        }
    }

    pub fn update_size(
        &mut self,
        width: Option<&str>,
        height: Option<&str>,
    ) -> Result<CommandDisposition, EngineError> {
        self.submit(CanvasCommand::UpdateSize {
            width: width.map(str::to_owned),
            height: height.map(str::to_owned),
        })
    }

    pub fn add_layer(&mut self) -> Result<CommandDisposition, EngineError> {
        self.submit(CanvasCommand::AddLayer)
    }

    pub fn select_layer(&mut self, index: usize) -> Result<CommandDisposition, EngineError> {
        self.submit(CanvasCommand::SelectLayer { index })
    }

    pub fn delete_layer(&mut self, index: usize) -> Result<CommandDisposition, EngineError> {
        self.submit(CanvasCommand::DeleteLayer { index })
    }

    pub fn draw(&mut self, x: u32, y: u32, color: Rgba) -> Result<CommandDisposition, EngineError> {
        self.submit(CanvasCommand::Draw(PixelWrite::new(x, y, color)))
    }

    pub fn draw_batch<I>(&mut self, writes: I) -> Result<CommandDisposition, EngineError>
    where
        I: IntoIterator<Item = PixelWrite>,
    {
        self.submit(writes.into_iter().collect())
    }

    pub fn reset_state(&mut self) -> Result<CommandDisposition, EngineError> {
        self.submit(CanvasCommand::ResetState)
    }

    /// Applies `command` now, or queues it behind the in-flight eviction.
    ///
    /// Finished evictions are only landed by [`CanvasEngine::poll_eviction`],
    /// [`CanvasEngine::pump`] or [`CanvasEngine::wait_idle`], so the host's event
    /// loop decides when the result reaches the surface.
    pub fn submit(&mut self, command: CanvasCommand) -> Result<CommandDisposition, EngineError> {
        if let Some(in_flight) = self.in_flight.as_ref() {
            if command == CanvasCommand::ResetState {
                // The reset discards the composite the eviction would patch.
                in_flight.cancel.store(true, Ordering::Release);
            }
            tracing::trace!(
                command = command.name(),
                pending = self.pending.len() + 1,
                "command queued behind eviction"
            );
            self.pending.push_back(command);
            return Ok(CommandDisposition::Queued);
        }
        self.apply(command)?;
        Ok(CommandDisposition::Applied)
    }

    /// Drains up to `max_commands` from the UI command ring. Failures are logged
    /// and kept for [`CanvasEngine::take_deferred_errors`].
    pub fn pump(&mut self, receiver: &mut CommandReceiver, max_commands: usize) -> usize {
        self.poll_eviction();
        let mut drained = 0;
        while drained < max_commands {
            let Ok(command) = receiver.pop() else {
                break;
            };
            drained += 1;
            let name = command.name();
            if let Err(error) = self.submit(command) {
                self.record_deferred(name, error);
            }
        }
        self.poll_eviction();
        drained
    }

    /// Lands a finished eviction, if any, without blocking. Returns true when a
    /// result was consumed.
    pub fn poll_eviction(&mut self) -> bool {
        if self.in_flight.is_none() {
            return false;
        }
        let polled = match self.worker.as_ref() {
            Some(worker) => worker.try_recv(),
            None => Err(WorkerDisconnected),
        };
        match polled {
            Ok(Some(outcome)) => {
                self.land_eviction(outcome);
                true
            }
            Ok(None) => false,
            Err(WorkerDisconnected) => {
                self.recover_lost_eviction();
                true
            }
        }
    }

    /// Blocks until no eviction is in flight and the queued commands have been
    /// replayed.
    pub fn wait_idle(&mut self) {
        while self.in_flight.is_some() {
            let received = match self.worker.as_ref() {
                Some(worker) => worker.recv(),
                None => Err(WorkerDisconnected),
            };
            match received {
                Ok(outcome) => self.land_eviction(outcome),
                Err(WorkerDisconnected) => self.recover_lost_eviction(),
            }
        }
    }

    fn apply(&mut self, command: CanvasCommand) -> Result<(), EngineError> {
        match command {
            CanvasCommand::UpdateSize { width, height } => {
                self.apply_update_size(width.as_deref(), height.as_deref())
            }
            CanvasCommand::AddLayer => {
                let canvas = self.canvas.as_mut().ok_or(EngineError::UninitializedCanvas)?;
                canvas.stack.add_layer();
                Ok(())
            }
            CanvasCommand::SelectLayer { index } => {
                let canvas = self.canvas.as_mut().ok_or(EngineError::UninitializedCanvas)?;
                canvas.stack.select_layer(index)?;
                Ok(())
            }
            CanvasCommand::DeleteLayer { index } => self.apply_delete_layer(index),
            CanvasCommand::Draw(write) => {
                let canvas = self.canvas.as_mut().ok_or(EngineError::UninitializedCanvas)?;
                let written = canvas.stack.write(write);
                canvas.present_if_dirty();
                written?;
                Ok(())
            }
            CanvasCommand::DrawBatch { writes } => {
                let canvas = self.canvas.as_mut().ok_or(EngineError::UninitializedCanvas)?;
                let written = writes
                    .into_iter()
                    .try_for_each(|write| canvas.stack.write(write).map(|_| ()));
                canvas.present_if_dirty();
                written?;
                Ok(())
            }
            CanvasCommand::ResetState => {
                self.apply_reset();
                Ok(())
            }
        }
    }

    fn apply_update_size(
        &mut self,
        width: Option<&str>,
        height: Option<&str>,
    ) -> Result<(), EngineError> {
        let layer_count = self.layer_count();
        if layer_count > 0 {
            return Err(EngineError::ResizeWhileActive { layer_count });
        }
        self.size = CanvasSize::from_inputs(width, height);
        if let Some(canvas) = self.canvas.as_mut() {
            canvas.stack = LayerStack::new(self.size);
            canvas.stack.mark_all_dirty();
            canvas.present_if_dirty();
        }
        tracing::debug!(
            width = self.size.width(),
            height = self.size.height(),
            "canvas size updated"
        );
        Ok(())
    }

    fn apply_delete_layer(&mut self, index: usize) -> Result<(), EngineError> {
        let canvas = self.canvas.as_mut().ok_or(EngineError::UninitializedCanvas)?;
        let evicted = canvas.stack.remove_layer(index)?;
        if canvas.stack.is_empty() {
            self.apply_reset();
            return Ok(());
        }
        self.dispatch_eviction(evicted);
        Ok(())
    }

    fn dispatch_eviction(&mut self, evicted: EvictedLayer) {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let Some(canvas) = self.canvas.as_mut() else {
            return;
        };
        let index = evicted.index();
        let job = canvas.stack.eviction_job(evicted, generation);

        let job = match self.worker.as_ref() {
            Some(worker) => {
                let cancel = Arc::new(AtomicBool::new(false));
                match worker.submit(job, Arc::clone(&cancel)) {
                    Ok(()) => {
                        tracing::debug!(generation, index, "eviction dispatched to worker");
                        self.in_flight = Some(InFlightEviction { generation, cancel });
                        return;
                    }
                    Err(job) => {
                        tracing::warn!(generation, "eviction worker disconnected, recomputing inline");
                        self.worker = None;
                        job
                    }
                }
            }
            None => job,
        };

        let result = job.run();
        if let Err(error) = canvas.stack.apply_eviction(&result) {
            tracing::warn!(%error, generation, "inline eviction result rejected");
        }
        canvas.present_if_dirty();
    }

    fn land_eviction(&mut self, outcome: EvictionOutcome) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        let generation = match &outcome {
            Ok(result) => result.generation,
            Err(cancelled) => cancelled.generation,
        };
        if generation != in_flight.generation {
            tracing::warn!(
                expected = in_flight.generation,
                received = generation,
                "stale eviction outcome ignored"
            );
            self.in_flight = Some(in_flight);
            return;
        }
        let cancelled = in_flight.cancel.load(Ordering::Acquire);
        match outcome {
            Ok(result) if !cancelled => {
                if let Some(canvas) = self.canvas.as_mut() {
                    if let Err(error) = canvas.stack.apply_eviction(&result) {
                        tracing::warn!(%error, generation, "eviction result rejected");
                    }
                    canvas.present_if_dirty();
                }
            }
            Ok(_) => tracing::debug!(generation, "cancelled eviction discarded"),
            Err(_) => tracing::debug!(generation, "eviction cancelled"),
        }
        if cancelled {
            self.mark_canvas_stale();
        }
        self.replay_pending();
    }

    /// The worker died holding the job. Falls back to a full rebuild so the
    /// composite invariant still holds, and recomputes inline from now on.
    fn recover_lost_eviction(&mut self) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        tracing::warn!(
            generation = in_flight.generation,
            "eviction worker lost, rebuilding composite inline"
        );
        self.worker = None;
        if in_flight.cancel.load(Ordering::Acquire) {
            self.mark_canvas_stale();
        } else if let Some(canvas) = self.canvas.as_mut() {
            canvas.stack.rebuild_composite();
            canvas.present_if_dirty();
        }
        self.replay_pending();
    }

    /// Commands queued ahead of the cancelling reset still run, but their frames
    /// are withheld from the surface.
    fn mark_canvas_stale(&mut self) {
        if let Some(canvas) = self.canvas.as_mut() {
            canvas.stale = true;
        }
    }

    fn replay_pending(&mut self) {
        while self.in_flight.is_none() {
            let Some(command) = self.pending.pop_front() else {
                break;
            };
            let name = command.name();
            if let Err(error) = self.apply(command) {
                self.record_deferred(name, error);
            }
        }
    }

    fn record_deferred(&mut self, command: &'static str, error: EngineError) {
        tracing::warn!(command, %error, "canvas command failed");
        self.deferred_errors.push(DeferredError { command, error });
    }

    fn apply_reset(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancel.store(true, Ordering::Release);
        }
        if let Some(mut canvas) = self.canvas.take() {
            canvas.surface.detach();
            tracing::info!("canvas reset to uninitialized");
        }
    }
}

impl Drop for CanvasEngine {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancel.store(true, Ordering::Release);
        }
    }
}
