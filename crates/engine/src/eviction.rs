use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, unbounded};
use document::{EvictionCancelled, EvictionJob, EvictionResult};

pub(crate) type EvictionOutcome = Result<EvictionResult, EvictionCancelled>;

struct EvictionRequest {
    job: EvictionJob,
    cancel: Arc<AtomicBool>,
}

/// The worker thread is gone; any job it held is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerDisconnected;

/// Background thread running eviction recomputes one at a time.
pub(crate) struct EvictionWorker {
    request_sender: Option<Sender<EvictionRequest>>,
    outcome_receiver: Receiver<EvictionOutcome>,
    join_handle: Option<JoinHandle<()>>,
}

impl EvictionWorker {
    pub(crate) fn spawn() -> std::io::Result<Self> {
        // The engine keeps at most one eviction in flight.
        let (request_sender, request_receiver) = bounded::<EvictionRequest>(1);
        let (outcome_sender, outcome_receiver) = unbounded();

        let join_handle = std::thread::Builder::new()
            .name("eviction_recompute".to_owned())
            .spawn(move || eviction_loop(request_receiver, outcome_sender))?;

        Ok(Self {
            request_sender: Some(request_sender),
            outcome_receiver,
            join_handle: Some(join_handle),
        })
    }

    /// Hands `job` to the worker, or gives it back when the worker is gone.
    pub(crate) fn submit(&self, job: EvictionJob, cancel: Arc<AtomicBool>) -> Result<(), EvictionJob> {
        let Some(sender) = self.request_sender.as_ref() else {
            return Err(job);
        };
        sender
            .send(EvictionRequest { job, cancel })
            .map_err(|error| error.into_inner().job)
    }

    pub(crate) fn try_recv(&self) -> Result<Option<EvictionOutcome>, WorkerDisconnected> {
        match self.outcome_receiver.try_recv() {
            Ok(outcome) => Ok(Some(outcome)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(WorkerDisconnected),
        }
    }

    pub(crate) fn recv(&self) -> Result<EvictionOutcome, WorkerDisconnected> {
        self.outcome_receiver.recv().map_err(|_| WorkerDisconnected)
    }
}

impl Drop for EvictionWorker {
    fn drop(&mut self) {
        // Closing the request channel ends the loop.
        self.request_sender.take();
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                tracing::warn!("eviction worker thread panicked");
            }
        }
    }
}

fn eviction_loop(requests: Receiver<EvictionRequest>, outcomes: Sender<EvictionOutcome>) {
    for EvictionRequest { job, cancel } in requests.iter() {
        let generation = job.generation();
        let coordinate_count = job.coordinates().len();
        let layer_count = job.remaining_layer_count();
        let outcome = job.run_cancellable(&cancel);
        tracing::debug!(
            generation,
            coordinate_count,
            layer_count,
            cancelled = outcome.is_err(),
            "eviction recompute finished"
        );
        if outcomes.send(outcome).is_err() {
            break;
        }
    }
    tracing::debug!("eviction worker exiting");
}
