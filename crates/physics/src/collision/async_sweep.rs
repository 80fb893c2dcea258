//! Background worker pool for deferred volume sweeps.
//!
//! The simulation thread submits a [`SweepQuery`], receives a
//! [`SweepHandle`], and polls for the result on a later tick. Workers never
//! call back into the simulation; results are only observed by polling.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use thiserror::Error;

use super::flags::ContentFlags;
use super::trace::{Pose, TraceResult, TraceShape};
use super::world::CollisionWorld;

/// A shape sweep to run off the simulation thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepQuery {
    pub start: Pose,
    pub end: Pose,
    pub shape: TraceShape,
    pub mask: ContentFlags,
}

/// Ticket for a submitted query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SweepHandle(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SweepQueueError {
    #[error("async sweep queue is full")]
    Full,
    #[error("async sweep workers have shut down")]
    Disconnected,
}

/// Bounded producer/consumer pool of sweep workers sharing one world.
pub struct AsyncSweeper {
    requests: Option<Sender<(SweepHandle, SweepQuery)>>,
    results: Receiver<(SweepHandle, TraceResult)>,
    completed: HashMap<SweepHandle, TraceResult>,
    workers: Vec<JoinHandle<()>>,
    next_handle: u64,
    in_flight: usize,
}

impl AsyncSweeper {
    /// Start `workers` threads reading from a queue of at most `queue_depth`
    /// pending queries.
    pub fn spawn(world: Arc<CollisionWorld>, workers: usize, queue_depth: usize) -> Self {
        let (request_tx, request_rx) = channel::bounded::<(SweepHandle, SweepQuery)>(queue_depth.max(1));
        let (result_tx, result_rx) = channel::unbounded();

        let workers = (0..workers.max(1))
            .map(|_| {
                let world = Arc::clone(&world);
                let requests = request_rx.clone();
                let results = result_tx.clone();
                std::thread::spawn(move || {
                    for (handle, query) in requests.iter() {
                        let result = world.trace(&query.start, &query.end, query.shape, query.mask);
                        if results.send((handle, result)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        Self {
            requests: Some(request_tx),
            results: result_rx,
            completed: HashMap::new(),
            workers,
            next_handle: 0,
            in_flight: 0,
        }
    }

    /// Queue a sweep. Never blocks: a full queue is reported to the caller.
    pub fn submit(&mut self, query: SweepQuery) -> Result<SweepHandle, SweepQueueError> {
        let sender = self.requests.as_ref().ok_or(SweepQueueError::Disconnected)?;
        let handle = SweepHandle(self.next_handle);

        match sender.try_send((handle, query)) {
            Ok(()) => {
                self.next_handle += 1;
                self.in_flight += 1;
                Ok(handle)
            }
            Err(TrySendError::Full(_)) => Err(SweepQueueError::Full),
            Err(TrySendError::Disconnected(_)) => Err(SweepQueueError::Disconnected),
        }
    }

    /// Take the result for `handle` if a worker has finished it.
    pub fn poll(&mut self, handle: &SweepHandle) -> Option<TraceResult> {
        self.drain();
        self.completed.remove(handle)
    }

    /// Block until the result for `handle` arrives. Used by tests and
    /// shutdown paths only; the simulation polls.
    pub fn wait(&mut self, handle: &SweepHandle) -> Option<TraceResult> {
        loop {
            if let Some(result) = self.completed.remove(handle) {
                return Some(result);
            }
            let (done, result) = self.results.recv().ok()?;
            self.in_flight = self.in_flight.saturating_sub(1);
            self.completed.insert(done, result);
        }
    }

    /// Queries submitted but not yet collected by the simulation.
    pub fn pending(&self) -> usize {
        self.in_flight + self.completed.len()
    }

    fn drain(&mut self) {
        while let Ok((handle, result)) = self.results.try_recv() {
            self.in_flight = self.in_flight.saturating_sub(1);
            self.completed.insert(handle, result);
        }
    }
}

impl Drop for AsyncSweeper {
    fn drop(&mut self) {
        // Closing the request channel ends every worker loop.
        self.requests = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::warn!("async sweep worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for AsyncSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSweeper")
            .field("workers", &self.workers.len())
            .field("pending", &self.pending())
            .finish()
    }
}
