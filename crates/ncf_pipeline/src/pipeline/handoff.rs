//! Hand-off queue between construction workers and the training loop.
//!
//! Workers push finished training batches; the training loop pops them. The
//! queue carries `Result`s so a construction failure reaches the consumer as
//! an error on its next pop instead of leaving it blocked forever.
//!
//! # Capacity
//! Unbounded by default: construction may run up to a full epoch ahead and
//! memory grows with the backlog. With a capacity, producers block once it
//! is reached and give up when the stop flag is raised.

use crate::batch::TrainingBatch;
use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type Entry = Result<TrainingBatch>;

/// Creates a connected sender/receiver pair.
///
/// # Arguments
/// - `capacity`: `None` for an unbounded queue, `Some(n)` to block producers
///   once `n` batches are waiting.
/// - `stop`: flag that makes blocked producers give up.
/// - `poll_interval`: how often blocked producers re-check `stop`.
pub(crate) fn handoff_queue(
    capacity: Option<usize>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
) -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = match capacity {
        Some(capacity) => bounded(capacity),
        None => unbounded(),
    };
    (
        HandoffSender {
            tx,
            stop,
            poll_interval,
        },
        HandoffReceiver { rx },
    )
}

/// Producer side; cheap to clone into every worker.
#[derive(Clone)]
pub(crate) struct HandoffSender {
    tx: Sender<Entry>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl HandoffSender {
    /// Enqueues a finished batch, blocking while a bounded queue is full.
    pub(crate) fn push(&self, batch: TrainingBatch) -> Result<()> {
        self.send(Ok(batch))
    }

    /// Enqueues a construction failure for the consumer to observe.
    pub(crate) fn push_error(&self, error: anyhow::Error) -> Result<()> {
        self.send(Err(error))
    }

    fn send(&self, entry: Entry) -> Result<()> {
        let mut pending = entry;
        let mut waits = 0usize;
        loop {
            match self.tx.send_timeout(pending, self.poll_interval) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(entry)) => {
                    if self.stop.load(Ordering::Relaxed) {
                        bail!("Construction stopped while waiting for queue space");
                    }
                    waits += 1;
                    if waits.is_power_of_two() {
                        debug!(waits, "Waiting for training data to be consumed");
                    }
                    pending = entry;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    bail!("Training consumer has gone away")
                }
            }
        }
    }
}

/// Consumer side, owned by the `DataConstructor`.
pub(crate) struct HandoffReceiver {
    rx: Receiver<Entry>,
}

impl HandoffReceiver {
    /// Removes the oldest batch, blocking while the queue is empty.
    ///
    /// Fails with the producer's error if construction failed, or once every
    /// producer is gone and the queue is drained.
    pub(crate) fn pop(&self) -> Result<TrainingBatch> {
        self.rx.recv().map_err(|_| {
            anyhow!("Training data construction has finished or stopped; no batches remain")
        })?
    }

    /// Number of batches currently waiting.
    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }
}
