//! Parallel construction of one epoch of batches.
//!
//! [`ConstructionPipeline`] fans batch indices `0..batch_count` out to a
//! fixed pool of workers and blocks until every index has been handled,
//! like a blocking parallel map.
//!
//! - Training: each worker pulls an index block from the [`ShuffleStream`],
//!   builds the batch and pushes it onto the hand-off queue itself. Queue
//!   order is therefore worker completion order, not batch index order.
//! - Eval: workers return their batch to the coordinator, which stores it
//!   by batch index so the result keeps index order (the padded batch must
//!   stay last).

use crate::batch::EvalBatch;
use crate::batch_builder::BatchBuilder;
use crate::shuffle::ShuffleStream;
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::RecvTimeoutError;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::common::thread::{current_worker_id, init_worker_rng, with_worker_rng};
use super::handoff::HandoffSender;
use super::pool::WorkerPool;

/// Number of batches needed for `example_count` examples, rounded up to a
/// whole number of steps so step-batched consumers never see a partial step.
///
/// `ceil(ceil(example_count / batch_size) / batches_per_step) * batches_per_step`
pub fn count_batches(example_count: usize, batch_size: usize, batches_per_step: usize) -> usize {
    let batches = example_count.div_ceil(batch_size);
    batches.div_ceil(batches_per_step) * batches_per_step
}

/// Seed stream offset separating eval draws from training draws.
const EVAL_SEED_OFFSET: u64 = 0x5EED_0E7A_1000_0000;

#[derive(Debug, Clone, Copy)]
pub(crate) enum ConstructionTask {
    Training {
        epoch: usize,
        batch_index: usize,
        base_seed: u64,
    },
    Eval {
        batch_index: usize,
        base_seed: u64,
    },
}

pub(crate) enum ConstructionOutput {
    Training {
        batch_index: usize,
        result: Result<()>,
    },
    Eval {
        batch_index: usize,
        result: Result<EvalBatch>,
    },
}

impl ConstructionTask {
    /// Output reporting that this task produced nothing.
    fn failed(self, error: anyhow::Error) -> ConstructionOutput {
        match self {
            ConstructionTask::Training { batch_index, .. } => ConstructionOutput::Training {
                batch_index,
                result: Err(error),
            },
            ConstructionTask::Eval { batch_index, .. } => ConstructionOutput::Eval {
                batch_index,
                result: Err(error),
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// How a construction pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EpochOutcome {
    /// Every batch index was handled.
    Completed,
    /// Stop was requested; tasks not yet handed out were skipped.
    Cancelled,
}

/// Everything a construction worker needs, shared by all of them.
struct WorkerContext {
    builder: Arc<BatchBuilder>,
    shuffle: Arc<ShuffleStream>,
    handoff: HandoffSender,
    train_batch_size: usize,
}

impl WorkerContext {
    /// Runs one task, turning a panic into a failed output so the
    /// coordinator still receives exactly one output per task.
    fn handle_guarded(&self, task: ConstructionTask) -> ConstructionOutput {
        match panic::catch_unwind(AssertUnwindSafe(|| self.handle(task))) {
            Ok(output) => output,
            Err(payload) => task.failed(anyhow!(
                "Worker {} panicked on {:?}: {}",
                current_worker_id(),
                task,
                panic_message(payload.as_ref())
            )),
        }
    }

    fn handle(&self, task: ConstructionTask) -> ConstructionOutput {
        match task {
            ConstructionTask::Training {
                epoch,
                batch_index,
                base_seed,
            } => {
                init_worker_rng(batch_index, epoch, base_seed);
                let result = self.build_training(batch_index).with_context(|| {
                    format!(
                        "Worker {} failed on training batch {} of epoch {}",
                        current_worker_id(),
                        batch_index,
                        epoch
                    )
                });
                ConstructionOutput::Training {
                    batch_index,
                    result,
                }
            }
            ConstructionTask::Eval {
                batch_index,
                base_seed,
            } => {
                init_worker_rng(batch_index, 0, base_seed);
                let range = self.builder.eval_user_range(batch_index);
                let result = with_worker_rng(|rng| self.builder.build_eval_batch(range, rng))
                    .with_context(|| {
                        format!(
                            "Worker {} failed on eval batch {}",
                            current_worker_id(),
                            batch_index
                        )
                    });
                ConstructionOutput::Eval {
                    batch_index,
                    result,
                }
            }
        }
    }

    fn build_training(&self, batch_index: usize) -> Result<()> {
        let indices = self
            .shuffle
            .next_block(self.train_batch_size)
            .with_context(|| format!("No epoch order available for batch {}", batch_index))?;
        let batch = with_worker_rng(|rng| self.builder.build_training_batch(&indices, rng))?;
        self.handoff.push(batch)
    }
}

/// Fixed-size worker pool that materializes whole epochs of batches.
pub(crate) struct ConstructionPipeline {
    pool: WorkerPool<ConstructionTask, ConstructionOutput>,
    stop: Arc<AtomicBool>,
}

impl ConstructionPipeline {
    /// # Arguments
    /// - `num_workers`: Pool size; a tuning constant, independent of batch count.
    /// - `builder`, `shuffle`: Shared with all workers.
    /// - `handoff`: Where finished training batches go.
    /// - `train_batch_size`: Indices pulled from `shuffle` per training batch.
    /// - `stop`: Checked before every task is handed out.
    /// - `poll_interval`: How often idle workers check for shutdown.
    pub(crate) fn new(
        num_workers: usize,
        builder: Arc<BatchBuilder>,
        shuffle: Arc<ShuffleStream>,
        handoff: HandoffSender,
        train_batch_size: usize,
        stop: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let context = Arc::new(WorkerContext {
            builder,
            shuffle,
            handoff,
            train_batch_size,
        });

        // Two tasks per worker keeps everyone busy without queueing the epoch.
        let buffer_size = num_workers * 2;
        let pool = WorkerPool::new(
            "construction-worker",
            num_workers,
            buffer_size,
            move |task_rx, output_tx, shutdown| loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let task = match task_rx.recv_timeout(poll_interval) {
                    Ok(task) => task,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                if output_tx.send(context.handle_guarded(task)).is_err() {
                    break;
                }
            },
        )
        .context("Failed to initialize construction worker pool")?;

        Ok(Self { pool, stop })
    }

    /// Builds `batch_count` training batches onto the hand-off queue.
    pub(crate) fn construct_training_epoch(
        &self,
        epoch: usize,
        batch_count: usize,
        seed: u64,
    ) -> Result<EpochOutcome> {
        let tasks = (0..batch_count).map(|batch_index| ConstructionTask::Training {
            epoch,
            batch_index,
            base_seed: seed,
        });
        self.run_tasks(tasks, |output| match output {
            ConstructionOutput::Training { result, .. } => result,
            ConstructionOutput::Eval { batch_index, .. } => Err(anyhow!(
                "Received eval batch {} during a training epoch",
                batch_index
            )),
        })
    }

    /// Builds `batch_count` eval batches and returns them in index order.
    ///
    /// Returns `Ok(None)` if stop was requested before all were built.
    pub(crate) fn construct_eval_epoch(
        &self,
        batch_count: usize,
        seed: u64,
    ) -> Result<Option<Vec<EvalBatch>>> {
        let base_seed = seed.wrapping_add(EVAL_SEED_OFFSET);
        let tasks = (0..batch_count).map(|batch_index| ConstructionTask::Eval {
            batch_index,
            base_seed,
        });

        let mut slots: Vec<Option<EvalBatch>> = (0..batch_count).map(|_| None).collect();
        let outcome = self.run_tasks(tasks, |output| match output {
            ConstructionOutput::Eval {
                batch_index,
                result,
            } => {
                slots[batch_index] = Some(result?);
                Ok(())
            }
            ConstructionOutput::Training { batch_index, .. } => Err(anyhow!(
                "Received training batch {} during eval construction",
                batch_index
            )),
        })?;

        if outcome == EpochOutcome::Cancelled {
            return Ok(None);
        }
        let batches = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.ok_or_else(|| anyhow!("Eval batch {} was never built", index)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(batches))
    }

    /// Hands out `tasks` keeping at most `buffer_size` in flight, feeding
    /// every output to `on_output`.
    ///
    /// After the first failure no further tasks are handed out; in-flight
    /// tasks are drained and the first error is returned.
    fn run_tasks(
        &self,
        tasks: impl Iterator<Item = ConstructionTask>,
        mut on_output: impl FnMut(ConstructionOutput) -> Result<()>,
    ) -> Result<EpochOutcome> {
        let mut tasks = tasks.peekable();
        let mut in_flight = 0usize;
        let mut first_error: Option<anyhow::Error> = None;
        let mut cancelled = false;

        loop {
            while first_error.is_none()
                && in_flight < self.pool.buffer_size()
                && tasks.peek().is_some()
            {
                if self.stop.load(Ordering::Relaxed) {
                    cancelled = true;
                    break;
                }
                if let Some(task) = tasks.next() {
                    self.pool.submit(task)?;
                    in_flight += 1;
                }
            }

            if in_flight == 0 {
                break;
            }
            let output = self.pool.receive()?;
            in_flight -= 1;
            if let Err(error) = on_output(output) {
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None if cancelled || tasks.peek().is_some() => Ok(EpochOutcome::Cancelled),
            None => Ok(EpochOutcome::Completed),
        }
    }
}
