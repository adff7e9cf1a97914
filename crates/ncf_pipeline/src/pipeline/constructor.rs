//! src/pipeline/constructor.rs
//!
//! The [`DataConstructor`] orchestrator and the iterators it hands to the
//! training loop.
//!
//! # Lifecycle
//! ```text
//!   new() ──> start() ──> [background: data-constructor thread]
//!   Created    Running      shuffle.start()
//!                           sampler.construct_lookup()
//!                           epoch 0: training batches ─> hand-off queue
//!                                    eval batches ────> eval store (once)
//!                           epoch 1..max_epochs: training batches
//!   stop() / Drop ──> Stopped (checked between epochs and between tasks)
//! ```
//!
//! The training loop runs on its own thread and only touches the consumer
//! side: [`DataConstructor::training_batches`] once per epoch, and
//! [`DataConstructor::eval_batches`] once per evaluation pass.

use crate::batch::{EvalBatch, TrainingBatch};
use crate::batch_builder::BatchBuilder;
use crate::dataset::RecommendationDataset;
use crate::negative_sampler::NegativeSampler;
use crate::shuffle::{ShuffleConfig, ShuffleStream};
use anyhow::{anyhow, bail, ensure, Context, Result};
use rand::Rng;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::config::ConstructorConfig;
use super::construction::{count_batches, ConstructionPipeline, EpochOutcome};
use super::handoff::{handoff_queue, HandoffReceiver, HandoffSender};
use super::summary::ConstructorSummary;

// ================================================================================================
// 1. Shared state
// ================================================================================================
/// Eval result set shared between the background thread and consumers.
///
/// Written at most once. Errors are stored as text because every consumer
/// call must be able to report the same failure.
#[derive(Default)]
struct EvalStore {
    batches: OnceLock<std::result::Result<Arc<[EvalBatch]>, String>>,
    /// Set when the background thread exits, however it exits.
    finished: AtomicBool,
}

/// Marks the eval store finished when the background thread unwinds or returns.
struct FinishedGuard(Arc<EvalStore>);

impl Drop for FinishedGuard {
    fn drop(&mut self) {
        self.0.finished.store(true, Ordering::Release);
    }
}

/// Sizes derived from the dataset and configuration at creation time.
#[derive(Debug, Clone, Copy)]
struct Sizing {
    train_batch_size: usize,
    train_epoch_size: usize,
    train_batches_per_epoch: usize,
    eval_batch_size: usize,
    eval_users_per_batch: usize,
    eval_batches_per_epoch: usize,
}

// ================================================================================================
// 2. DataConstructor
// ================================================================================================
/// Background generator of negative-sampled training batches and a fixed set
/// of eval batches.
///
/// # Example
/// ```ignore
/// let config = ConstructorConfig::builder()
///     .max_epochs(3)
///     .train_batch_size(1024)
///     .eval_batch_size(1000)
///     .num_eval_negatives(999)
///     .seed(42)
///     .build();
/// let mut constructor =
///     DataConstructor::new(dataset, config, Box::new(MaterializedNegativeSampler::new()))?;
/// constructor.start()?;
///
/// for _ in 0..3 {
///     for batch in constructor.training_batches()? {
///         train_step(batch?);
///     }
///     for batch in &constructor.eval_batches()? {
///         evaluate(batch);
///     }
/// }
/// constructor.stop();
/// constructor.join()?;
/// ```
///
/// # Thread safety
/// All consumer methods take `&self`; the constructor can be shared with the
/// training loop behind an `Arc` once started.
pub struct DataConstructor {
    dataset: Arc<RecommendationDataset>,
    config: ConstructorConfig,
    sizing: Sizing,
    seed: u64,
    sampler: Option<Box<dyn NegativeSampler>>,
    shuffle: Arc<ShuffleStream>,
    handoff_tx: Option<HandoffSender>,
    handoff_rx: HandoffReceiver,
    eval: Arc<EvalStore>,
    stop: Arc<AtomicBool>,
    background: Option<thread::JoinHandle<Result<()>>>,
    started: bool,
}

impl DataConstructor {
    /// Validates everything and computes sizing. No thread is started.
    ///
    /// # Arguments
    /// - `dataset`: Validated interactions; shared read-only with all workers.
    /// - `config`: Construction settings, see [`ConstructorConfig`].
    /// - `sampler`: Negative sampling strategy; its lookup is built in the
    ///   background thread after [`start`](Self::start).
    ///
    /// # Errors
    /// - Any [`ConstructorConfig::validate`] failure
    /// - The sampler cannot represent the dataset
    /// - The training epoch does not fit the epoch index type
    pub fn new(
        dataset: RecommendationDataset,
        config: ConstructorConfig,
        sampler: Box<dyn NegativeSampler>,
    ) -> Result<Self> {
        config
            .validate()
            .context("Invalid data constructor configuration")?;
        sampler
            .check_dataset(&dataset)
            .with_context(|| format!("{} sampler rejected the dataset", sampler.name()))?;

        let train_batch_size = config
            .train_batch_size
            .ok_or_else(|| anyhow!("train_batch_size must be set"))?;
        let eval_batch_size = config
            .eval_batch_size
            .ok_or_else(|| anyhow!("eval_batch_size must be set"))?;

        let train_epoch_size = (1 + config.num_train_negatives)
            .checked_mul(dataset.train().len())
            .ok_or_else(|| anyhow!("Training epoch size overflows"))?;
        let train_batches_per_epoch = count_batches(
            train_epoch_size,
            train_batch_size,
            config.batches_per_train_step,
        );
        let eval_users_per_batch = eval_batch_size / (1 + config.num_eval_negatives);
        let eval_batches_per_epoch = count_batches(
            dataset.eval().len(),
            eval_users_per_batch,
            config.batches_per_eval_step,
        );
        let sizing = Sizing {
            train_batch_size,
            train_epoch_size,
            train_batches_per_epoch,
            eval_batch_size,
            eval_users_per_batch,
            eval_batches_per_epoch,
        };

        let seed = config.seed.unwrap_or_else(|| rand::rng().random());

        // Every training batch takes a full block, so blocks straddle epoch
        // boundaries; produce exactly the permutations the run consumes.
        let indices_needed = config
            .max_epochs
            .saturating_mul(train_batches_per_epoch)
            .saturating_mul(train_batch_size);
        let shuffle = ShuffleStream::new(ShuffleConfig {
            epoch_size: train_epoch_size,
            num_workers: config.shuffle_workers,
            max_epochs_ahead: config.max_epochs_ahead,
            num_to_produce: Some(indices_needed.div_ceil(train_epoch_size)),
            seed,
        })
        .context("Failed to create shuffle stream")?;

        let stop = Arc::new(AtomicBool::new(false));
        let (handoff_tx, handoff_rx) = handoff_queue(
            config.handoff_capacity,
            stop.clone(),
            config.worker_poll_interval,
        );

        Ok(Self {
            dataset: Arc::new(dataset),
            config,
            sizing,
            seed,
            sampler: Some(sampler),
            shuffle: Arc::new(shuffle),
            handoff_tx: Some(handoff_tx),
            handoff_rx,
            eval: Arc::new(EvalStore::default()),
            stop,
            background: None,
            started: false,
        })
    }

    /// Spawns the background construction thread.
    ///
    /// # Errors
    /// Fails if called more than once or the thread cannot be spawned.
    pub fn start(&mut self) -> Result<()> {
        ensure!(!self.started, "DataConstructor has already been started");
        let sampler = self
            .sampler
            .take()
            .ok_or_else(|| anyhow!("DataConstructor has already been started"))?;
        let handoff = self
            .handoff_tx
            .take()
            .ok_or_else(|| anyhow!("DataConstructor has already been started"))?;

        let epoch_loop = EpochLoop {
            dataset: self.dataset.clone(),
            config: self.config.clone(),
            sizing: self.sizing,
            seed: self.seed,
            sampler,
            shuffle: self.shuffle.clone(),
            handoff,
            eval: self.eval.clone(),
            stop: self.stop.clone(),
        };

        let handle = thread::Builder::new()
            .name("data-constructor".to_string())
            .spawn(move || epoch_loop.run())
            .context("Failed to spawn data construction thread")?;

        self.background = Some(handle);
        self.started = true;
        info!(
            seed = self.seed,
            workers = self.config.num_workers,
            epochs = self.config.max_epochs,
            "Data construction started"
        );
        Ok(())
    }

    /// Iterator over the next epoch's training batches.
    ///
    /// Yields exactly [`train_batches_per_epoch`](Self::train_batches_per_epoch)
    /// items, blocking while the hand-off queue is empty. Batches arrive in
    /// worker completion order. A construction failure is yielded as `Err`
    /// and ends the iterator.
    pub fn training_batches(&self) -> Result<TrainingBatches<'_>> {
        ensure!(
            self.started,
            "DataConstructor::training_batches called before start()"
        );
        Ok(TrainingBatches {
            queue: &self.handoff_rx,
            remaining: self.sizing.train_batches_per_epoch,
            failed: false,
        })
    }

    /// The materialized eval batches, in batch index order.
    ///
    /// Blocks, polling every `eval_poll_interval`, until the first training
    /// epoch and the eval epoch have been constructed. Every call returns the
    /// same shared batches.
    ///
    /// # Errors
    /// - Called before [`start`](Self::start)
    /// - Eval construction failed
    /// - Construction ended (stopped or failed) before eval batches existed
    pub fn eval_batches(&self) -> Result<EvalBatches> {
        ensure!(
            self.started,
            "DataConstructor::eval_batches called before start()"
        );
        loop {
            // Read the flag first: the store is always set before it is raised.
            let finished = self.eval.finished.load(Ordering::Acquire);
            if let Some(stored) = self.eval.batches.get() {
                return match stored {
                    Ok(batches) => Ok(EvalBatches {
                        batches: batches.clone(),
                    }),
                    Err(message) => Err(anyhow!("Eval construction failed: {}", message)),
                };
            }
            if finished {
                bail!("Data construction ended before eval batches were built");
            }
            thread::sleep(self.config.eval_poll_interval);
        }
    }

    /// Requests cooperative shutdown.
    ///
    /// The background loop stops handing out new batch tasks and ends before
    /// its next epoch; tasks already running complete. The shuffle stream is
    /// stopped as well.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::Relaxed) {
            info!("Data construction stop requested");
        }
        self.shuffle.stop();
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Waits for the background thread to exit.
    ///
    /// Returns the loop's error, if it failed for a reason other than a stop
    /// request. Without a prior [`stop`](Self::stop) this waits for every
    /// epoch to be constructed, which never happens if a bounded hand-off
    /// queue is left full.
    pub fn join(&mut self) -> Result<()> {
        match self.background.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("Data construction thread panicked"))?,
            None => Ok(()),
        }
    }

    pub fn dataset(&self) -> &RecommendationDataset {
        &self.dataset
    }

    /// Effective seed; drawn from OS entropy if none was configured.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn train_batches_per_epoch(&self) -> usize {
        self.sizing.train_batches_per_epoch
    }

    /// Size of the training epoch index space, `(1 + negatives) * positives`.
    pub fn train_epoch_size(&self) -> usize {
        self.sizing.train_epoch_size
    }

    pub fn eval_batches_per_epoch(&self) -> usize {
        self.sizing.eval_batches_per_epoch
    }

    pub fn eval_users_per_batch(&self) -> usize {
        self.sizing.eval_users_per_batch
    }

    /// Training batches constructed but not yet consumed.
    pub fn queued_training_batches(&self) -> usize {
        self.handoff_rx.len()
    }

    pub fn summary(&self) -> ConstructorSummary {
        ConstructorSummary {
            num_users: self.dataset.num_users(),
            num_items: self.dataset.num_items(),
            train_positive_count: self.dataset.train().len(),
            train_batch_size: self.sizing.train_batch_size,
            train_batches_per_epoch: self.sizing.train_batches_per_epoch,
            eval_positive_count: self.dataset.eval().len(),
            eval_batch_size: self.sizing.eval_batch_size,
            eval_batches_per_epoch: self.sizing.eval_batches_per_epoch,
        }
    }
}

impl fmt::Display for DataConstructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.summary(), f)
    }
}

impl Drop for DataConstructor {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.background.take() {
            let _ = handle.join();
        }
    }
}

// ================================================================================================
// 3. Background epoch loop
// ================================================================================================
/// Everything the background thread owns.
struct EpochLoop {
    dataset: Arc<RecommendationDataset>,
    config: ConstructorConfig,
    sizing: Sizing,
    seed: u64,
    sampler: Box<dyn NegativeSampler>,
    shuffle: Arc<ShuffleStream>,
    handoff: HandoffSender,
    eval: Arc<EvalStore>,
    stop: Arc<AtomicBool>,
}

impl EpochLoop {
    /// Thread entry point: runs the loop and surfaces its failure to both
    /// consumer sides.
    fn run(self) -> Result<()> {
        let _finished = FinishedGuard(self.eval.clone());
        let error_sink = self.handoff.clone();
        let eval = self.eval.clone();
        let stop = self.stop.clone();

        let start_time = Instant::now();
        let result = self.run_epoch_loop();

        match result {
            Ok(()) => {
                info!(
                    elapsed_secs = start_time.elapsed().as_secs_f64(),
                    "Data construction finished"
                );
                Ok(())
            }
            Err(error) if stop.load(Ordering::Relaxed) => {
                let message = format!("{:#}", error);
                debug!(error = %message, "Construction cancelled by stop");
                Ok(())
            }
            Err(error) => {
                let message = format!("{:#}", error);
                warn!(error = %message, "Data construction failed");
                let _ = eval.batches.set(Err(message.clone()));
                if error_sink.push_error(anyhow!("{}", message)).is_err() {
                    debug!("Training consumer did not receive the construction error");
                }
                Err(error)
            }
        }
    }

    fn run_epoch_loop(self) -> Result<()> {
        let EpochLoop {
            dataset,
            config,
            sizing,
            seed,
            mut sampler,
            shuffle,
            handoff,
            eval,
            stop,
        } = self;

        shuffle.start()?;

        sampler
            .construct_lookup(&dataset)
            .with_context(|| format!("Failed to build {} negative lookup", sampler.name()))?;
        let sampler: Arc<dyn NegativeSampler> = Arc::from(sampler);

        let builder = Arc::new(BatchBuilder::new(
            dataset,
            sampler,
            config.num_train_negatives,
            sizing.eval_users_per_batch,
            config.num_eval_negatives,
        )?);
        let pipeline = ConstructionPipeline::new(
            config.num_workers,
            builder,
            shuffle,
            handoff,
            sizing.train_batch_size,
            stop.clone(),
            config.worker_poll_interval,
        )?;

        for epoch in 0..config.max_epochs {
            if stop.load(Ordering::Relaxed) {
                info!(epoch, "Stopping data construction before epoch");
                return Ok(());
            }

            let start_time = Instant::now();
            let outcome = pipeline
                .construct_training_epoch(epoch, sizing.train_batches_per_epoch, seed)
                .with_context(|| format!("Training epoch {} construction failed", epoch))?;
            if outcome == EpochOutcome::Cancelled {
                info!(epoch, "Training epoch construction cancelled");
                return Ok(());
            }
            info!(
                epoch,
                batches = sizing.train_batches_per_epoch,
                elapsed_secs = start_time.elapsed().as_secs_f64(),
                "Training epoch constructed"
            );

            if epoch == 0 {
                let start_time = Instant::now();
                let batches = pipeline
                    .construct_eval_epoch(sizing.eval_batches_per_epoch, seed)
                    .context("Eval construction failed")?;
                let Some(batches) = batches else {
                    info!("Eval construction cancelled");
                    return Ok(());
                };
                if eval.batches.set(Ok(batches.into())).is_err() {
                    bail!("Eval batches were constructed twice");
                }
                info!(
                    batches = sizing.eval_batches_per_epoch,
                    elapsed_secs = start_time.elapsed().as_secs_f64(),
                    "Eval data constructed"
                );
            }
        }
        Ok(())
    }
}

// ================================================================================================
// 4. Consumer iterators
// ================================================================================================
/// One epoch of training batches, pulled from the hand-off queue.
pub struct TrainingBatches<'a> {
    queue: &'a HandoffReceiver,
    remaining: usize,
    failed: bool,
}

impl Iterator for TrainingBatches<'_> {
    type Item = Result<TrainingBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.failed {
            return None;
        }
        let next = self.queue.pop();
        match next {
            Ok(_) => self.remaining -= 1,
            Err(_) => self.failed = true,
        }
        Some(next)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            (0, Some(0))
        } else {
            (0, Some(self.remaining))
        }
    }
}

/// Shared, immutable eval result set.
///
/// Cloning is cheap; every clone views the same batches.
#[derive(Clone, Debug)]
pub struct EvalBatches {
    batches: Arc<[EvalBatch]>,
}

impl EvalBatches {
    /// Whether both handles view the same materialized batches.
    pub fn shares_storage_with(&self, other: &EvalBatches) -> bool {
        Arc::ptr_eq(&self.batches, &other.batches)
    }
}

impl Deref for EvalBatches {
    type Target = [EvalBatch];

    fn deref(&self) -> &Self::Target {
        &self.batches
    }
}

impl<'a> IntoIterator for &'a EvalBatches {
    type Item = &'a EvalBatch;
    type IntoIter = std::slice::Iter<'a, EvalBatch>;

    fn into_iter(self) -> Self::IntoIter {
        self.batches.iter()
    }
}
