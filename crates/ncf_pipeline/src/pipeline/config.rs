//! src/pipeline/config.rs
//!
//! Configuration for [`DataConstructor`](super::DataConstructor).
//!
//! Example:
//! ```ignore
//! let config = ConstructorConfig::builder()
//!     .max_epochs(15)
//!     .train_batch_size(1_048_576)
//!     .num_train_negatives(4)
//!     .eval_batch_size(160_000)
//!     .num_workers(6)
//!     .build();
//! ```
//!
//! # Performance considerations:
//! - `num_workers`: batches are built in parallel; more workers only help
//!   until the shuffle producers or the consumer become the bottleneck
//! - `max_epochs_ahead`: each buffered permutation holds a full epoch of
//!   indices, so memory grows linearly with it
//! - `handoff_capacity`: `None` lets construction run a full epoch ahead of
//!   the trainer; `Some(n)` bounds memory at the cost of blocking workers

use anyhow::{ensure, Result};
use std::time::Duration;

/// Construction pool size used when none is configured.
pub const DEFAULT_NUM_WORKERS: usize = 6;
/// Permutation producer threads used when none is configured.
pub const DEFAULT_SHUFFLE_WORKERS: usize = 3;
/// Negatives ranked against each held-out positive during evaluation.
pub const DEFAULT_NUM_EVAL_NEGATIVES: usize = 999;
/// Negatives sampled per training positive.
pub const DEFAULT_NUM_TRAIN_NEGATIVES: usize = 4;

/// Configuration for data construction
#[derive(Clone, Debug)]
pub struct ConstructorConfig {
    /// Number of training epochs to construct.
    pub max_epochs: usize,
    /// Examples per training batch (required, must be > 0).
    pub train_batch_size: Option<usize>,
    /// Training batches consumed per step; the per-epoch batch count is
    /// rounded up to a multiple of it.
    pub batches_per_train_step: usize,
    /// Negatives per training positive.
    pub num_train_negatives: usize,
    /// Examples per eval batch (required). Must be divisible by
    /// `1 + num_eval_negatives`.
    pub eval_batch_size: Option<usize>,
    /// Eval batches consumed per step.
    pub batches_per_eval_step: usize,
    /// Sampled negatives per eval user.
    pub num_eval_negatives: usize,
    /// Size of the construction worker pool.
    pub num_workers: usize,
    /// Number of permutation producer threads.
    pub shuffle_workers: usize,
    /// Maximum number of precomputed permutations waiting to be consumed.
    pub max_epochs_ahead: usize,
    /// Capacity of the training hand-off queue (`None` = unbounded).
    pub handoff_capacity: Option<usize>,
    /// Random seed for shuffling and negative sampling.
    pub seed: Option<u64>,
    /// How often `eval_batches()` checks whether eval batches exist.
    pub eval_poll_interval: Duration,
    /// How often idle or blocked workers check for shutdown.
    /// Not an error timeout - just a polling interval.
    pub worker_poll_interval: Duration,
}

impl Default for ConstructorConfig {
    fn default() -> Self {
        Self {
            max_epochs: 1,
            train_batch_size: None,
            batches_per_train_step: 1,
            num_train_negatives: DEFAULT_NUM_TRAIN_NEGATIVES,
            eval_batch_size: None,
            batches_per_eval_step: 1,
            num_eval_negatives: DEFAULT_NUM_EVAL_NEGATIVES,
            num_workers: DEFAULT_NUM_WORKERS,
            shuffle_workers: DEFAULT_SHUFFLE_WORKERS,
            max_epochs_ahead: 2,
            handoff_capacity: None,
            seed: None,
            eval_poll_interval: Duration::from_millis(10),
            worker_poll_interval: Duration::from_millis(100),
        }
    }
}

impl ConstructorConfig {
    pub fn builder() -> ConstructorConfigBuilder {
        ConstructorConfigBuilder::default()
    }

    /// Checks every setting that can be checked without the dataset.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_epochs > 0, "max_epochs must be > 0");

        let train_batch_size = self.train_batch_size.unwrap_or(0);
        ensure!(
            train_batch_size > 0,
            "train_batch_size must be set and > 0"
        );
        ensure!(
            self.batches_per_train_step > 0,
            "batches_per_train_step must be > 0"
        );

        let eval_batch_size = self.eval_batch_size.unwrap_or(0);
        ensure!(eval_batch_size > 0, "eval_batch_size must be set and > 0");
        ensure!(
            self.batches_per_eval_step > 0,
            "batches_per_eval_step must be > 0"
        );
        ensure!(
            eval_batch_size % (1 + self.num_eval_negatives) == 0,
            "Eval batch size {} is not divisible by {}",
            eval_batch_size,
            1 + self.num_eval_negatives
        );

        ensure!(
            self.num_workers > 0,
            "num_workers must be > 0 for data construction"
        );
        ensure!(self.shuffle_workers > 0, "shuffle_workers must be > 0");
        ensure!(
            self.max_epochs_ahead > 0,
            "max_epochs_ahead must be > 0 to prevent deadlocks"
        );
        if let Some(capacity) = self.handoff_capacity {
            ensure!(capacity > 0, "handoff_capacity must be > 0 when bounded");
        }
        ensure!(
            !self.worker_poll_interval.is_zero(),
            "worker_poll_interval must be non-zero"
        );
        Ok(())
    }
}

/// Builder for ConstructorConfig with method chaining
#[derive(Default)]
pub struct ConstructorConfigBuilder {
    config: ConstructorConfig,
}

impl ConstructorConfigBuilder {
    /// Set the number of training epochs to construct.
    pub fn max_epochs(mut self, epochs: usize) -> Self {
        self.config.max_epochs = epochs;
        self
    }

    /// Set the training batch size (must be > 0)
    pub fn train_batch_size(mut self, size: usize) -> Self {
        self.config.train_batch_size = Some(size);
        self
    }

    pub fn batches_per_train_step(mut self, batches: usize) -> Self {
        self.config.batches_per_train_step = batches;
        self
    }

    /// Set the number of negatives sampled per training positive.
    pub fn num_train_negatives(mut self, negatives: usize) -> Self {
        self.config.num_train_negatives = negatives;
        self
    }

    /// Set the eval batch size; must be divisible by `1 + num_eval_negatives`.
    pub fn eval_batch_size(mut self, size: usize) -> Self {
        self.config.eval_batch_size = Some(size);
        self
    }

    pub fn batches_per_eval_step(mut self, batches: usize) -> Self {
        self.config.batches_per_eval_step = batches;
        self
    }

    /// Set the number of negatives ranked against each eval positive.
    pub fn num_eval_negatives(mut self, negatives: usize) -> Self {
        self.config.num_eval_negatives = negatives;
        self
    }

    /// Set the construction pool size.
    pub fn num_workers(mut self, workers: usize) -> Self {
        self.config.num_workers = workers;
        self
    }

    /// Set the number of permutation producer threads.
    pub fn shuffle_workers(mut self, workers: usize) -> Self {
        self.config.shuffle_workers = workers;
        self
    }

    /// Set how many finished permutations may wait for consumption.
    pub fn max_epochs_ahead(mut self, epochs: usize) -> Self {
        self.config.max_epochs_ahead = epochs;
        self
    }

    /// Bound the training hand-off queue.
    ///
    /// Workers block once `capacity` batches are waiting, re-checking for
    /// shutdown every `worker_poll_interval`.
    pub fn handoff_capacity(mut self, capacity: usize) -> Self {
        self.config.handoff_capacity = Some(capacity);
        self
    }

    /// Set the random seed for reproducible shuffling and sampling.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn eval_poll_interval(mut self, interval: Duration) -> Self {
        self.config.eval_poll_interval = interval;
        self
    }

    /// Set the worker polling interval
    ///
    /// - Too low: More responsive shutdown, higher CPU usage.
    /// - Too high: Less CPU overhead, slower shutdown response
    pub fn worker_poll_interval(mut self, interval: Duration) -> Self {
        self.config.worker_poll_interval = interval;
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> ConstructorConfig {
        self.config
    }
}
