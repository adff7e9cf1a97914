//! src/pipeline/mod.rs
//!
//! This module implements the `DataConstructor`.
//!
//! The `DataConstructor` coordinates the `ShuffleStream`, the `NegativeSampler`
//! and a pool of construction workers to keep a training loop supplied with
//! negative-sampled batches while it trains.
//!
//! # Architecture Overview
//!
//! ```text
//!              ┌────────────────────┐
//!              │ RecommendationData │ (train + eval positives)
//!              └─────────┬──────────┘
//!                        │ read-only, shared
//!          ┌─────────────┼──────────────────┐
//!          ↓                                ↓
//!   ┌───────────────┐              ┌─────────────────┐
//!   │ ShuffleStream │              │ NegativeSampler │ (lookup built once)
//!   └───────┬───────┘              └────────┬────────┘
//!           │ index blocks                  │ negatives
//!           └──────────────┬────────────────┘
//!                          ↓
//!                  [Construction Workers] ─── BatchBuilder
//!                     │             │
//!          training   │             │   eval (epoch 0 only)
//!                     ↓             ↓
//!            ┌───────────────┐  ┌────────────┐
//!            │ Hand-off queue│  │ Eval store │ (index order, reused)
//!            └───────┬───────┘  └─────┬──────┘
//!                    ↓                ↓
//!           training_batches()   eval_batches()
//! ```
//!
//! # Module Structure
//!
//! ```text
//! src/pipeline/
//! ├── mod.rs             # Public API exports + module-level architecture docs
//! ├── config.rs          # ConstructorConfig, builder, and validation
//! ├── constructor.rs     # DataConstructor, background epoch loop, consumer iterators
//! ├── construction.rs    # ConstructionPipeline and batch-count sizing
//! ├── handoff.rs         # Training hand-off queue
//! ├── pool.rs            # Generic `WorkerPool<Task, Output>` implementation
//! ├── summary.rs         # ConstructorSummary
//! └── common/
//!     ├── mod.rs
//!     └── thread.rs      # Thread-local worker ID and RNG
//! ```
//!
//! # Memory Usage
//! - Shuffle lookahead: O(max_epochs_ahead x epoch_size) indices
//! - Hand-off queue: up to one epoch of training batches when unbounded
//! - Eval store: every eval batch, kept for the constructor's lifetime

mod common;
mod config;
mod construction;
mod constructor;
mod handoff;
mod pool;
mod summary;

pub use config::{
    ConstructorConfig, ConstructorConfigBuilder, DEFAULT_NUM_EVAL_NEGATIVES,
    DEFAULT_NUM_TRAIN_NEGATIVES, DEFAULT_NUM_WORKERS, DEFAULT_SHUFFLE_WORKERS,
};
pub use construction::count_batches;
pub use constructor::{DataConstructor, EvalBatches, TrainingBatches};
pub use summary::ConstructorSummary;
