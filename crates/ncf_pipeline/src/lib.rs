pub mod batch;
pub mod batch_builder;
pub mod dataset;
pub mod negative_sampler;
pub mod pipeline;
pub mod shuffle;
pub mod stats;
pub mod types;

pub use batch::{EvalBatch, TrainingBatch};
pub use batch_builder::BatchBuilder;
pub use dataset::{InteractionSet, RecommendationDataset};
pub use negative_sampler::{
    ComplementNegativeSampler, MaterializedNegativeSampler, NegativeSampler,
};
pub use pipeline::{ConstructorConfig, DataConstructor};
pub use shuffle::{ShuffleConfig, ShuffleStream};
