#![allow(dead_code)]

use anyhow::{bail, Result};
use ncf_pipeline::{
    types::{ItemId, UserId},
    ConstructorConfig, InteractionSet, MaterializedNegativeSampler, NegativeSampler,
    RecommendationDataset,
};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const TEST_SEED: u64 = 42;

/// 4 users, 5 items, one training positive per user: `(u, u + 1)`.
/// Eval holds item 0 for every user.
pub fn scenario_dataset() -> Result<RecommendationDataset> {
    let train = InteractionSet::from_pairs([(0, 1), (1, 2), (2, 3), (3, 4)]);
    let eval = InteractionSet::from_pairs((0..4).map(|u| (u, 0)));
    RecommendationDataset::new(4, 5, train, eval)
}

/// Random dataset with `positives_per_user` training items per user and one
/// held-out eval item per user that is not among its training items.
pub fn random_dataset(
    num_users: usize,
    num_items: usize,
    positives_per_user: usize,
    seed: u64,
) -> Result<RecommendationDataset> {
    if positives_per_user + 1 >= num_items {
        bail!("Need room for an eval item and at least one negative");
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut eval = Vec::new();
    for user in 0..num_users as UserId {
        let picked = sample(&mut rng, num_items, positives_per_user + 1).into_vec();
        let (held_out, positives) = picked.split_last().expect("at least one item picked");
        let mut positives: Vec<ItemId> = positives.iter().map(|&i| i as ItemId).collect();
        positives.sort_unstable();
        train.extend(positives.into_iter().map(|item| (user, item)));
        eval.push((user, *held_out as ItemId));
    }
    RecommendationDataset::new(
        num_users,
        num_items,
        InteractionSet::from_pairs(train),
        InteractionSet::from_pairs(eval),
    )
}

/// Set of `(user, item)` training positives.
pub fn positive_pairs(dataset: &RecommendationDataset) -> HashSet<(UserId, ItemId)> {
    let train = dataset.train();
    train
        .users()
        .iter()
        .copied()
        .zip(train.items().iter().copied())
        .collect()
}

/// Config for small datasets: few workers, short poll intervals, fixed seed.
pub fn small_config() -> ConstructorConfig {
    ConstructorConfig::builder()
        .num_workers(3)
        .shuffle_workers(2)
        .seed(TEST_SEED)
        .eval_poll_interval(Duration::from_millis(2))
        .worker_poll_interval(Duration::from_millis(10))
        .build()
}

pub fn materialized() -> Box<dyn NegativeSampler> {
    Box::new(MaterializedNegativeSampler::new())
}

/// Builds its lookup but fails every draw.
pub struct FailingSampler;

impl NegativeSampler for FailingSampler {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn construct_lookup(&mut self, _dataset: &RecommendationDataset) -> Result<()> {
        Ok(())
    }

    fn sample(&self, _users: &[UserId], _rng: &mut dyn RngCore) -> Result<Vec<ItemId>> {
        bail!("negative pool exhausted")
    }
}

/// Builds its lookup but panics on every draw.
pub struct PanickingSampler;

impl NegativeSampler for PanickingSampler {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn construct_lookup(&mut self, _dataset: &RecommendationDataset) -> Result<()> {
        Ok(())
    }

    fn sample(&self, _users: &[UserId], _rng: &mut dyn RngCore) -> Result<Vec<ItemId>> {
        panic!("negative table corrupted")
    }
}

/// Fails while building its lookup.
pub struct LookupFailsSampler;

impl NegativeSampler for LookupFailsSampler {
    fn name(&self) -> &'static str {
        "lookup-fails"
    }

    fn construct_lookup(&mut self, _dataset: &RecommendationDataset) -> Result<()> {
        bail!("lookup storage unavailable")
    }

    fn sample(&self, _users: &[UserId], _rng: &mut dyn RngCore) -> Result<Vec<ItemId>> {
        bail!("lookup was never built")
    }
}

/// Wraps the materialized sampler, sleeping a random few milliseconds per
/// call and counting calls.
pub struct JitterSampler {
    inner: MaterializedNegativeSampler,
    pub calls: Arc<AtomicUsize>,
}

impl JitterSampler {
    pub fn new(calls: Arc<AtomicUsize>) -> Self {
        Self {
            inner: MaterializedNegativeSampler::new(),
            calls,
        }
    }
}

impl NegativeSampler for JitterSampler {
    fn name(&self) -> &'static str {
        "jitter"
    }

    fn construct_lookup(&mut self, dataset: &RecommendationDataset) -> Result<()> {
        self.inner.construct_lookup(dataset)
    }

    fn sample(&self, users: &[UserId], rng: &mut dyn RngCore) -> Result<Vec<ItemId>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(rand::rng().random_range(0..5)));
        self.inner.sample(users, rng)
    }
}
