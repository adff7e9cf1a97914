//! src/negative_sampler.rs
//!
//! Negative sampling strategies.
//!
//! A [`NegativeSampler`] draws, for every user it is given, one item that the
//! user has not interacted with in the training split. Samplers build their
//! lookup structures once from the dataset and are read-only afterwards, so
//! a single instance is shared by every construction worker.
//!
//! Two strategies are provided:
//! - [`MaterializedNegativeSampler`]: a dense `num_users x num_items` table of
//!   complement items. O(1) lookups, O(num_users * num_items) memory.
//! - [`ComplementNegativeSampler`]: keeps only the sorted positives and maps a
//!   random rank to the matching non-positive item with a binary search.
//!   O(log |positives|) lookups, O(num_positives) memory.
//!
//! Both use [`biased_randint`], so the draw is uniform over the user's
//! negatives only up to the modulo bias documented there.

use crate::dataset::RecommendationDataset;
use crate::stats::biased_randint;
use crate::types::{ItemId, TableItem, UserId, NEGATIVE_TABLE_SENTINEL};
use anyhow::{anyhow, bail, ensure, Result};
use rand::RngCore;
use std::time::Instant;
use tracing::info;

/// Strategy for drawing negative items.
///
/// Implementations must be `Send + Sync` so one instance can be shared across
/// worker threads once [`NegativeSampler::construct_lookup`] has run.
pub trait NegativeSampler: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Rejects datasets this strategy cannot represent. Runs before any
    /// thread is started; the default accepts everything.
    fn check_dataset(&self, _dataset: &RecommendationDataset) -> Result<()> {
        Ok(())
    }

    /// Builds the lookup structures from the training split. Called once,
    /// before any call to [`NegativeSampler::sample`].
    fn construct_lookup(&mut self, dataset: &RecommendationDataset) -> Result<()>;

    /// Returns one negative item per entry of `users`, in the same order.
    ///
    /// # Errors
    /// Fails if the lookup has not been constructed or a user id is out of
    /// range. Never returns a training positive of the user.
    fn sample(&self, users: &[UserId], rng: &mut dyn RngCore) -> Result<Vec<ItemId>>;
}

fn not_constructed(name: &str) -> anyhow::Error {
    anyhow!(
        "{} negative lookup has not been constructed; call construct_lookup() first",
        name
    )
}

/// Gathers per-user negative counts, rejecting unknown users.
fn gather_counts(counts: &[u32], users: &[UserId]) -> Result<Vec<u32>> {
    users
        .iter()
        .map(|&user| {
            counts.get(user as usize).copied().ok_or_else(|| {
                anyhow!(
                    "User {} is out of range for a lookup over {} users",
                    user,
                    counts.len()
                )
            })
        })
        .collect()
}

// ================================================================================================
// 1. Materialized table
// ================================================================================================
struct MaterializedLookup {
    num_items: usize,
    /// Row-major `num_users x num_items`; row `u` holds `u`'s negatives
    /// left-packed, followed by sentinels.
    table: Vec<TableItem>,
    counts: Vec<u32>,
}

/// Samples negatives from a fully materialized complement table.
///
/// Building the table is the dominant one-time setup cost of the pipeline:
/// O(num_users * num_items) in both time and memory.
///
/// # Invariants after construction
/// - `count(u) + |distinct positives of u| == num_items`
/// - entries at column `>= count(u)` equal [`NEGATIVE_TABLE_SENTINEL`]
/// - `num_items < NEGATIVE_TABLE_SENTINEL`, so the sentinel is never a valid id
#[derive(Default)]
pub struct MaterializedNegativeSampler {
    lookup: Option<MaterializedLookup>,
}

impl MaterializedNegativeSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table row of `user`, including the sentinel padding.
    pub fn table_row(&self, user: UserId) -> Option<&[TableItem]> {
        let lookup = self.lookup.as_ref()?;
        let start = (user as usize).checked_mul(lookup.num_items)?;
        lookup.table.get(start..start + lookup.num_items)
    }

    /// Number of valid (non-sentinel) entries in `user`'s row.
    pub fn negative_count(&self, user: UserId) -> Option<u32> {
        self.lookup.as_ref()?.counts.get(user as usize).copied()
    }
}

impl NegativeSampler for MaterializedNegativeSampler {
    fn name(&self) -> &'static str {
        "materialized"
    }

    fn check_dataset(&self, dataset: &RecommendationDataset) -> Result<()> {
        ensure!(
            dataset.num_items() < NEGATIVE_TABLE_SENTINEL as usize,
            "Materialized negative table supports fewer than {} items, got {}",
            NEGATIVE_TABLE_SENTINEL,
            dataset.num_items()
        );
        Ok(())
    }

    fn construct_lookup(&mut self, dataset: &RecommendationDataset) -> Result<()> {
        self.check_dataset(dataset)?;
        let num_users = dataset.num_users();
        let num_items = dataset.num_items();
        let cells = num_users
            .checked_mul(num_items)
            .ok_or_else(|| anyhow!("Negative table of {} x {} overflows", num_users, num_items))?;

        let start_time = Instant::now();
        let mut table = vec![NEGATIVE_TABLE_SENTINEL; cells];
        let mut counts = vec![0u32; num_users];
        let mut is_positive = vec![false; num_items];

        for (user, row) in table.chunks_exact_mut(num_items).enumerate() {
            let positives = dataset.train_items_for(user as UserId);
            for &item in positives {
                is_positive[item as usize] = true;
            }

            let mut count = 0;
            for item in 0..num_items {
                if !is_positive[item] {
                    row[count] = item as TableItem;
                    count += 1;
                }
            }
            counts[user] = count as u32;

            for &item in positives {
                is_positive[item as usize] = false;
            }
        }

        info!(
            users = num_users,
            items = num_items,
            elapsed_secs = start_time.elapsed().as_secs_f64(),
            "Negative sample table built"
        );

        self.lookup = Some(MaterializedLookup {
            num_items,
            table,
            counts,
        });
        Ok(())
    }

    fn sample(&self, users: &[UserId], rng: &mut dyn RngCore) -> Result<Vec<ItemId>> {
        let lookup = self
            .lookup
            .as_ref()
            .ok_or_else(|| not_constructed(self.name()))?;

        let counts = gather_counts(&lookup.counts, users)?;
        let choices = biased_randint(&counts, rng)?;

        Ok(users
            .iter()
            .zip(choices)
            .map(|(&user, choice)| {
                lookup.table[user as usize * lookup.num_items + choice as usize] as ItemId
            })
            .collect())
    }
}

// ================================================================================================
// 2. Rank-to-complement lookup
// ================================================================================================
struct ComplementLookup {
    /// Distinct positives of every user, sorted ascending, concatenated.
    positives: Vec<ItemId>,
    /// Rows of user `u` are `bounds[u]..bounds[u + 1]`.
    bounds: Vec<usize>,
    counts: Vec<u32>,
}

/// Samples negatives without materializing the complement.
///
/// A rank `r` in `[0, count(u))` is drawn and mapped to the `r`-th item that
/// is not a positive of `u`. With `p` the user's sorted positives,
/// `p[j] - j` counts the non-positives below `p[j]` and is non-decreasing,
/// so the answer is `r + #{j : p[j] - j <= r}`, found by binary search.
#[derive(Default)]
pub struct ComplementNegativeSampler {
    lookup: Option<ComplementLookup>,
}

impl ComplementNegativeSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `rank` to the `rank`-th item absent from `sorted_positives`.
    fn nth_negative(sorted_positives: &[ItemId], rank: u32) -> ItemId {
        let rank = rank as usize;
        let (mut low, mut high) = (0, sorted_positives.len());
        while low < high {
            let mid = low + (high - low) / 2;
            if sorted_positives[mid] as usize - mid <= rank {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        (rank + low) as ItemId
    }
}

impl NegativeSampler for ComplementNegativeSampler {
    fn name(&self) -> &'static str {
        "complement"
    }

    fn construct_lookup(&mut self, dataset: &RecommendationDataset) -> Result<()> {
        let start_time = Instant::now();
        let num_users = dataset.num_users();
        let num_items = dataset.num_items();

        let mut positives = Vec::with_capacity(dataset.train().len());
        let mut bounds = Vec::with_capacity(num_users + 1);
        let mut counts = Vec::with_capacity(num_users);
        bounds.push(0);

        for user in 0..num_users {
            let start = positives.len();
            positives.extend_from_slice(dataset.train_items_for(user as UserId));
            positives[start..].sort_unstable();
            let distinct = dedup_tail(&mut positives, start);

            if distinct >= num_items {
                bail!("User {} has no negative candidates", user);
            }
            counts.push((num_items - distinct) as u32);
            bounds.push(positives.len());
        }

        info!(
            users = num_users,
            positives = positives.len(),
            elapsed_secs = start_time.elapsed().as_secs_f64(),
            "Complement negative lookup built"
        );

        self.lookup = Some(ComplementLookup {
            positives,
            bounds,
            counts,
        });
        Ok(())
    }

    fn sample(&self, users: &[UserId], rng: &mut dyn RngCore) -> Result<Vec<ItemId>> {
        let lookup = self
            .lookup
            .as_ref()
            .ok_or_else(|| not_constructed(self.name()))?;

        let counts = gather_counts(&lookup.counts, users)?;
        let ranks = biased_randint(&counts, rng)?;

        Ok(users
            .iter()
            .zip(ranks)
            .map(|(&user, rank)| {
                let user = user as usize;
                let positives = &lookup.positives[lookup.bounds[user]..lookup.bounds[user + 1]];
                Self::nth_negative(positives, rank)
            })
            .collect())
    }
}

/// Removes consecutive duplicates from `values[start..]` in place and returns
/// the number of distinct values left in that tail.
fn dedup_tail(values: &mut Vec<ItemId>, start: usize) -> usize {
    let mut write = start;
    for read in start..values.len() {
        if write == start || values[read] != values[write - 1] {
            values[write] = values[read];
            write += 1;
        }
    }
    values.truncate(write);
    write - start
}
