//! src/dataset.rs
//!
//! Interaction data handed over by the loading layer.
//!
//! Positives are stored as two parallel columns behind `Arc<[_]>`, so cloning
//! a split only bumps reference counts and worker threads can read it
//! concurrently without locking.

use crate::types::{ItemId, UserId};
use anyhow::{bail, ensure, Result};
use std::ops::Range;
use std::sync::Arc;

/// Parallel `(user, item)` columns, one row per observed positive.
#[derive(Debug, Clone)]
pub struct InteractionSet {
    users: Arc<[UserId]>,
    items: Arc<[ItemId]>,
}

impl InteractionSet {
    /// Creates a set from two columns of equal length.
    pub fn new(users: Vec<UserId>, items: Vec<ItemId>) -> Result<Self> {
        ensure!(
            users.len() == items.len(),
            "User column ({}) and item column ({}) must have the same length",
            users.len(),
            items.len()
        );
        Ok(Self {
            users: users.into(),
            items: items.into(),
        })
    }

    /// Builds a set from `(user, item)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (UserId, ItemId)>) -> Self {
        let (users, items): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        Self {
            users: users.into(),
            items: items.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn users(&self) -> &[UserId] {
        &self.users
    }

    pub fn items(&self) -> &[ItemId] {
        &self.items
    }

    /// Returns `true` if user ids never decrease from one row to the next.
    pub fn is_sorted_by_user(&self) -> bool {
        self.users.windows(2).all(|pair| pair[0] <= pair[1])
    }
}

/// A full dataset: id space sizes plus training and evaluation positives.
///
/// # Invariants (checked by [`RecommendationDataset::new`])
/// - `num_users > 0`, `num_items > 0`, training split non-empty
/// - every user id `< num_users`, every item id `< num_items`
/// - training rows sorted by user (non-decreasing)
/// - no training user has interacted with every item, otherwise there would
///   be nothing to sample a negative from
///
/// The evaluation split is expected to hold one held-out positive per user.
#[derive(Debug, Clone)]
pub struct RecommendationDataset {
    num_users: usize,
    num_items: usize,
    train: InteractionSet,
    eval: InteractionSet,
    train_user_bounds: Arc<[usize]>,
}

impl RecommendationDataset {
    pub fn new(
        num_users: usize,
        num_items: usize,
        train: InteractionSet,
        eval: InteractionSet,
    ) -> Result<Self> {
        ensure!(num_users > 0, "num_users must be > 0");
        ensure!(num_items > 0, "num_items must be > 0");
        ensure!(!train.is_empty(), "Training split must not be empty");
        ensure!(
            train.is_sorted_by_user(),
            "Training positives must be sorted by user id"
        );

        for (split, set) in [("training", &train), ("eval", &eval)] {
            if let Some(&user) = set.users().iter().find(|&&u| u as usize >= num_users) {
                bail!(
                    "{} split references user {} but num_users is {}",
                    split,
                    user,
                    num_users
                );
            }
            if let Some(&item) = set.items().iter().find(|&&i| i as usize >= num_items) {
                bail!(
                    "{} split references item {} but num_items is {}",
                    split,
                    item,
                    num_items
                );
            }
        }

        let train_user_bounds = user_bounds(train.users(), num_users);

        // Users that interacted with every item have no negative candidates.
        let mut seen = vec![false; num_items];
        for user in 0..num_users {
            let range = train_user_bounds[user]..train_user_bounds[user + 1];
            if range.len() < num_items {
                continue;
            }
            seen.iter_mut().for_each(|s| *s = false);
            let mut distinct = 0;
            for &item in &train.items()[range] {
                if !std::mem::replace(&mut seen[item as usize], true) {
                    distinct += 1;
                }
            }
            ensure!(
                distinct < num_items,
                "User {} has interacted with all {} items; no negatives can be sampled",
                user,
                num_items
            );
        }

        Ok(Self {
            num_users,
            num_items,
            train,
            eval,
            train_user_bounds: train_user_bounds.into(),
        })
    }

    pub fn num_users(&self) -> usize {
        self.num_users
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn train(&self) -> &InteractionSet {
        &self.train
    }

    pub fn eval(&self) -> &InteractionSet {
        &self.eval
    }

    /// Row range of `user`'s training positives. O(1).
    pub fn train_rows_for(&self, user: UserId) -> Range<usize> {
        let user = user as usize;
        self.train_user_bounds[user]..self.train_user_bounds[user + 1]
    }

    /// Training items of `user`, in stored order.
    pub fn train_items_for(&self, user: UserId) -> &[ItemId] {
        &self.train.items()[self.train_rows_for(user)]
    }
}

/// Offsets into a user-sorted column: rows of user `u` are
/// `bounds[u]..bounds[u + 1]`. Users without rows get an empty range.
fn user_bounds(sorted_users: &[UserId], num_users: usize) -> Vec<usize> {
    let mut bounds = vec![0usize; num_users + 1];
    for &user in sorted_users {
        bounds[user as usize + 1] += 1;
    }
    for user in 0..num_users {
        bounds[user + 1] += bounds[user];
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_set() -> InteractionSet {
        InteractionSet::from_pairs([(0, 0), (1, 0), (2, 0)])
    }

    #[test]
    fn rejects_mismatched_columns() {
        assert!(InteractionSet::new(vec![0, 1], vec![0]).is_err());
    }

    #[test]
    fn computes_user_ranges() -> Result<()> {
        let train = InteractionSet::from_pairs([(0, 1), (0, 2), (2, 0), (2, 1), (2, 3)]);
        let dataset = RecommendationDataset::new(3, 4, train, eval_set())?;

        assert_eq!(dataset.train_rows_for(0), 0..2);
        assert_eq!(dataset.train_rows_for(1), 2..2);
        assert_eq!(dataset.train_rows_for(2), 2..5);
        assert_eq!(dataset.train_items_for(2), &[0, 1, 3]);
        Ok(())
    }

    #[test]
    fn rejects_unsorted_training_users() {
        let train = InteractionSet::from_pairs([(1, 0), (0, 1)]);
        let err = RecommendationDataset::new(3, 4, train, eval_set()).unwrap_err();
        assert!(err.to_string().contains("sorted"));
    }

    #[test]
    fn rejects_out_of_range_ids() {
        let train = InteractionSet::from_pairs([(0, 4)]);
        assert!(RecommendationDataset::new(3, 4, train, eval_set()).is_err());

        let train = InteractionSet::from_pairs([(0, 1)]);
        let eval = InteractionSet::from_pairs([(3, 0)]);
        assert!(RecommendationDataset::new(3, 4, train, eval).is_err());
    }

    #[test]
    fn rejects_user_without_negatives() {
        let train = InteractionSet::from_pairs([(0, 0), (1, 0), (1, 1), (1, 2)]);
        let err = RecommendationDataset::new(3, 3, train, eval_set()).unwrap_err();
        assert!(err.to_string().contains("User 1"));
    }

    #[test]
    fn duplicate_positives_do_not_count_as_coverage() -> Result<()> {
        // User 0 has three rows but only two distinct items out of three.
        let train = InteractionSet::from_pairs([(0, 0), (0, 0), (0, 1)]);
        RecommendationDataset::new(3, 3, train, eval_set())?;
        Ok(())
    }
}
