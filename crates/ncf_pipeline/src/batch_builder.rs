//! src/batch_builder.rs
//!
//! Turns index blocks and user ranges into [`TrainingBatch`]es and
//! [`EvalBatch`]es.
//!
//! # Training index space
//! An epoch covers `[0, (1 + num_train_negatives) * num_positives)`. Index
//! `k` refers to positive row `k % num_positives`; indices past the first
//! `num_positives` keep that row's user but swap its item for a sampled
//! negative. Every epoch therefore holds each positive once and
//! `num_train_negatives` negatives per positive.
//!
//! # Eval row layout
//! ```text
//!   sampled:  [pos, n1, n2, ..., nk]   <- duplicate mask computed here
//!   emitted:  [nk,  n1, n2, ..., pos]  <- first and last column swapped
//! ```
//! The positive must not be masked when a negative collides with it, so the
//! mask is computed while it sits in column 0. It is then moved last so that
//! it loses score ties during ranking.

use crate::batch::{EvalBatch, TrainingBatch};
use crate::dataset::RecommendationDataset;
use crate::negative_sampler::NegativeSampler;
use crate::stats::mask_duplicates;
use crate::types::{EpochIndex, ItemId, Label, UserId};
use anyhow::{ensure, Context, Result};
use rand::RngCore;
use std::ops::Range;
use std::sync::Arc;

/// Builds batches from a shared dataset and negative sampler.
///
/// Stateless apart from read-only shared data, so one instance serves every
/// worker thread.
pub struct BatchBuilder {
    dataset: Arc<RecommendationDataset>,
    sampler: Arc<dyn NegativeSampler>,
    num_train_negatives: usize,
    eval_users_per_batch: usize,
    num_eval_negatives: usize,
}

impl BatchBuilder {
    /// # Arguments
    /// - `dataset`: Validated dataset, shared with the caller.
    /// - `sampler`: Negative sampler whose lookup has been constructed.
    /// - `num_train_negatives`: Negatives per positive in a training epoch.
    /// - `eval_users_per_batch`: Rows per eval batch (> 0).
    /// - `num_eval_negatives`: Sampled negatives per eval row.
    pub fn new(
        dataset: Arc<RecommendationDataset>,
        sampler: Arc<dyn NegativeSampler>,
        num_train_negatives: usize,
        eval_users_per_batch: usize,
        num_eval_negatives: usize,
    ) -> Result<Self> {
        ensure!(
            eval_users_per_batch > 0,
            "eval_users_per_batch must be > 0"
        );
        Ok(Self {
            dataset,
            sampler,
            num_train_negatives,
            eval_users_per_batch,
            num_eval_negatives,
        })
    }

    pub fn dataset(&self) -> &RecommendationDataset {
        &self.dataset
    }

    /// Number of training positives.
    pub fn num_positives(&self) -> usize {
        self.dataset.train().len()
    }

    /// Size of the training epoch index space.
    pub fn training_epoch_size(&self) -> usize {
        (1 + self.num_train_negatives) * self.num_positives()
    }

    /// Candidates per eval row.
    pub fn eval_row_width(&self) -> usize {
        1 + self.num_eval_negatives
    }

    pub fn eval_users_per_batch(&self) -> usize {
        self.eval_users_per_batch
    }

    /// Builds a training batch from a block of epoch indices.
    ///
    /// Negatives for the whole block are drawn in one call to the sampler.
    pub fn build_training_batch(
        &self,
        indices: &[EpochIndex],
        rng: &mut dyn RngCore,
    ) -> Result<TrainingBatch> {
        let train = self.dataset.train();
        let num_positives = train.len();
        let epoch_size = self.training_epoch_size();

        let mut users = Vec::with_capacity(indices.len());
        let mut items = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        let mut negative_slots = Vec::new();

        for (slot, &index) in indices.iter().enumerate() {
            let index = index as usize;
            ensure!(
                index < epoch_size,
                "Epoch index {} out of range for epoch of size {}",
                index,
                epoch_size
            );
            let row = index % num_positives;
            let is_negative = index >= num_positives;

            users.push(train.users()[row]);
            items.push(train.items()[row]);
            labels.push(Label::from(!is_negative));
            if is_negative {
                negative_slots.push(slot);
            }
        }

        if !negative_slots.is_empty() {
            let negative_users: Vec<UserId> =
                negative_slots.iter().map(|&slot| users[slot]).collect();
            let negatives = self
                .sampler
                .sample(&negative_users, rng)
                .with_context(|| {
                    format!(
                        "Failed to sample {} training negatives with {} sampler",
                        negative_users.len(),
                        self.sampler.name()
                    )
                })?;
            ensure!(
                negatives.len() == negative_users.len(),
                "{} sampler returned {} negatives for {} users",
                self.sampler.name(),
                negatives.len(),
                negative_users.len()
            );
            for (&slot, item) in negative_slots.iter().zip(negatives) {
                items[slot] = item;
            }
        }

        Ok(TrainingBatch {
            users,
            items,
            labels,
        })
    }

    /// Eval user rows covered by eval batch `batch_index`.
    ///
    /// Clamped to the eval split, so batches past its end get an empty range
    /// and come out as pure padding.
    pub fn eval_user_range(&self, batch_index: usize) -> Range<usize> {
        let total = self.dataset.eval().len();
        let low = (batch_index * self.eval_users_per_batch).min(total);
        let high = ((batch_index + 1) * self.eval_users_per_batch).min(total);
        low..high
    }

    /// Builds the eval batch for a range of eval rows.
    ///
    /// Ranges shorter than `eval_users_per_batch` are padded with all-zero
    /// rows; the returned batch records how many rows are real.
    pub fn build_eval_batch(
        &self,
        user_rows: Range<usize>,
        rng: &mut dyn RngCore,
    ) -> Result<EvalBatch> {
        let eval = self.dataset.eval();
        ensure!(
            user_rows.start <= user_rows.end && user_rows.end <= eval.len(),
            "Eval rows {:?} out of range for eval split of {} rows",
            user_rows,
            eval.len()
        );
        ensure!(
            user_rows.len() <= self.eval_users_per_batch,
            "Eval rows {:?} exceed the batch capacity of {} users",
            user_rows,
            self.eval_users_per_batch
        );

        let width = self.eval_row_width();
        let num_negatives = self.num_eval_negatives;
        let row_users = &eval.users()[user_rows.clone()];
        let row_positives = &eval.items()[user_rows.clone()];
        let valid_rows = row_users.len();

        let negative_users: Vec<UserId> = row_users
            .iter()
            .flat_map(|&user| std::iter::repeat(user).take(num_negatives))
            .collect();
        let negatives = if negative_users.is_empty() {
            Vec::new()
        } else {
            self.sampler
                .sample(&negative_users, rng)
                .with_context(|| {
                    format!("Failed to sample eval negatives for rows {:?}", user_rows)
                })?
        };
        ensure!(
            negatives.len() == negative_users.len(),
            "{} sampler returned {} negatives for {} users",
            self.sampler.name(),
            negatives.len(),
            negative_users.len()
        );

        let capacity = self.eval_users_per_batch * width;
        let mut items: Vec<ItemId> = Vec::with_capacity(capacity);
        for (row, &positive) in row_positives.iter().enumerate() {
            items.push(positive);
            items.extend_from_slice(&negatives[row * num_negatives..(row + 1) * num_negatives]);
        }

        let mut duplicate_mask = mask_duplicates(&items, width)?;

        for row in 0..valid_rows {
            let first = row * width;
            let last = first + width - 1;
            items.swap(first, last);
            duplicate_mask.swap(first, last);
        }

        let mut users: Vec<UserId> = Vec::with_capacity(capacity);
        for &user in row_users {
            users.extend(std::iter::repeat(user).take(width));
        }

        users.resize(capacity, 0);
        items.resize(capacity, 0);
        duplicate_mask.resize(capacity, false);

        Ok(EvalBatch {
            users,
            items,
            duplicate_mask,
            row_width: width,
            valid_rows,
        })
    }
}
