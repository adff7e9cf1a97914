//! src/batch.rs
//!
//! Fixed-size batches handed to the training loop.
//!
//! Both batch kinds are flat parallel vectors. Eval batches are logically
//! `[users_per_batch, 1 + num_eval_negatives]` matrices stored row-major.

use crate::types::{ItemId, Label, UserId};

/// One training batch: `labels[i] == 1` iff `items[i]` is an observed
/// positive of `users[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingBatch {
    pub users: Vec<UserId>,
    pub items: Vec<ItemId>,
    pub labels: Vec<Label>,
}

impl TrainingBatch {
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Iterates `(user, item, label)` triples.
    pub fn examples(&self) -> impl Iterator<Item = (UserId, ItemId, Label)> + '_ {
        self.users
            .iter()
            .zip(&self.items)
            .zip(&self.labels)
            .map(|((&user, &item), &label)| (user, item, label))
    }
}

/// One evaluation batch.
///
/// Each row holds a user's candidates: `num_eval_negatives` sampled
/// negatives followed by the held-out positive in the last column.
/// `duplicate_mask` flags candidates that repeat an earlier candidate of the
/// same row (computed while the positive was still in column 0, so the
/// positive itself is never flagged). Rows past the end of the eval split
/// are all zeros and must be ignored by the metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalBatch {
    pub users: Vec<UserId>,
    pub items: Vec<ItemId>,
    pub duplicate_mask: Vec<bool>,
    /// Number of candidates per row (`1 + num_eval_negatives`).
    pub row_width: usize,
    /// Number of leading rows that carry real users; the rest is padding.
    pub valid_rows: usize,
}

impl EvalBatch {
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Number of rows including padding.
    pub fn num_rows(&self) -> usize {
        if self.row_width == 0 {
            0
        } else {
            self.users.len() / self.row_width
        }
    }

    /// Candidate items of row `row`.
    pub fn item_row(&self, row: usize) -> &[ItemId] {
        &self.items[row * self.row_width..(row + 1) * self.row_width]
    }

    /// Duplicate flags of row `row`.
    pub fn mask_row(&self, row: usize) -> &[bool] {
        &self.duplicate_mask[row * self.row_width..(row + 1) * self.row_width]
    }

    /// Users of row `row` (the same id repeated across the row).
    pub fn user_row(&self, row: usize) -> &[UserId] {
        &self.users[row * self.row_width..(row + 1) * self.row_width]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_examples_zip_columns() {
        let batch = TrainingBatch {
            users: vec![0, 1],
            items: vec![5, 6],
            labels: vec![1, 0],
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.examples().collect::<Vec<_>>(),
            vec![(0, 5, 1), (1, 6, 0)]
        );
    }

    #[test]
    fn eval_rows_slice_row_major() {
        let batch = EvalBatch {
            users: vec![3, 3, 3, 0, 0, 0],
            items: vec![7, 8, 9, 0, 0, 0],
            duplicate_mask: vec![false, true, false, false, false, false],
            row_width: 3,
            valid_rows: 1,
        };
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.item_row(0), &[7, 8, 9]);
        assert_eq!(batch.mask_row(0), &[false, true, false]);
        assert_eq!(batch.user_row(1), &[0, 0, 0]);
    }
}
