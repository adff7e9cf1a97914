//! src/stats.rs
//!
//! Random draw and deduplication helpers used during negative sampling.
//!
//! Both functions are pure apart from the RNG they are handed, so the same
//! inputs and RNG state always give the same output.

use anyhow::{ensure, Result};
use rand::{Rng, RngCore};

/// Draws one index in `[0, count)` for every entry of `counts`.
///
/// A full-width `u64` is reduced modulo the count. This over-weights the
/// low end of the range by at most `count / 2^64`, which is negligible for
/// item catalogues and saves the rejection loop of an exact draw.
///
/// # Errors
/// Returns an error if any count is zero, since there is nothing to draw.
pub fn biased_randint(counts: &[u32], rng: &mut dyn RngCore) -> Result<Vec<u32>> {
    counts
        .iter()
        .enumerate()
        .map(|(position, &count)| {
            ensure!(
                count > 0,
                "Cannot draw from an empty range (count = 0 at position {})",
                position
            );
            Ok((rng.random::<u64>() % count as u64) as u32)
        })
        .collect()
}

/// Uniform counterpart of [`biased_randint`].
///
/// Slower because it rejects out-of-range draws. Serves as the reference
/// distribution when checking the biased version.
pub fn exact_randint(counts: &[u32], rng: &mut dyn RngCore) -> Result<Vec<u32>> {
    counts
        .iter()
        .enumerate()
        .map(|(position, &count)| {
            ensure!(
                count > 0,
                "Cannot draw from an empty range (count = 0 at position {})",
                position
            );
            Ok(rng.random_range(0..count))
        })
        .collect()
}

/// Flags repeated values within each row of a row-major matrix.
///
/// `mask[r * width + c]` is `true` iff `values[r * width + c]` equals some
/// entry at an earlier column of row `r`. The first occurrence of every
/// value is never flagged.
///
/// # Arguments
/// - `values`: Row-major matrix, `values.len()` must be a multiple of `width`.
/// - `width`: Number of columns per row (> 0).
pub fn mask_duplicates<T: Ord + Copy>(values: &[T], width: usize) -> Result<Vec<bool>> {
    ensure!(width > 0, "Row width must be > 0");
    ensure!(
        values.len() % width == 0,
        "Matrix of {} values cannot be split into rows of width {}",
        values.len(),
        width
    );

    let mut mask = vec![false; values.len()];
    // (value, column) pairs; sorting by both keeps the earliest column first
    // inside every run of equal values.
    let mut order: Vec<(T, usize)> = Vec::with_capacity(width);

    for (row, row_values) in values.chunks_exact(width).enumerate() {
        order.clear();
        order.extend(row_values.iter().copied().zip(0..width));
        order.sort_unstable();

        for pair in order.windows(2) {
            if pair[0].0 == pair[1].0 {
                mask[row * width + pair[1].1] = true;
            }
        }
    }
    Ok(mask)
}
