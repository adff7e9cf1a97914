//! src/types.rs
//!
//! Shared id and label types used across the pipeline.

/// Dense user id in `0..num_users`.
pub type UserId = u32;

/// Dense item id in `0..num_items`.
pub type ItemId = u32;

/// Training label: `1` for an observed positive, `0` for a sampled negative.
pub type Label = u8;

/// Storage type of the materialized negative table.
///
/// Kept narrow because the table holds `num_users * num_items` entries.
pub type TableItem = u16;

/// Marks unused slots of the negative table. Any lookup that lands on it
/// would fail an embedding lookup downstream instead of silently aliasing
/// item zero.
pub const NEGATIVE_TABLE_SENTINEL: TableItem = TableItem::MAX;

/// Position in the epoch index space `[0, (1 + num_negatives) * num_positives)`.
pub type EpochIndex = u32;
