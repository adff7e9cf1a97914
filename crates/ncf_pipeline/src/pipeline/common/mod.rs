//! src/pipeline/common/mod.rs
//!
//! Utilities shared by the construction workers.

pub mod thread;
