//! Thread-local worker identity and RNG.
//!
//! Every construction task reseeds its worker's RNG from the task identity,
//! so a batch's random draws do not depend on which worker happened to pick
//! the task up.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::cell::RefCell;

thread_local! {
    /// Thread-local worker ID (0 to num_workers-1), assigned when spawned.
    pub static WORKER_ID: RefCell<usize> = const { RefCell::new(0) };

    /// Thread-local RNG used for negative sampling inside workers.
    pub static WORKER_RNG: RefCell<Option<StdRng>> = const { RefCell::new(None) };
}

/// Returns the current thread's worker ID.
pub fn current_worker_id() -> usize {
    WORKER_ID.with(|id| *id.borrow())
}

/// Reseeds the worker RNG for one task.
/// Seed formula: base_seed + (epoch << 32) + task_id
pub fn init_worker_rng(task_id: usize, epoch: usize, base_seed: u64) {
    WORKER_RNG.with(|rng| {
        let seed = base_seed
            .wrapping_add((epoch as u64) << 32)
            .wrapping_add(task_id as u64);
        *rng.borrow_mut() = Some(StdRng::seed_from_u64(seed));
    })
}

/// Runs `f` with the worker RNG, or with the thread RNG if this thread has
/// not been seeded.
pub fn with_worker_rng<T>(f: impl FnOnce(&mut dyn RngCore) -> T) -> T {
    WORKER_RNG.with(|rng| {
        let mut rng_ref = rng.borrow_mut();
        match rng_ref.as_mut() {
            Some(rng) => f(rng),
            None => f(&mut rand::rng()),
        }
    })
}
