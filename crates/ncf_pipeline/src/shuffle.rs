//! src/shuffle.rs
//!
//! Background producer of whole-epoch index permutations.
//!
//! Shuffling several hundred million indices takes seconds, so a small set of
//! producer threads computes permutations ahead of time and parks them in a
//! bounded buffer. Consumers only ever slice the current permutation, which
//! keeps batch construction from waiting on the shuffle.
//!
//! ```text
//!  [shuffle-worker-0] ─┐
//!  [shuffle-worker-1] ─┼─> bounded(max_epochs_ahead) ─> next_block(n) ─> index block
//!  [shuffle-worker-2] ─┘                                  (mutex-guarded cursor)
//! ```
//!
//! # Seed handling
//! Permutation `k` (counted in production order across all workers) is
//! shuffled with an RNG seeded by `seed + k`. The set of permutations is thus
//! reproducible, but with more than one producer the delivery order between
//! permutations is not.

use crate::types::EpochIndex;
use anyhow::{anyhow, bail, ensure, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvError, SendTimeoutError, Sender};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// How often a producer blocked on a full buffer re-checks the stop flag.
const PRODUCER_POLL_MS: u64 = 50;

/// Parameters for a [`ShuffleStream`].
#[derive(Debug, Clone)]
pub struct ShuffleConfig {
    /// Size of the index space every permutation covers.
    pub epoch_size: usize,
    /// Number of producer threads.
    pub num_workers: usize,
    /// Maximum number of finished permutations waiting to be consumed.
    pub max_epochs_ahead: usize,
    /// Total number of permutations to produce; `None` produces until stopped.
    pub num_to_produce: Option<usize>,
    /// Base seed for permutation `k`'s RNG (`seed + k`).
    pub seed: u64,
}

/// Unconsumed tail of the permutation currently being handed out.
#[derive(Default)]
struct CurrentOrder {
    order: Vec<EpochIndex>,
    cursor: usize,
}

impl CurrentOrder {
    fn remaining(&self) -> usize {
        self.order.len() - self.cursor
    }
}

/// Asynchronous stream of epoch permutations, consumed in contiguous blocks.
///
/// # Lifecycle
/// - `new()`: validates configuration, no threads yet
/// - `start()`: spawns the producer threads
/// - `next_block(n)`: blocking; may be called concurrently from many threads
/// - `stop()`: asks producers to exit; `next_block` must not be relied on afterwards
pub struct ShuffleStream {
    config: ShuffleConfig,
    sender: Mutex<Option<Sender<Vec<EpochIndex>>>>,
    receiver: Receiver<Vec<EpochIndex>>,
    current: Mutex<CurrentOrder>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    produced: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    started: AtomicBool,
}

impl ShuffleStream {
    pub fn new(config: ShuffleConfig) -> Result<Self> {
        ensure!(config.epoch_size > 0, "Epoch size must be > 0");
        ensure!(
            config.epoch_size - 1 <= EpochIndex::MAX as usize,
            "Epoch size {} does not fit the epoch index type",
            config.epoch_size
        );
        ensure!(
            config.num_workers > 0,
            "Cannot create ShuffleStream with 0 workers"
        );
        ensure!(
            config.max_epochs_ahead > 0,
            "max_epochs_ahead must be > 0 to prevent deadlocks"
        );

        let (sender, receiver) = bounded(config.max_epochs_ahead);
        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            receiver,
            current: Mutex::new(CurrentOrder::default()),
            workers: Mutex::new(Vec::new()),
            produced: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
        })
    }

    pub fn epoch_size(&self) -> usize {
        self.config.epoch_size
    }

    /// Number of permutations finished by the producers so far.
    pub fn permutations_produced(&self) -> usize {
        self.produced.load(Ordering::Relaxed)
    }

    /// Spawns the producer threads. Calling it twice is an error.
    pub fn start(&self) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| anyhow!("Shuffle sender lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("ShuffleStream has already been started"))?;

        let next_permutation = Arc::new(AtomicUsize::new(0));
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| anyhow!("Shuffle worker lock poisoned"))?;

        for worker_id in 0..self.config.num_workers {
            let sender = sender.clone();
            let config = self.config.clone();
            let next_permutation = next_permutation.clone();
            let produced = self.produced.clone();
            let shutdown = self.shutdown.clone();

            let handle = thread::Builder::new()
                .name(format!("shuffle-worker-{}", worker_id))
                .spawn(move || {
                    produce_permutations(&config, &sender, &next_permutation, &produced, &shutdown)
                })
                .with_context(|| format!("Failed to spawn shuffle worker {}", worker_id))?;
            workers.push(handle);
        }

        // Only the producers hold senders now; once they all exit the
        // channel disconnects and consumers get an error instead of hanging.
        drop(sender);
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Returns the next `n` indices of the current permutation.
    ///
    /// When the current permutation runs out, the block is completed from
    /// the next one, so consecutive blocks tile the permutations without gaps
    /// or repeats. Blocks if no permutation is ready yet.
    ///
    /// # Errors
    /// - The stream has not been started.
    /// - Producers have exited (stopped, or `num_to_produce` reached) and no
    ///   buffered permutation is left.
    pub fn next_block(&self, n: usize) -> Result<Vec<EpochIndex>> {
        if !self.started.load(Ordering::Acquire) {
            bail!("ShuffleStream::next_block called before start()");
        }
        let mut block = Vec::with_capacity(n);

        let mut current = self
            .current
            .lock()
            .map_err(|_| anyhow!("Epoch order lock poisoned"))?;
        while block.len() < n {
            if current.remaining() == 0 {
                let order = self.receiver.recv().map_err(|RecvError| {
                    anyhow!(
                        "Shuffle stream ended after {} permutations (stopped or exhausted)",
                        self.permutations_produced()
                    )
                })?;
                *current = CurrentOrder { order, cursor: 0 };
            }
            let take = (n - block.len()).min(current.remaining());
            let start = current.cursor;
            block.extend_from_slice(&current.order[start..start + take]);
            current.cursor += take;
        }
        Ok(block)
    }

    /// Signals producers to exit. Does not wait for them.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for ShuffleStream {
    fn drop(&mut self) {
        self.stop();
        // Drain so producers blocked on a full buffer can notice the flag.
        while self.receiver.try_recv().is_ok() {}
        if let Ok(mut workers) = self.workers.lock() {
            for worker in workers.drain(..) {
                let _ = worker.join();
            }
        }
    }
}

/// Producer loop shared by all shuffle workers.
fn produce_permutations(
    config: &ShuffleConfig,
    sender: &Sender<Vec<EpochIndex>>,
    next_permutation: &AtomicUsize,
    produced: &AtomicUsize,
    shutdown: &AtomicBool,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let k = next_permutation.fetch_add(1, Ordering::Relaxed);
        if config.num_to_produce.is_some_and(|limit| k >= limit) {
            return;
        }

        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(k as u64));
        let mut order: Vec<EpochIndex> = (0..config.epoch_size as EpochIndex).collect();
        order.shuffle(&mut rng);
        produced.fetch_add(1, Ordering::Relaxed);
        debug!(permutation = k, size = config.epoch_size, "permutation ready");

        let mut pending = order;
        loop {
            match sender.send_timeout(pending, Duration::from_millis(PRODUCER_POLL_MS)) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(order)) => {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    pending = order;
                }
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const TEST_SEED: u64 = 42;

    fn config(epoch_size: usize, num_to_produce: Option<usize>) -> ShuffleConfig {
        ShuffleConfig {
            epoch_size,
            num_workers: 2,
            max_epochs_ahead: 2,
            num_to_produce,
            seed: TEST_SEED,
        }
    }

    #[test]
    fn validates_parameters() {
        assert!(ShuffleStream::new(config(0, None)).is_err());
        assert!(ShuffleStream::new(ShuffleConfig {
            num_workers: 0,
            ..config(10, None)
        })
        .is_err());
        assert!(ShuffleStream::new(ShuffleConfig {
            max_epochs_ahead: 0,
            ..config(10, None)
        })
        .is_err());
    }

    #[test]
    fn next_block_before_start_fails() -> Result<()> {
        let stream = ShuffleStream::new(config(10, None))?;
        assert!(stream.next_block(3).is_err());
        Ok(())
    }

    #[test]
    fn start_twice_fails() -> Result<()> {
        let stream = ShuffleStream::new(config(10, None))?;
        stream.start()?;
        assert!(stream.start().is_err());
        Ok(())
    }

    #[test]
    fn blocks_tile_each_epoch_exactly() -> Result<()> {
        // 3 does not divide 10, so blocks straddle epoch boundaries.
        let epoch_size = 10;
        let stream = ShuffleStream::new(config(epoch_size, None))?;
        stream.start()?;

        let mut flat = Vec::new();
        for _ in 0..10 {
            flat.extend(stream.next_block(3)?);
        }
        for epoch in flat.chunks_exact(epoch_size) {
            let unique: HashSet<_> = epoch.iter().copied().collect();
            assert_eq!(unique.len(), epoch_size);
            assert!(unique.iter().all(|&i| (i as usize) < epoch_size));
        }
        Ok(())
    }

    #[test]
    fn block_larger_than_epoch_spans_permutations() -> Result<()> {
        let stream = ShuffleStream::new(config(4, None))?;
        stream.start()?;
        let block = stream.next_block(9)?;
        assert_eq!(block.len(), 9);
        let mut first: Vec<_> = block[..4].to_vec();
        first.sort_unstable();
        assert_eq!(first, vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn concurrent_consumers_see_disjoint_slices() -> Result<()> {
        let epoch_size = 1_000;
        let stream = Arc::new(ShuffleStream::new(config(epoch_size, None))?);
        stream.start()?;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stream = stream.clone();
                thread::spawn(move || -> Result<Vec<EpochIndex>> {
                    let mut seen = Vec::new();
                    for _ in 0..25 {
                        seen.extend(stream.next_block(10)?);
                    }
                    Ok(seen)
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for index in handle.join().expect("consumer panicked")? {
                assert!(all.insert(index), "index {} handed out twice", index);
            }
        }
        assert_eq!(all.len(), epoch_size);
        Ok(())
    }

    #[test]
    fn exhausted_stream_reports_error() -> Result<()> {
        let stream = ShuffleStream::new(config(5, Some(1)))?;
        stream.start()?;
        assert_eq!(stream.next_block(5)?.len(), 5);
        assert!(stream.next_block(1).is_err());
        Ok(())
    }

    #[test]
    fn stop_releases_blocked_producers() -> Result<()> {
        let stream = ShuffleStream::new(config(100, None))?;
        stream.start()?;
        stream.next_block(1)?;
        stream.stop();
        // Dropping joins the producers; this must not hang.
        drop(stream);
        Ok(())
    }

    #[test]
    fn permutation_is_reproducible_for_single_worker() -> Result<()> {
        let single = |seed| -> Result<Vec<EpochIndex>> {
            let stream = ShuffleStream::new(ShuffleConfig {
                num_workers: 1,
                seed,
                ..config(50, None)
            })?;
            stream.start()?;
            stream.next_block(50)
        };
        assert_eq!(single(7)?, single(7)?);
        assert_ne!(single(7)?, single(8)?);
        Ok(())
    }
}
