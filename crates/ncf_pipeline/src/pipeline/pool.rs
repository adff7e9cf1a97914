//! Worker pool for parallel batch construction.
//!
//! A fixed set of threads pulls tasks from one shared bounded channel and
//! reports outcomes on a second bounded channel. The pool is generic over
//! task and output types; the construction-specific worker loop lives in
//! [`construction`](super::construction).
//!
//! # Key features
//! - Bounded channels cap the number of in-flight tasks
//! - Graceful shutdown on drop
//! - Thread-local worker IDs for logging and error context

use anyhow::{anyhow, ensure, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use super::common::thread::WORKER_ID;

/// Thread pool with a shared task queue.
///
/// - Task channel: coordinator -> workers
/// - Output channel: workers -> coordinator
/// - Shutdown flag: asks idle workers to exit
///
/// # Type Parameters
/// - `Task`: Work items sent to workers
/// - `Output`: Results returned from workers
pub(crate) struct WorkerPool<Task, Output> {
    workers: Vec<thread::JoinHandle<()>>,
    task_tx: Option<Sender<Task>>,
    output_rx: Receiver<Output>,
    shutdown: Arc<AtomicBool>,
    buffer_size: usize,
}

impl<Task, Output> WorkerPool<Task, Output>
where
    Task: Send + 'static,
    Output: Send + 'static,
{
    /// Spawns `num_workers` threads running `worker_fn`.
    ///
    /// `buffer_size` bounds both channels; the coordinator must keep at most
    /// that many tasks in flight or it can deadlock against full outputs.
    pub(crate) fn new<F>(
        name: &str,
        num_workers: usize,
        buffer_size: usize,
        worker_fn: F,
    ) -> Result<Self>
    where
        F: Fn(Receiver<Task>, Sender<Output>, Arc<AtomicBool>) + Send + Sync + 'static,
    {
        ensure!(
            num_workers > 0,
            "Cannot create WorkerPool with 0 workers"
        );
        ensure!(
            buffer_size > 0,
            "Cannot create WorkerPool with buffer_size 0. \
            Buffer size must be > 0 to prevent deadlocks."
        );

        let (task_tx, task_rx) = bounded(buffer_size);
        let (output_tx, output_rx) = bounded(buffer_size);

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_fn = Arc::new(worker_fn);
        let mut workers = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let task_rx = task_rx.clone();
            let output_tx = output_tx.clone();
            let shutdown_clone = shutdown.clone();
            let worker_fn_clone = worker_fn.clone();

            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, worker_id))
                .spawn(move || {
                    WORKER_ID.with(|id| *id.borrow_mut() = worker_id);
                    worker_fn_clone(task_rx, output_tx, shutdown_clone);
                })
                .with_context(|| format!("Failed to spawn {} worker thread {}", name, worker_id))?;

            workers.push(handle);
        }

        Ok(Self {
            workers,
            task_tx: Some(task_tx),
            output_rx,
            shutdown,
            buffer_size,
        })
    }

    /// Maximum number of tasks that may be in flight at once.
    pub(crate) fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Queues a task; blocks while the task buffer is full.
    pub(crate) fn submit(&self, task: Task) -> Result<()> {
        self.task_tx
            .as_ref()
            .ok_or_else(|| anyhow!("WorkerPool is shutting down"))?
            .send(task)
            .map_err(|_| anyhow!("All construction workers have exited"))
    }

    /// Receives one output; blocks until a worker reports.
    pub(crate) fn receive(&self) -> Result<Output> {
        self.output_rx
            .recv()
            .map_err(|_| anyhow!("Worker channel disconnected - workers may have crashed"))
    }
}

impl<Task, Output> Drop for WorkerPool<Task, Output> {
    fn drop(&mut self) {
        // Signal shutdown to all workers
        self.shutdown.store(true, Ordering::Relaxed);

        // Drop the task sender to close the channel
        self.task_tx.take();

        // Disconnect the output side so workers blocked on reporting wake up
        drop(std::mem::replace(
            &mut self.output_rx,
            crossbeam_channel::never(),
        ));

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
