//! # Background task queue
//!
//! Runs variable-latency work (checkpoint builds, flushes, stats collection,
//! directory removal) on a tokio blocking pool. Each task's completion is sent
//! back over a channel and runs on the main context when it calls
//! [`TaskQueue::drain`], so completions may mutate main-context state without
//! extra locking.
//!
//! ```text
//!  main ──submit(work, completion)──> blocking pool: out = work()
//!   ▲                                         │
//!   └────── drain(ctx): completion(ctx, out) ◄┘ (mpsc)
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use swapdb_core::error::{Error, Result};

const IDLE_POLL: Duration = Duration::from_millis(20);

/// Work to run on the main context with the result of a task
pub type Completion<C> = Box<dyn FnOnce(&mut C) + Send>;

pub struct TaskQueue<C> {
    runtime: Mutex<Option<Runtime>>,
    tx: mpsc::UnboundedSender<Completion<C>>,
    rx: Mutex<mpsc::UnboundedReceiver<Completion<C>>>,
    /// Submitted tasks whose completion has not run yet
    pending: Arc<AtomicUsize>,
}

impl<C: 'static> TaskQueue<C> {
    pub fn new(workers: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers.max(1))
            .thread_name("swapdb-bg")
            .enable_all()
            .build()
            .map_err(|e| Error::Internal {
                message: format!("build task runtime: {}", e),
            })?;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            tx,
            rx: Mutex::new(rx),
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Run `work` off the main context; `completion` later runs in [`drain`](Self::drain).
    /// Returns false if the queue has been shut down.
    pub fn submit<T, W, F>(&self, name: &'static str, work: W, completion: F) -> bool
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        F: FnOnce(&mut C, T) + Send + 'static,
    {
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else {
            warn!(task = name, "Task submitted after shutdown, dropping");
            return false;
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        let tx = self.tx.clone();
        let pending = Arc::clone(&self.pending);

        runtime.spawn_blocking(move || {
            let output = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(output) => output,
                Err(_) => {
                    error!(task = name, "Background task panicked");
                    pending.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            };
            let completion: Completion<C> = Box::new(move |ctx| completion(ctx, output));
            if tx.send(completion).is_err() {
                pending.fetch_sub(1, Ordering::SeqCst);
            }
        });
        debug!(task = name, "Task submitted");
        true
    }

    /// Run every completion that has arrived. Returns how many ran.
    pub fn drain(&self, ctx: &mut C) -> usize {
        // Collect first: completions may submit more tasks
        let batch: Vec<Completion<C>> = {
            let mut rx = self.rx.lock();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        let count = batch.len();
        for completion in batch {
            completion(ctx);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        count
    }

    /// Drain completions until no task is pending or `timeout` passes.
    /// Returns whether the queue became idle.
    pub fn wait_idle(&self, ctx: &mut C, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain(ctx);
            if self.pending() == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }

            // Short slices: a panicked task never sends, it only decrements `pending`
            let slice = remaining.min(IDLE_POLL);
            let next = {
                let runtime = self.runtime.lock();
                let Some(runtime) = runtime.as_ref() else {
                    return false;
                };
                let mut rx = self.rx.lock();
                // The timer has to be created inside the runtime
                runtime.block_on(async { tokio::time::timeout(slice, rx.recv()).await })
            };
            match next {
                Ok(Some(completion)) => {
                    completion(ctx);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                Ok(None) => return false,
                Err(_elapsed) => continue,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks and wait up to `timeout` for running ones.
    /// Completions that never ran are dropped.
    pub fn shutdown(&self, timeout: Duration) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_timeout(timeout);
            debug!("Task queue shut down");
        }
    }
}

impl<C> Drop for TaskQueue<C> {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
