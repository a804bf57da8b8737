//! GC worker threads
//!
//! ## Design
//!
//! - A task is run by `n` workers at once; worker 0 is the thread that
//!   started the task, the others are scoped threads that borrow the task.
//! - The number of active workers is chosen per pause and never exceeds the
//!   configured maximum.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Work executed by every participating worker
pub trait WorkerTask: Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// Body run by worker `worker_id` (0-based, below the worker count)
    fn work(&self, worker_id: usize);
}

/// GC worker pool
pub struct WorkerThreads {
    max_workers: usize,
    active_workers: AtomicUsize,
}

impl WorkerThreads {
    /// Pool of at most `max_workers` workers, all active
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            max_workers,
            active_workers: AtomicUsize::new(max_workers),
        }
    }

    /// Configured maximum
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Workers used by the current pause
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Choose the active worker count; returns the clamped value
    pub fn set_active_workers(&self, n: usize) -> usize {
        let n = n.clamp(1, self.max_workers);
        self.active_workers.store(n, Ordering::Relaxed);
        n
    }

    /// Run `task` on `num_workers` workers and wait for all of them
    pub fn run_task(&self, task: &dyn WorkerTask, num_workers: usize) {
        let num_workers = num_workers.clamp(1, self.max_workers);
        tracing::trace!(target: "regiongc::gc", task = task.name(), num_workers, "run task");
        if num_workers == 1 {
            task.work(0);
            return;
        }
        thread::scope(|s| {
            for worker_id in 1..num_workers {
                let spawned = thread::Builder::new()
                    .name(format!("regiongc-worker-{worker_id}"))
                    .spawn_scoped(s, move || task.work(worker_id));
                if let Err(err) = spawned {
                    // Without the thread the task would miss a worker id.
                    panic!("failed to spawn GC worker {worker_id}: {err}");
                }
            }
            task.work(0);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Collect {
        seen: Mutex<Vec<usize>>,
    }

    impl WorkerTask for Collect {
        fn name(&self) -> &'static str {
            "collect"
        }

        fn work(&self, worker_id: usize) {
            self.seen.lock().push(worker_id);
        }
    }

    #[test]
    fn test_every_worker_runs_once() {
        let workers = WorkerThreads::new(4);
        let task = Collect {
            seen: Mutex::new(Vec::new()),
        };
        workers.run_task(&task, 3);
        let mut seen = task.seen.into_inner();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_active_workers_clamped() {
        let workers = WorkerThreads::new(2);
        assert_eq!(workers.set_active_workers(8), 2);
        assert_eq!(workers.set_active_workers(0), 1);
        assert_eq!(workers.active_workers(), 1);
    }
}
