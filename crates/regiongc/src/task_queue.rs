//! Work-stealing queues and termination detection for evacuation
//!
//! ## Design
//!
//! - Each worker owns a LIFO `crossbeam_deque::Worker` of reference slots;
//!   other workers steal through the matching `Stealer`.
//! - `TaskTerminator` keeps a count of workers still active. A worker that
//!   runs dry offers termination: it decrements the count and then spins,
//!   later parks, until either the count reaches zero (everyone is done) or
//!   some queue holds work again, in which case it re-registers as active.
//!   Re-registering never succeeds once the count reached zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_deque::{Steal, Stealer, Worker};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::address::Address;

/// A location holding a reference that must be processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// A reference field inside a heap object
    Heap(Address),
    /// An entry of the root set
    Root(usize),
}

/// The stealing side of all workers' queues
pub struct TaskQueueSet {
    stealers: Vec<Stealer<Slot>>,
}

impl TaskQueueSet {
    /// Create `n` queues; returns the set and the owner ends
    pub fn new(n: usize) -> (Self, Vec<Worker<Slot>>) {
        let workers: Vec<Worker<Slot>> = (0..n).map(|_| Worker::new_lifo()).collect();
        let stealers = workers.iter().map(Worker::stealer).collect();
        (Self { stealers }, workers)
    }

    /// Number of queues
    pub fn len(&self) -> usize {
        self.stealers.len()
    }

    /// Whether the set has no queues
    pub fn is_empty(&self) -> bool {
        self.stealers.is_empty()
    }

    /// Steal one task from a queue other than `worker_id`'s
    pub fn steal(&self, worker_id: usize) -> Option<Slot> {
        let n = self.stealers.len();
        for offset in 1..n {
            let victim = &self.stealers[(worker_id + offset) % n];
            loop {
                match victim.steal() {
                    Steal::Success(slot) => return Some(slot),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    /// Whether every queue is empty
    pub fn all_empty(&self) -> bool {
        self.stealers.iter().all(Stealer::is_empty)
    }
}

/// Termination protocol for a fixed set of workers
pub struct TaskTerminator {
    n_threads: usize,
    active: AtomicUsize,
    lock: Mutex<()>,
    cv: Condvar,
}

const PARK_TIMEOUT: Duration = Duration::from_millis(1);

impl TaskTerminator {
    /// Terminator for `n_threads` workers, all initially active
    pub fn new(n_threads: usize) -> Self {
        Self {
            n_threads,
            active: AtomicUsize::new(n_threads),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Number of participating workers
    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Offer termination after the caller found no work.
    ///
    /// Returns `true` once all workers have offered with no work anywhere,
    /// `false` if work showed up and the caller must resume stealing.
    pub fn offer_termination(&self, queues: &TaskQueueSet) -> bool {
        if self.n_threads == 1 {
            return true;
        }
        let remaining = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            let _guard = self.lock.lock();
            self.cv.notify_all();
            return true;
        }

        let backoff = Backoff::new();
        loop {
            if self.active.load(Ordering::Acquire) == 0 {
                return true;
            }
            if !queues.all_empty() && self.try_reactivate() {
                return false;
            }
            if backoff.is_completed() {
                let mut guard = self.lock.lock();
                if self.active.load(Ordering::Acquire) == 0 {
                    return true;
                }
                self.cv.wait_for(&mut guard, PARK_TIMEOUT);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Re-register as active unless everyone already terminated
    fn try_reactivate(&self) -> bool {
        let mut active = self.active.load(Ordering::Acquire);
        loop {
            if active == 0 {
                return false;
            }
            match self.active.compare_exchange(
                active,
                active + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => active = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_single_worker_terminates_immediately() {
        let (queues, _workers) = TaskQueueSet::new(1);
        let terminator = TaskTerminator::new(1);
        assert!(terminator.offer_termination(&queues));
    }

    #[test]
    fn test_steal_from_other_queue() {
        let (queues, workers) = TaskQueueSet::new(3);
        workers[2].push(Slot::Root(7));
        assert_eq!(queues.steal(0), Some(Slot::Root(7)));
        assert_eq!(queues.steal(0), None);
        assert!(queues.all_empty());
    }

    #[test]
    fn test_no_termination_while_work_remains() {
        // Worker 0 seeds work; every worker processes tasks that spawn more
        // tasks until a budget is used up. All tasks must be processed
        // before anyone leaves.
        const WORKERS: usize = 4;
        const TOTAL: usize = 20_000;
        let (queues, workers) = TaskQueueSet::new(WORKERS);
        let terminator = TaskTerminator::new(WORKERS);
        let spawned = AtomicUsize::new(1);
        let processed = AtomicUsize::new(0);
        workers[0].push(Slot::Root(0));

        std::thread::scope(|s| {
            for (id, local) in workers.into_iter().enumerate() {
                let queues = &queues;
                let terminator = &terminator;
                let spawned = &spawned;
                let processed = &processed;
                s.spawn(move || {
                    loop {
                        while let Some(task) = local.pop().or_else(|| queues.steal(id)) {
                            processed.fetch_add(1, Ordering::Relaxed);
                            let Slot::Root(_) = task else { unreachable!() };
                            for _ in 0..2 {
                                let next = spawned.fetch_add(1, Ordering::Relaxed);
                                if next < TOTAL {
                                    local.push(Slot::Root(next));
                                } else {
                                    spawned.fetch_sub(1, Ordering::Relaxed);
                                }
                            }
                        }
                        if terminator.offer_termination(queues) {
                            break;
                        }
                    }
                    assert!(queues.all_empty());
                });
            }
        });
        assert_eq!(processed.load(Ordering::Relaxed), TOTAL);
    }
}
