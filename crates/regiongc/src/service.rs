//! Background service thread
//!
//! ## Design
//!
//! - One thread runs a timed queue of periodic tasks. Each task returns the
//!   delay until it wants to run again.
//! - The thread holds the heap weakly and registers as a running mutator
//!   while a task executes, so tasks never overlap a pause.
//! - `RemSetSampling` revises the young target from the remembered set
//!   length of the current eden regions; `UncommitRegion` gives memory of
//!   shrunk regions back in bounded steps.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::heap::Heap;

/// Delay between uncommit steps while inactive regions remain
const UNCOMMIT_STEP_DELAY: Duration = Duration::from_millis(10);

/// Periodic service task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceTask {
    /// Sample remembered set lengths and revise the young target
    RemSetSampling,
    /// Uncommit inactive regions
    UncommitRegion,
}

impl ServiceTask {
    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            ServiceTask::RemSetSampling => "Remembered Set Sampling",
            ServiceTask::UncommitRegion => "Uncommit Region",
        }
    }

    /// Run once; returns the delay before the next run, `None` to go idle
    pub fn execute(self, heap: &Heap) -> Option<Duration> {
        let interval = Duration::from_millis(heap.config().service_interval_ms.max(1));
        match self {
            ServiceTask::RemSetSampling => {
                let eden = heap.eden_regions();
                let rs_length: usize = eden.iter().map(|&r| heap.remset().occupancy(r)).sum();
                heap.policy().revise_young_list_target_length(rs_length);
                tracing::trace!(
                    target: "regiongc::service",
                    eden = eden.len(),
                    rs_length,
                    young_target = heap.policy().young_list_target_length(),
                    "sampled remembered sets"
                );
                Some(interval)
            }
            ServiceTask::UncommitRegion => {
                let limit = heap.config().uncommit_size_limit_regions.max(1) as u32;
                let uncommitted = heap.uncommit_regions(limit);
                if heap.manager().has_inactive_regions() {
                    Some(UNCOMMIT_STEP_DELAY)
                } else {
                    if uncommitted > 0 {
                        tracing::debug!(target: "regiongc::service", "all inactive regions uncommitted");
                    }
                    None
                }
            }
        }
    }
}

struct Scheduled {
    due: Instant,
    task: ServiceTask,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Earliest due first
        other.due.cmp(&self.due)
    }
}

#[derive(Default)]
struct QueueState {
    queue: BinaryHeap<Scheduled>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl Shared {
    fn schedule(&self, task: ServiceTask, delay: Duration) {
        let mut state = self.state.lock();
        let due = Instant::now() + delay;
        // One pending entry per task; keep the earlier one.
        if let Some(existing) = state.queue.iter().find(|s| s.task == task) {
            if existing.due <= due {
                return;
            }
            let queue = std::mem::take(&mut state.queue);
            state.queue = queue.into_iter().filter(|s| s.task != task).collect();
        }
        state.queue.push(Scheduled { due, task });
        self.cv.notify_one();
    }

    /// Block until a task is due; `None` on shutdown
    fn next(&self) -> Option<ServiceTask> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            let now = Instant::now();
            match state.queue.peek().map(|s| s.due) {
                Some(due) if due <= now => return state.queue.pop().map(|s| s.task),
                Some(due) => {
                    self.cv.wait_until(&mut state, due);
                }
                None => self.cv.wait(&mut state),
            }
        }
    }
}

/// Handle to the service thread
pub struct ServiceThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl ServiceThread {
    /// Spawn the service thread for `heap`
    pub fn start(heap: &Arc<Heap>) -> Self {
        let shared = Arc::new(Shared::default());
        let interval = Duration::from_millis(heap.config().service_interval_ms.max(1));
        shared.schedule(ServiceTask::RemSetSampling, interval);
        let weak = Arc::downgrade(heap);
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("regiongc-service".into())
            .spawn(move || run(weak, thread_shared));
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::error!(target: "regiongc::service", %err, "failed to spawn service thread");
                None
            }
        };
        Self { shared, handle }
    }

    /// Run `task` after `delay`, or earlier if it is already due sooner
    pub fn schedule(&self, task: ServiceTask, delay: Duration) {
        self.shared.schedule(task, delay);
    }

    /// Stop the thread and wait for it, unless called from the thread itself
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            // The last heap reference may be dropped by the service thread.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ServiceThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(heap: Weak<Heap>, shared: Arc<Shared>) {
    tracing::debug!(target: "regiongc::service", "service thread started");
    while let Some(task) = shared.next() {
        let Some(heap) = heap.upgrade() else {
            break;
        };
        let start = Instant::now();
        heap.safepoint().enter_running();
        let next = task.execute(&heap);
        heap.safepoint().leave_running();
        tracing::trace!(
            target: "regiongc::service",
            task = task.name(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "service task done"
        );
        if let Some(delay) = next {
            shared.schedule(task, delay);
        }
    }
    tracing::debug!(target: "regiongc::service", "service thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;

    #[test]
    fn test_queue_orders_by_due_time() {
        let shared = Shared::default();
        shared.schedule(ServiceTask::RemSetSampling, Duration::from_millis(50));
        shared.schedule(ServiceTask::UncommitRegion, Duration::ZERO);
        assert_eq!(shared.next(), Some(ServiceTask::UncommitRegion));
        let start = Instant::now();
        assert_eq!(shared.next(), Some(ServiceTask::RemSetSampling));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_schedule_keeps_earliest_entry() {
        let shared = Shared::default();
        shared.schedule(ServiceTask::UncommitRegion, Duration::from_secs(60));
        shared.schedule(ServiceTask::UncommitRegion, Duration::ZERO);
        shared.schedule(ServiceTask::UncommitRegion, Duration::from_secs(30));
        assert_eq!(shared.state.lock().queue.len(), 1);
        assert_eq!(shared.next(), Some(ServiceTask::UncommitRegion));
    }

    #[test]
    fn test_uncommit_task_runs_after_shrink() {
        let heap = Heap::builder(GcConfig {
            region_size_bytes: 64 * 1024,
            initial_heap_bytes: 256 * 1024,
            max_heap_bytes: 1024 * 1024,
            uncommit_size_limit_regions: 1,
            service_interval_ms: 5,
            ..Default::default()
        })
        .build()
        .unwrap();
        heap.expand(8 * 64 * 1024);
        let shrunk = heap.shrink(8 * 64 * 1024);
        assert!(shrunk > 0);
        let deadline = Instant::now() + Duration::from_secs(5);
        while heap.manager().has_inactive_regions() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!heap.manager().has_inactive_regions());
        assert_eq!(heap.stats().snapshot().regions_uncommitted, shrunk as u64);
    }

    #[test]
    fn test_execute_sampling_reschedules() {
        let heap = Heap::builder(GcConfig::default())
            .service_thread(false)
            .build()
            .unwrap();
        assert_eq!(
            ServiceTask::RemSetSampling.execute(&heap),
            Some(Duration::from_millis(heap.config().service_interval_ms))
        );
        assert_eq!(ServiceTask::UncommitRegion.execute(&heap), None);
    }
}
