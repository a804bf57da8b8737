//! Batches of serial and parallel sub-tasks
//!
//! ## Design
//!
//! - A batch holds serial sub-tasks, each run by exactly one worker, and
//!   parallel sub-tasks, run by every worker of the batch.
//! - Workers first claim serial tasks until none are left, then join all
//!   parallel tasks. A parallel task must therefore not depend on the
//!   result of a serial task of the same batch.
//! - Every sub-task estimates its cost in workers; the batch runs on
//!   `ceil(sum of costs)` workers, at least one and at most the active count.
//!   Sub-tasks that may have nothing to do report `ALMOST_NO_WORK`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crate::phase_times::{GcPhase, PhaseTimes};
use crate::workers::{WorkerTask, WorkerThreads};

/// Cost of a sub-task that is expected to do next to nothing
pub const ALMOST_NO_WORK: f64 = 0.01;

/// A sub-task of a batch
pub trait SubTask: Sync {
    /// Phase the time is recorded under
    fn phase(&self) -> GcPhase;

    /// Estimated number of workers the task can keep busy
    fn worker_cost(&self) -> f64;

    /// Told how many workers will run the batch before it starts
    fn set_max_workers(&mut self, _max_workers: usize) {}

    /// Do (a share of) the work
    fn do_work(&self, worker_id: usize);
}

/// Serial and parallel sub-tasks executed as one worker task
pub struct BatchedTask<'a, T: SubTask> {
    name: &'static str,
    serial: Vec<T>,
    parallel: Vec<T>,
    claimed_serial: AtomicUsize,
    phase_times: &'a PhaseTimes,
}

impl<'a, T: SubTask> BatchedTask<'a, T> {
    /// Empty batch reporting into `phase_times`
    pub fn new(name: &'static str, phase_times: &'a PhaseTimes) -> Self {
        Self {
            name,
            serial: Vec::new(),
            parallel: Vec::new(),
            claimed_serial: AtomicUsize::new(0),
            phase_times,
        }
    }

    /// Add a task run by one worker
    pub fn add_serial_task(&mut self, task: T) {
        self.serial.push(task);
    }

    /// Add a task run by all workers
    pub fn add_parallel_task(&mut self, task: T) {
        self.parallel.push(task);
    }

    /// Sum of the sub-task costs
    pub fn worker_cost(&self) -> f64 {
        self.serial
            .iter()
            .chain(self.parallel.iter())
            .map(SubTask::worker_cost)
            .sum()
    }

    /// Number of workers to use given `active_workers` available
    pub fn num_workers(&self, active_workers: usize) -> usize {
        (self.worker_cost().ceil() as usize).clamp(1, active_workers.max(1))
    }

    /// Size the sub-tasks and run the batch on `workers`
    pub fn run(mut self, workers: &WorkerThreads) -> Vec<T> {
        let num_workers = self.num_workers(workers.active_workers());
        for task in self.serial.iter_mut().chain(self.parallel.iter_mut()) {
            task.set_max_workers(num_workers);
        }
        workers.run_task(&self, num_workers);
        let mut tasks = self.serial;
        tasks.append(&mut self.parallel);
        tasks
    }

    fn timed(&self, task: &T, worker_id: usize) {
        let start = Instant::now();
        task.do_work(worker_id);
        self.phase_times
            .record_time(task.phase(), worker_id, start.elapsed());
    }
}

impl<T: SubTask> WorkerTask for BatchedTask<'_, T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn work(&self, worker_id: usize) {
        loop {
            let index = self.claimed_serial.fetch_add(1, Ordering::Relaxed);
            match self.serial.get(index) {
                Some(task) => self.timed(task, worker_id),
                None => break,
            }
        }
        for task in &self.parallel {
            self.timed(task, worker_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum CountedTask {
        Serial(AtomicUsize),
        Parallel(AtomicUsize, f64),
    }

    impl SubTask for CountedTask {
        fn phase(&self) -> GcPhase {
            match self {
                CountedTask::Serial(_) => GcPhase::MergePss,
                CountedTask::Parallel(..) => GcPhase::ClearCardTable,
            }
        }

        fn worker_cost(&self) -> f64 {
            match self {
                CountedTask::Serial(_) => 1.0,
                CountedTask::Parallel(_, cost) => *cost,
            }
        }

        fn do_work(&self, _worker_id: usize) {
            match self {
                CountedTask::Serial(runs) | CountedTask::Parallel(runs, _) => {
                    runs.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn runs(task: &CountedTask) -> usize {
        match task {
            CountedTask::Serial(runs) | CountedTask::Parallel(runs, _) => runs.load(Ordering::Relaxed),
        }
    }

    #[test]
    fn test_serial_once_parallel_everywhere() {
        let times = PhaseTimes::new(4);
        let workers = WorkerThreads::new(4);
        let mut batch = BatchedTask::new("task", &times);
        batch.add_serial_task(CountedTask::Serial(AtomicUsize::new(0)));
        batch.add_serial_task(CountedTask::Serial(AtomicUsize::new(0)));
        batch.add_parallel_task(CountedTask::Parallel(AtomicUsize::new(0), 1.5));
        assert_eq!(batch.num_workers(4), 4);
        let tasks = batch.run(&workers);
        assert_eq!(runs(&tasks[0]), 1);
        assert_eq!(runs(&tasks[1]), 1);
        assert_eq!(runs(&tasks[2]), 4);
        assert!(times.summary(GcPhase::MergePss).unwrap().workers <= 2);
        assert_eq!(times.summary(GcPhase::ClearCardTable).unwrap().workers, 4);
    }

    #[test]
    fn test_almost_no_work_uses_one_worker() {
        let times = PhaseTimes::new(8);
        let mut batch = BatchedTask::new("task", &times);
        batch.add_parallel_task(CountedTask::Parallel(AtomicUsize::new(0), ALMOST_NO_WORK));
        batch.add_parallel_task(CountedTask::Parallel(AtomicUsize::new(0), ALMOST_NO_WORK));
        assert_eq!(batch.num_workers(8), 1);
    }
}
