//! Safepoint synchronization
//!
//! ## Design
//!
//! - Registered mutators are *running* while they may touch the heap.
//! - A pause requester marks a safepoint as requested and waits until no
//!   mutator is running. Running mutators notice the request when they poll
//!   and block until the pause ends.
//! - A mutator that requests a pause leaves the running state first and is
//!   put back into it atomically with the end of the pause, so nothing it
//!   allocated during the pause can be moved before it runs again.
//! - Only one pause runs at a time; further requesters queue behind it.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct SyncState {
    running: usize,
    requested: bool,
    pauses: u64,
}

/// Coordinates mutator threads with stop-the-world pauses
#[derive(Default)]
pub struct Safepoint {
    state: Mutex<SyncState>,
    cv: Condvar,
    requested: AtomicBool,
}

impl Safepoint {
    /// New synchronizer with no running mutators
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a pause is requested or running
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Enter the running state, waiting out any pause in progress
    pub fn enter_running(&self) {
        let mut state = self.state.lock();
        while state.requested {
            self.cv.wait(&mut state);
        }
        state.running += 1;
    }

    /// Leave the running state
    pub fn leave_running(&self) {
        let mut state = self.state.lock();
        assert!(state.running > 0, "leave_running without enter_running");
        state.running -= 1;
        if state.requested && state.running == 0 {
            self.cv.notify_all();
        }
    }

    /// Block at a requested safepoint; a no-op otherwise
    pub fn poll(&self) {
        if self.is_requested() {
            self.leave_running();
            self.enter_running();
        }
    }

    /// Stop the world. The caller must not be running.
    ///
    /// The returned guard ends the safepoint when dropped; with
    /// `resume_running` the caller is running again once the guard is gone.
    pub fn begin(&self, resume_running: bool) -> SafepointGuard<'_> {
        let mut state = self.state.lock();
        while state.requested {
            self.cv.wait(&mut state);
        }
        state.requested = true;
        self.requested.store(true, Ordering::Release);
        while state.running > 0 {
            self.cv.wait(&mut state);
        }
        state.pauses += 1;
        SafepointGuard {
            safepoint: self,
            resume_running,
        }
    }

    /// Number of safepoints reached so far
    pub fn count(&self) -> u64 {
        self.state.lock().pauses
    }

    /// Mutators currently running
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    fn end(&self, resume_running: bool) {
        let mut state = self.state.lock();
        state.requested = false;
        self.requested.store(false, Ordering::Release);
        if resume_running {
            state.running += 1;
        }
        self.cv.notify_all();
    }
}

/// Proof that the world is stopped
pub struct SafepointGuard<'a> {
    safepoint: &'a Safepoint,
    resume_running: bool,
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        self.safepoint.end(self.resume_running);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_pause_waits_for_running_mutators() {
        let sp = Arc::new(Safepoint::new());
        let progress = Arc::new(AtomicUsize::new(0));
        sp.enter_running();

        let requester = {
            let sp = Arc::clone(&sp);
            let progress = Arc::clone(&progress);
            std::thread::spawn(move || {
                let _guard = sp.begin(false);
                progress.store(1, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(progress.load(Ordering::SeqCst), 0, "pause ran while a mutator was running");
        assert!(sp.is_requested());
        sp.poll();
        requester.join().unwrap();
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert_eq!(sp.running(), 1);
        sp.leave_running();
        assert_eq!(sp.count(), 1);
    }

    #[test]
    fn test_requester_resumes_running() {
        let sp = Safepoint::new();
        sp.enter_running();
        sp.leave_running();
        drop(sp.begin(true));
        assert_eq!(sp.running(), 1);
        assert!(!sp.is_requested());
    }
}
