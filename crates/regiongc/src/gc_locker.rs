//! GC locker: blocks collections while critical sections hold raw references

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LockerState {
    critical_count: usize,
    needs_gc: bool,
}

/// Counts active critical sections and remembers skipped collections
#[derive(Default)]
pub struct GcLocker {
    state: Mutex<LockerState>,
    cv: Condvar,
}

impl GcLocker {
    /// New locker with no critical sections
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a critical section
    pub fn enter_critical(&self) {
        self.state.lock().critical_count += 1;
    }

    /// Leave a critical section; the last one out clears a pending request
    pub fn exit_critical(&self) {
        let mut state = self.state.lock();
        assert!(state.critical_count > 0, "unbalanced exit_critical");
        state.critical_count -= 1;
        if state.critical_count == 0 && state.needs_gc {
            state.needs_gc = false;
            self.cv.notify_all();
        }
    }

    /// Whether any critical section is active
    pub fn is_active(&self) -> bool {
        self.state.lock().critical_count > 0
    }

    /// Whether a collection was skipped and is waiting for the locker to clear
    pub fn needs_gc(&self) -> bool {
        self.state.lock().needs_gc
    }

    /// Record that a collection was skipped because the locker was active.
    ///
    /// Returns `false` if the locker cleared in the meantime.
    pub fn check_active_and_set_needs_gc(&self) -> bool {
        let mut state = self.state.lock();
        if state.critical_count > 0 {
            state.needs_gc = true;
            true
        } else {
            false
        }
    }

    /// Block until no skipped collection is pending
    pub fn stall_until_clear(&self) {
        let mut state = self.state.lock();
        while state.needs_gc {
            self.cv.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_needs_gc_only_while_active() {
        let locker = GcLocker::new();
        assert!(!locker.check_active_and_set_needs_gc());
        locker.enter_critical();
        assert!(locker.check_active_and_set_needs_gc());
        assert!(locker.needs_gc());
        locker.exit_critical();
        assert!(!locker.needs_gc());
        assert!(!locker.is_active());
    }

    #[test]
    fn test_stall_until_last_critical_exits() {
        let locker = Arc::new(GcLocker::new());
        locker.enter_critical();
        locker.check_active_and_set_needs_gc();
        let staller = {
            let locker = Arc::clone(&locker);
            std::thread::spawn(move || locker.stall_until_clear())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(!staller.is_finished());
        locker.exit_critical();
        staller.join().unwrap();
    }
}
