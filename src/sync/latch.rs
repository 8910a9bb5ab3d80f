//! Level-triggered wakeup latch

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct LatchState {
    set: bool,
    owner: u32,
}

/// A level-triggered wakeup primitive.
///
/// A set latch stays set until reset, so a signal delivered just before the
/// waiter blocks is never lost. The protocol is always: reset the latch while
/// holding the lock that guards the awaited state, release every lock, then
/// wait. Ownership records which process is entitled to wait on the latch;
/// anyone may set it.
#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `pid` as the process waiting on this latch
    pub fn own(&self, pid: u32) {
        let mut state = self.state.lock().unwrap();
        debug_assert_eq!(state.owner, 0, "latch is already owned");
        state.owner = pid;
    }

    /// Relinquish ownership before leaving the binding
    pub fn disown(&self) {
        self.state.lock().unwrap().owner = 0;
    }

    /// Pid of the owning process, 0 if unowned
    pub fn owner(&self) -> u32 {
        self.state.lock().unwrap().owner
    }

    /// Wake the owner; the latch stays set until reset
    pub fn set(&self) {
        let mut state = self.state.lock().unwrap();
        state.set = true;
        self.cond.notify_all();
    }

    /// Clear the latch in preparation for waiting
    pub fn reset(&self) {
        self.state.lock().unwrap().set = false;
    }

    /// Forcibly clear both the flag and ownership (queue reformatting)
    pub(crate) fn force_clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.set = false;
        state.owner = 0;
    }

    /// Block until the latch is set
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.set {
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Block until the latch is set or `timeout` elapses; returns whether the
    /// wait timed out
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (_state, result) = self
            .cond
            .wait_timeout_while(state, timeout, |s| !s.set)
            .unwrap();
        result.timed_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_before_wait_is_not_lost() {
        let latch = Latch::new();
        latch.set();
        // Returns immediately because the level persists.
        latch.wait();
        assert!(!latch.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_reset_clears_level() {
        let latch = Latch::new();
        latch.set();
        latch.reset();
        assert!(latch.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let latch = Arc::new(Latch::new());
        latch.reset();
        let setter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                latch.set();
            })
        };
        latch.wait();
        setter.join().unwrap();
    }

    #[test]
    fn test_ownership_bookkeeping() {
        let latch = Latch::new();
        assert_eq!(latch.owner(), 0);
        latch.own(1234);
        assert_eq!(latch.owner(), 1234);
        latch.disown();
        assert_eq!(latch.owner(), 0);
        latch.set();
        latch.force_clear();
        assert!(latch.wait_timeout(Duration::from_millis(1)));
    }
}
