//! Manual-reset gate for worker suspension
//!
//! Open = the worker may run. The UI or the operations queue closes the
//! gate to pause a worker; the worker blocks on it between atomic steps,
//! never in the middle of one.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        Self {
            open: Mutex::new(open),
            cond: Condvar::new(),
        }
    }

    /// Release every thread blocked on the gate
    pub fn open(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.cond.notify_all();
    }

    pub fn close(&self) {
        *self.open.lock() = false;
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Block until the gate is open
    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }

    /// Block until the gate is open or the timeout elapses; returns
    /// whether the gate was open
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut open = self.open.lock();
        if !*open {
            self.cond.wait_for(&mut open, timeout);
        }
        *open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_open_releases_waiter() {
        let gate = Arc::new(Gate::new(false));
        let gate2 = gate.clone();
        let handle = std::thread::spawn(move || gate2.wait());

        std::thread::sleep(Duration::from_millis(20));
        gate.open();
        handle.join().unwrap();
        assert!(gate.is_open());
    }

    #[test]
    fn test_wait_for_timeout() {
        let gate = Gate::new(false);
        assert!(!gate.wait_for(Duration::from_millis(10)));
        gate.open();
        assert!(gate.wait_for(Duration::from_millis(10)));
    }
}
