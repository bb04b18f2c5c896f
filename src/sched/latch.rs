use std::sync::{Condvar, Mutex};

/// A latch starts as false and eventually becomes true, exactly once. Used
/// for the worker startup/teardown rendezvous.
pub struct LockLatch {
    m: Mutex<bool>,
    v: Condvar,
}

impl LockLatch {
    #[inline]
    pub fn new() -> LockLatch {
        LockLatch {
            m: Mutex::new(false),
            v: Condvar::new(),
        }
    }

    /// Sets the latch, releasing all threads that are waiting on it.
    pub fn set(&self) {
        let mut guard = self.m.lock().unwrap();
        *guard = true;
        self.v.notify_all();
    }

    /// Blocks until the latch is set.
    pub fn wait(&self) {
        let mut guard = self.m.lock().unwrap();
        while !*guard {
            guard = self.v.wait(guard).unwrap();
        }
    }

    pub fn is_set(&self) -> bool {
        *self.m.lock().unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_releases_waiter() {
        let latch = Arc::new(LockLatch::new());
        assert!(!latch.is_set());

        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };

        latch.set();
        waiter.join().unwrap();
        assert!(latch.is_set());
    }
}
