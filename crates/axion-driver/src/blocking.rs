//! Counter that blocks until a number of events have happened.
//!
//! Used by the synchronous `execute` entry points to wait for the
//! asynchronous completion callbacks of one or more submitted requests.

use std::sync::{Condvar, Mutex};

/// Blocks a waiter until `count` decrements have occurred.
pub struct BlockingCounter {
    count: Mutex<usize>,
    zero: Condvar,
}

impl BlockingCounter {
    /// Creates a counter expecting `count` decrements.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Records one event. Wakes waiters when the count reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if decremented below zero; that is always a bookkeeping bug.
    pub fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        assert!(*count > 0, "blocking counter decremented below zero");
        *count -= 1;
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.zero.wait(count).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn waits_for_all_decrements() {
        let counter = Arc::new(BlockingCounter::new(3));
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || counter.decrement())
            })
            .collect();
        counter.wait();
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn zero_count_does_not_block() {
        BlockingCounter::new(0).wait();
    }
}
