//! Device activity watchdog.
//!
//! The DMA scheduler arms the watchdog whenever work is active on the
//! device and disarms it when the active queue drains. If an armed watchdog
//! reaches its deadline the expiry callback runs on the watchdog thread;
//! the driver uses it to record telemetry and reset the device.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::warn;

struct WatchdogState {
    armed: bool,
    generation: u64,
    deadline: Option<Instant>,
    shutdown: bool,
}

struct WatchdogShared {
    state: Mutex<WatchdogState>,
    cv: Condvar,
    timeout: Duration,
    callback: Box<dyn Fn() + Send + Sync>,
}

/// Deadline timer over device activity.
pub struct Watchdog {
    shared: Arc<WatchdogShared>,
    thread: Option<thread::JoinHandle<()>>,
    enabled: bool,
}

impl Watchdog {
    /// Creates a watchdog firing `callback` when armed for longer than
    /// `timeout_ns`. A non-positive timeout disables expiry; arming still
    /// tracks state so the armed/disarmed invariant holds.
    pub fn new(timeout_ns: i64, callback: Box<dyn Fn() + Send + Sync>) -> Self {
        let enabled = timeout_ns > 0;
        let shared = Arc::new(WatchdogShared {
            state: Mutex::new(WatchdogState {
                armed: false,
                generation: 0,
                deadline: None,
                shutdown: false,
            }),
            cv: Condvar::new(),
            timeout: Duration::from_nanos(timeout_ns.max(0) as u64),
            callback,
        });
        let thread = enabled.then(|| {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("axion-watchdog".to_string())
                .spawn(move || watchdog_thread(&shared))
                .expect("failed to spawn watchdog thread")
        });
        Self {
            shared,
            thread,
            enabled,
        }
    }

    /// Arms the watchdog, restarting the deadline.
    pub fn activate(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.armed = true;
        state.generation += 1;
        if self.enabled {
            state.deadline = Some(Instant::now() + self.shared.timeout);
        }
        self.shared.cv.notify_all();
    }

    /// Disarms the watchdog.
    pub fn deactivate(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.armed = false;
        state.deadline = None;
        self.shared.cv.notify_all();
    }

    /// True while armed.
    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().unwrap().armed
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.cv.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watchdog_thread(shared: &WatchdogShared) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }
        match state.deadline {
            None => {
                state = shared.cv.wait(state).unwrap();
            }
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    let (next, _) = shared
                        .cv
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = next;
                    continue;
                }
                // Deadline reached. Re-check under the lock: a deactivate or
                // re-arm may have raced the timeout.
                if state.armed && state.deadline == Some(deadline) {
                    let generation = state.generation;
                    state.armed = false;
                    state.deadline = None;
                    drop(state);
                    warn!("watchdog expired (generation {generation})");
                    (shared.callback)();
                    state = shared.state.lock().unwrap();
                }
                // Otherwise a re-arm or deactivate won the race; the state
                // already reflects it.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_after_timeout() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let watchdog = Watchdog::new(
            2_000_000, // 2 ms
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        watchdog.activate();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!watchdog.is_armed());
    }

    #[test]
    fn deactivate_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let watchdog = Watchdog::new(
            5_000_000,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        watchdog.activate();
        watchdog.deactivate();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disabled_watchdog_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let watchdog = Watchdog::new(
            0,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        watchdog.activate();
        assert!(watchdog.is_armed());
        thread::sleep(Duration::from_millis(10));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
