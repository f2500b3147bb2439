//! Background job scheduling with graceful shutdown.
//!
//! Each periodic job runs on its own thread. Waits between runs are
//! interruptible; a run already in progress always completes before the
//! thread exits.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (lock, condvar) = &*self.inner;
        match lock.lock() {
            Ok(mut triggered) => *triggered = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
        condvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        match lock.lock() {
            Ok(triggered) => *triggered,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleeps up to `timeout`. Returns true if shutdown was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, condvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let Ok(mut triggered) = lock.lock() else {
            return true;
        };
        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match condvar.wait_timeout(triggered, deadline - now) {
                Ok((guard, _)) => triggered = guard,
                Err(_) => return true,
            }
        }
        true
    }
}

/// Spawns a job that waits `next_delay()` then runs, until shutdown.
pub fn spawn_periodic<D, J>(
    name: &'static str,
    shutdown: ShutdownSignal,
    mut next_delay: D,
    mut job: J,
) -> std::io::Result<JoinHandle<()>>
where
    D: FnMut() -> Duration + Send + 'static,
    J: FnMut() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("shiftd-{}", name))
        .spawn(move || {
            info!(job = name, "Background job started");
            loop {
                let delay = next_delay();
                if shutdown.wait_timeout(delay) {
                    break;
                }
                job();
            }
            info!(job = name, "Background job stopped");
        })
}

/// Joins background jobs, logging any that panicked.
pub fn join_all(handles: Vec<(&'static str, JoinHandle<()>)>) {
    for (name, handle) in handles {
        if handle.join().is_err() {
            warn!(job = name, "Background job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wait_returns_false_on_timeout() {
        let shutdown = ShutdownSignal::new();
        assert!(!shutdown.wait_timeout(Duration::from_millis(10)));
        assert!(!shutdown.is_triggered());
    }

    #[test]
    fn trigger_interrupts_long_wait() {
        let shutdown = ShutdownSignal::new();
        let waiter = shutdown.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn periodic_job_runs_until_shutdown() {
        let shutdown = ShutdownSignal::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let handle = spawn_periodic(
            "test",
            shutdown.clone(),
            || Duration::from_millis(5),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        shutdown.trigger();
        join_all(vec![("test", handle)]);

        let settled = runs.load(Ordering::SeqCst);
        assert!(settled >= 3);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn in_flight_job_completes_before_exit() {
        let shutdown = ShutdownSignal::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        let trigger = shutdown.clone();

        let handle = spawn_periodic(
            "drain",
            shutdown.clone(),
            || Duration::from_millis(1),
            move || {
                trigger.trigger();
                thread::sleep(Duration::from_millis(30));
                done.fetch_add(1, Ordering::SeqCst);
            },
        )
        .expect("spawn");

        join_all(vec![("drain", handle)]);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
