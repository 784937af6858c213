//! Background closing of long-idle connections.

use std::{
    io,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace_span};

use crate::{connection::ConnectionFactory, pool::Shared};

/// Stop flag shared between the pool and the reaper thread.
#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn signal(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    /// Sleep for `interval` or until stopped, whichever comes first.
    ///
    /// Returns `true` if stopped.
    fn sleep(&self, interval: Duration) -> bool {
        let deadline = Instant::now().checked_add(interval);
        let mut stopped = self.stopped.lock();
        while !*stopped {
            match deadline {
                Some(deadline) => {
                    if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                        break;
                    }
                }
                // Not representable, sleep until stopped.
                None => self.wake.wait(&mut stopped),
            }
        }
        *stopped
    }
}

/// Idle reaper.
///
/// Wakes every `interval` and closes connections idle for longer than `max_idle`. Holds only
/// a weak reference to the pool, so it never keeps a pool alive on its own.
#[derive(Debug)]
pub(crate) struct Reaper {
    /// Signal used to stop the reaper thread.
    stop: Arc<StopSignal>,
    /// Reaper thread handle.
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Start reaper thread for a pool.
    pub(crate) fn spawn<F: ConnectionFactory>(
        pool: Weak<Shared<F>>,
        label: &str,
        interval: Duration,
        max_idle: Duration,
    ) -> io::Result<Self> {
        let stop = Arc::new(StopSignal::default());
        let thread_stop = stop.clone();
        let span = trace_span!("pool_reaper", pool = label);
        let thread = thread::Builder::new()
            .name("dbpool-reaper".into())
            .spawn(move || {
                let _span = span.entered();
                while !thread_stop.sleep(interval) {
                    let Some(shared) = pool.upgrade() else {
                        break;
                    };
                    shared.reap_idle(max_idle);
                }
                debug!("idle reaper stopped");
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop reaper thread and wait for it to exit.
    pub(crate) fn stop(mut self) {
        self.stop.signal();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        // Last pool handle may be dropped by the reaper thread itself, so never join here.
        self.stop.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_times_out() {
        let signal = StopSignal::default();
        let start = Instant::now();
        assert!(!signal.sleep(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn signal_interrupts_sleep() {
        let signal = Arc::new(StopSignal::default());
        let sleeper = {
            let signal = signal.clone();
            thread::spawn(move || signal.sleep(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        signal.signal();
        assert!(sleeper.join().unwrap());
        // Stays stopped.
        assert!(signal.sleep(Duration::from_secs(30)));
    }

    #[test]
    fn signal_interrupts_unbounded_sleep() {
        let signal = Arc::new(StopSignal::default());
        let sleeper = {
            let signal = signal.clone();
            thread::spawn(move || signal.sleep(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        signal.signal();
        assert!(sleeper.join().unwrap());
        assert!(signal.sleep(Duration::MAX));
    }
}
