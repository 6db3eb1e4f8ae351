//! Component G: the iteration/closure driver.
//!
//! An independent thread that, on a fixed period, reads cluster state
//! under the node table's read lock, computes an advisory value via a
//! caller-supplied closure, and hands the result to an external writer.
//! Used today by a power-cap adjuster; the closure is the only thing that
//! changes between consumers.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, instrument};

/// A read-only view of one node, handed to the adjustment closure. Mirrors
/// only the fields a power-cap-style adjuster needs — not the full
/// `NodeRecord`, so the driver doesn't couple to the selector's row
/// internals.
#[derive(Clone, Copy, Debug)]
pub struct NodeView {
    pub node_idx: usize,
    pub cpus: u32,
    pub idle_cpus: u32,
    pub current_watts: u32,
}

/// One tick's output: an advisory value per node, handed to the writer.
pub type AdvisoryCap = u32;

struct StopSignal {
    stop: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stop: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Waits up to `period`, waking immediately if `signal_stop` fires in
    /// the meantime. Returns `true` if the stop flag is set (by either the
    /// wait elapsing after a prior signal or a signal during the wait).
    fn wait(&self, period: Duration) -> bool {
        let guard = self.stop.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _) = self.cv.wait_timeout(guard, period).unwrap();
        *guard
    }

    fn signal_stop(&self) {
        let mut guard = self.stop.lock().unwrap();
        *guard = true;
        self.cv.notify_all();
    }
}

/// Handle to a running driver thread. Dropping this without calling
/// [`Driver::stop`] leaves the thread running; `stop` joins it.
pub struct Driver {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Driver {
    /// Spawns the polling thread. `period` is the sleep interval between
    /// ticks; `sample` reads the current node/job state and returns the
    /// per-node views to adjust; `adjust` computes the advisory cap for one
    /// node; `write` hands the finished per-tick result to the external
    /// writer (e.g. a power-cap RPC).
    #[instrument(skip(sample, adjust, write))]
    pub fn spawn<S, A, W>(period: Duration, sample: S, adjust: A, write: W) -> Self
    where
        S: Fn() -> Vec<NodeView> + Send + 'static,
        A: Fn(&NodeView) -> AdvisoryCap + Send + 'static,
        W: Fn(Vec<(usize, AdvisoryCap)>) + Send + 'static,
    {
        let signal = Arc::new(StopSignal::new());
        let thread_signal = Arc::clone(&signal);

        let handle = std::thread::spawn(move || {
            loop {
                let views = sample();
                let results: Vec<(usize, AdvisoryCap)> =
                    views.iter().map(|v| (v.node_idx, adjust(v))).collect();
                debug!(ticks = results.len(), "driver tick computed advisory caps");
                write(results);

                if thread_signal.wait(period) {
                    break;
                }
            }
        });

        Self {
            signal,
            handle: Some(handle),
        }
    }

    /// Signals the thread to stop and joins it. Wakes the thread
    /// immediately rather than waiting for the current period to elapse.
    pub fn stop(mut self) {
        self.signal.signal_stop();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.signal.signal_stop();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn ticks_and_reports_results_until_stopped() {
        let (tx, rx) = mpsc::channel();
        let driver = Driver::spawn(
            Duration::from_millis(5),
            || {
                vec![NodeView {
                    node_idx: 0,
                    cpus: 4,
                    idle_cpus: 2,
                    current_watts: 100,
                }]
            },
            |v| v.idle_cpus * 10,
            move |results| {
                let _ = tx.send(results);
            },
        );

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first, vec![(0, 20)]);

        driver.stop();
    }

    #[test]
    fn stop_wakes_promptly_without_waiting_full_period() {
        let (tx, rx) = mpsc::channel();
        let driver = Driver::spawn(
            Duration::from_secs(3600),
            || Vec::<NodeView>::new(),
            |_| 0,
            move |_| {
                let _ = tx.send(());
            },
        );
        // Let the first immediate tick land, then stop; drop/stop must not
        // block for anywhere near the 3600s period.
        let _ = rx.recv_timeout(Duration::from_secs(1));
        let start = std::time::Instant::now();
        driver.stop();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
