//! Per-key serial work queues.
//!
//! Cross-session operations (publication fan-out, relay, bridge
//! callbacks) must never lock a second session while holding the first.
//! Instead they enqueue a closure onto one of 32 serial queues selected
//! by `gid % 32`; a dedicated task drains each queue, so all work under
//! one gid is serialized and session locks are only ever taken from a
//! queue task that holds no other lock.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::sync::mpsc;
use tracing::error;

const QUEUES: u64 = 32;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// The work-queue fabric.
pub struct Fabric {
    queues: Vec<mpsc::UnboundedSender<Job>>,
}

impl Fabric {
    /// Create the queues and spawn one drain task per queue.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start() -> Self {
        let mut queues = Vec::with_capacity(QUEUES as usize);
        for i in 0..QUEUES {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            queues.push(tx);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!(target: "fabric", queue = i, "queued job panicked");
                    }
                }
            });
        }
        Self { queues }
    }

    /// Enqueue `f` onto the queue selected by `gid`.
    pub fn call(&self, gid: u64, f: impl FnOnce() + Send + 'static) {
        let idx = (gid % QUEUES) as usize;
        // Send only fails after shutdown, when dropping the job is fine.
        let _ = self.queues[idx].send(Box::new(f));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration, sleep};

    #[tokio::test]
    async fn same_gid_runs_in_order() {
        let fabric = Fabric::start();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            fabric.call(7, move || log.lock().unwrap().push(i));
        }
        sleep(Duration::from_millis(100)).await;
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn a_panicking_job_does_not_kill_the_queue() {
        let fabric = Fabric::start();
        let ran = Arc::new(AtomicUsize::new(0));
        fabric.call(3, || panic!("boom"));
        let ran2 = Arc::clone(&ran);
        fabric.call(3, move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
