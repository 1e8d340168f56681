//! Tokio-backed implementations of the deferred-work capabilities.
//!
//! The stream core only speaks the [`TaskManager`] / [`JobManager`] traits;
//! these adapters are what a process embedding the client normally plugs
//! in.  Both are callable from synchronous callback context — registration
//! and queueing never await.
//!
//! Jobs run on a dedicated worker thread rather than a tokio task: user
//! completion callbacks are allowed to block, and a blocked callback must
//! not stall the runtime the sockets live on.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use xrd_domain::{ErrorKind, Job, JobManager, Result, Task, TaskManager, XrdError};

// ---------------------------------------------------------------------------
// TimerTaskManager
// ---------------------------------------------------------------------------

/// Runs each registered task when its deadline arrives, re-arming it for
/// as long as `run` keeps returning a new deadline.
pub struct TimerTaskManager {
    // ---
    handle: Handle,
}

// ---

impl TimerTaskManager {
    // ---
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self {
            handle: Handle::current(),
        }
    }
}

// ---

impl TaskManager for TimerTaskManager {
    // ---
    fn register_task(&self, task: Arc<dyn Task>, when: SystemTime) {
        // ---
        self.handle.spawn(async move {
            let mut when = when;
            loop {
                let delay = when
                    .duration_since(SystemTime::now())
                    .unwrap_or_default();
                tokio::time::sleep(delay).await;

                let now = SystemTime::now();
                tracing::trace!(task = task.name(), "task deadline reached");
                match task.run(now) {
                    Some(next) => when = next,
                    None => return,
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// WorkerJobManager
// ---------------------------------------------------------------------------

/// FIFO job dispatch on a dedicated worker thread.
///
/// The worker exits when the last sender is dropped; jobs already queued
/// are drained first.
pub struct WorkerJobManager {
    // ---
    tx: mpsc::UnboundedSender<Arc<dyn Job>>,
}

// ---

impl WorkerJobManager {
    // ---
    /// Spawn the worker thread and return the manager.
    pub fn spawn() -> Result<Self> {
        // ---
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<dyn Job>>();

        std::thread::Builder::new()
            .name("xrd-jobs".into())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job.run();
                }
                tracing::debug!("job channel closed, worker exiting");
            })
            .map_err(|_| XrdError::new(ErrorKind::LocalError))?;

        Ok(Self { tx })
    }
}

// ---

impl JobManager for WorkerJobManager {
    // ---
    fn queue_job(&self, job: Arc<dyn Job>) {
        if self.tx.send(job).is_err() {
            tracing::warn!("job worker gone — dropping job");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    // ---

    struct CountedTask {
        fired: AtomicUsize,
        reps: usize,
        interval: Duration,
    }

    impl Task for CountedTask {
        fn name(&self) -> &str {
            "counted"
        }

        fn run(&self, now: SystemTime) -> Option<SystemTime> {
            let n = self.fired.fetch_add(1, Ordering::SeqCst) + 1;
            (n < self.reps).then(|| now + self.interval)
        }
    }

    #[tokio::test]
    async fn task_fires_and_reschedules() {
        // ---
        let mgr = TimerTaskManager::new();
        let task = Arc::new(CountedTask {
            fired: AtomicUsize::new(0),
            reps: 3,
            interval: Duration::from_millis(5),
        });

        mgr.register_task(task.clone(), SystemTime::now() + Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(task.fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn past_deadline_fires_immediately() {
        // ---
        let mgr = TimerTaskManager::new();
        let task = Arc::new(CountedTask {
            fired: AtomicUsize::new(0),
            reps: 1,
            interval: Duration::ZERO,
        });

        mgr.register_task(task.clone(), SystemTime::now() - Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(task.fired.load(Ordering::SeqCst), 1);
    }

    // ---

    struct OrderedJob {
        n: usize,
        log: Arc<Mutex<Vec<usize>>>,
    }

    impl Job for OrderedJob {
        fn run(&self) {
            self.log.lock().unwrap().push(self.n);
        }
    }

    #[tokio::test]
    async fn jobs_run_in_fifo_order() {
        // ---
        let mgr = WorkerJobManager::spawn().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for n in 0..32 {
            mgr.queue_job(Arc::new(OrderedJob { n, log: log.clone() }));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*log.lock().unwrap(), (0..32).collect::<Vec<_>>());
    }
}
