//! Recording and inline implementations of the runtime capabilities.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use xrd_domain::{
    // ---
    AddressType,
    Clock,
    ErrorKind,
    Job,
    JobManager,
    Monitor,
    MonitorEvent,
    PostMaster,
    Resolver,
    Result,
    Task,
    TaskManager,
    XrdError,
    XrdUrl,
};

// ---------------------------------------------------------------------------
// RecordingTaskManager
// ---------------------------------------------------------------------------

/// Holds registered tasks until the test releases them with
/// [`RecordingTaskManager::run_due`].
#[derive(Default)]
pub struct RecordingTaskManager {
    // ---
    tasks: Mutex<Vec<(Arc<dyn Task>, SystemTime)>>,
}

// ---

impl RecordingTaskManager {
    // ---

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ---

    pub fn pending(&self) -> Vec<(String, SystemTime)> {
        // ---
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .map(|(task, when)| (task.name().to_string(), *when))
            .collect()
    }

    /// Run every task whose deadline is at or before `now`; tasks asking
    /// to be re-armed go back into the set.  Returns how many ran.
    pub fn run_due(&self, now: SystemTime) -> usize {
        // ---
        let due: Vec<(Arc<dyn Task>, SystemTime)> = {
            let mut tasks = self.tasks.lock().unwrap();
            let (due, pending) = tasks.drain(..).partition(|(_, when)| *when <= now);
            *tasks = pending;
            due
        };

        let count = due.len();
        for (task, _) in due {
            if let Some(next) = task.run(now) {
                self.tasks.lock().unwrap().push((task, next));
            }
        }
        count
    }
}

// ---

impl TaskManager for RecordingTaskManager {
    fn register_task(&self, task: Arc<dyn Task>, when: SystemTime) {
        self.tasks.lock().unwrap().push((task, when));
    }
}

// ---------------------------------------------------------------------------
// InlineJobManager
// ---------------------------------------------------------------------------

/// Runs every job synchronously at the queueing site — deterministic, at
/// the price of running completions on the caller's thread.
#[derive(Default)]
pub struct InlineJobManager {
    // ---
    queued: AtomicUsize,
}

// ---

impl InlineJobManager {
    // ---
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

// ---

impl JobManager for InlineJobManager {
    fn queue_job(&self, job: Arc<dyn Job>) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        job.run();
    }
}

// ---------------------------------------------------------------------------
// RecordingPostMaster
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingPostMaster {
    // ---
    force_disconnects: Mutex<Vec<XrdUrl>>,
    force_reconnects: Mutex<Vec<XrdUrl>>,
    connects: Mutex<Vec<XrdUrl>>,
    connect_errors: Mutex<Vec<(XrdUrl, XrdError)>>,
}

// ---

impl RecordingPostMaster {
    // ---

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ---

    pub fn force_disconnects(&self) -> Vec<XrdUrl> {
        self.force_disconnects.lock().unwrap().clone()
    }

    pub fn force_reconnects(&self) -> Vec<XrdUrl> {
        self.force_reconnects.lock().unwrap().clone()
    }

    pub fn connects(&self) -> Vec<XrdUrl> {
        self.connects.lock().unwrap().clone()
    }

    pub fn connect_errors(&self) -> Vec<(XrdUrl, XrdError)> {
        self.connect_errors.lock().unwrap().clone()
    }
}

// ---

impl PostMaster for RecordingPostMaster {
    // ---
    fn force_disconnect(&self, url: &XrdUrl) {
        self.force_disconnects.lock().unwrap().push(url.clone());
    }

    fn force_reconnect(&self, url: &XrdUrl) {
        self.force_reconnects.lock().unwrap().push(url.clone());
    }

    fn notify_connect(&self, url: &XrdUrl) {
        self.connects.lock().unwrap().push(url.clone());
    }

    fn notify_connect_error(&self, url: &XrdUrl, status: &XrdError) {
        self.connect_errors
            .lock()
            .unwrap()
            .push((url.clone(), status.clone()));
    }
}

// ---------------------------------------------------------------------------
// RecordingMonitor
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingMonitor {
    // ---
    events: Mutex<Vec<MonitorEvent>>,
}

// ---

impl RecordingMonitor {
    // ---
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().unwrap().clone()
    }
}

// ---

impl Monitor for RecordingMonitor {
    fn event(&self, event: MonitorEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ---------------------------------------------------------------------------
// MockClock
// ---------------------------------------------------------------------------

/// A clock the test moves by hand.
pub struct MockClock {
    // ---
    now: Mutex<SystemTime>,
}

// ---

impl MockClock {
    // ---

    /// Starts at the epoch plus one hour, so subtracting small windows
    /// never underflows.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(SystemTime::UNIX_EPOCH + Duration::from_secs(3600)),
        })
    }

    // ---

    pub fn set(&self, now: SystemTime) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

// ---

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// StaticResolver
// ---------------------------------------------------------------------------

/// Resolves from a fixed host table.  Unknown hosts fail with
/// `ConnectionError`, like a real lookup would.
#[derive(Default)]
pub struct StaticResolver {
    // ---
    table: Mutex<HashMap<String, Vec<SocketAddr>>>,
}

// ---

impl StaticResolver {
    // ---

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ---

    pub fn add(&self, host: &str, addrs: Vec<SocketAddr>) {
        self.table.lock().unwrap().insert(host.to_string(), addrs);
    }

    pub fn remove(&self, host: &str) {
        self.table.lock().unwrap().remove(host);
    }
}

// ---

impl Resolver for StaticResolver {
    // ---
    fn resolve(&self, url: &XrdUrl, family: AddressType) -> Result<Vec<SocketAddr>> {
        // ---
        let addrs: Vec<SocketAddr> = self
            .table
            .lock()
            .unwrap()
            .get(url.host())
            .map(|addrs| addrs.iter().filter(|a| family.accepts(a)).copied().collect())
            .unwrap_or_default();

        if addrs.is_empty() {
            return Err(XrdError::new(ErrorKind::ConnectionError));
        }
        Ok(addrs)
    }
}
