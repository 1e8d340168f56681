//! Scriptable socket handlers.
//!
//! [`SimNet`] stands in for the real socket layer: every socket it creates
//! is retained so tests can inspect connect attempts, uplink arming, and
//! drive the connect outcome by hand.  Connect results are scripted as a
//! queue per substream; an empty script means every initiation succeeds
//! (i.e. moves the substream to `Connecting` — completion stays in the
//! test's hands).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use xrd_domain::{
    // ---
    Poller,
    Result,
    SocketFactory,
    SocketHandler,
    StreamEvents,
    XrdError,
    XrdUrl,
};

// ---------------------------------------------------------------------------
// SimSocket
// ---------------------------------------------------------------------------

pub struct SimSocket {
    // ---
    substream: u16,
    name: String,
    host: String,

    address: Mutex<Option<SocketAddr>>,

    /// Scripted results for successive `connect` calls; empty = `Ok`.
    connect_script: Mutex<VecDeque<Result<()>>>,

    /// Address used by each `connect` call, in order.
    connect_attempts: Mutex<Vec<SocketAddr>>,

    uplink_enabled: AtomicBool,
    enable_count: AtomicUsize,
    disable_count: AtomicUsize,
    close_count: AtomicUsize,

    last_activity: Mutex<SystemTime>,

    /// Back-reference used to drive callbacks from tests.
    events: Weak<dyn StreamEvents>,
}

// ---

impl SimSocket {
    // ---

    fn new(url: &XrdUrl, substream: u16, events: Weak<dyn StreamEvents>) -> Self {
        Self {
            substream,
            name: format!("{}.{}", url.host_id(), substream),
            host: url.host().to_string(),
            address: Mutex::new(None),
            connect_script: Mutex::new(VecDeque::new()),
            connect_attempts: Mutex::new(Vec::new()),
            uplink_enabled: AtomicBool::new(false),
            enable_count: AtomicUsize::new(0),
            disable_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            last_activity: Mutex::new(SystemTime::UNIX_EPOCH),
            events,
        }
    }

    // ---

    /// Queue the outcome of the next `connect` initiation.
    pub fn script_connect(&self, result: Result<()>) {
        self.connect_script.lock().unwrap().push_back(result);
    }

    pub fn connect_attempts(&self) -> Vec<SocketAddr> {
        self.connect_attempts.lock().unwrap().clone()
    }

    pub fn uplink_enabled(&self) -> bool {
        self.uplink_enabled.load(Ordering::SeqCst)
    }

    pub fn enable_count(&self) -> usize {
        self.enable_count.load(Ordering::SeqCst)
    }

    pub fn disable_count(&self) -> usize {
        self.disable_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn set_last_activity(&self, when: SystemTime) {
        *self.last_activity.lock().unwrap() = when;
    }

    // ---

    /// The stream this socket reports into, if it still exists.
    pub fn events(&self) -> Option<Arc<dyn StreamEvents>> {
        self.events.upgrade()
    }

    /// Drive the pending connect to completion.
    pub fn complete_connect(&self) {
        // ---
        if let Some(events) = self.events() {
            events.on_connect(self.substream);
        }
    }

    /// Fail the pending connect.
    pub fn fail_connect(&self, status: XrdError) {
        // ---
        if let Some(events) = self.events() {
            events.on_connect_error(self.substream, status);
        }
    }
}

// ---

/// Local newtype over `Arc<SimSocket>` so the foreign `SocketHandler` trait
/// can be implemented for it without violating orphan rules, while still
/// sharing state with any other `Arc<SimSocket>` clone (e.g. the one kept
/// in [`SimNet`]).
struct SimSocketHandle(Arc<SimSocket>);

impl std::ops::Deref for SimSocketHandle {
    type Target = SimSocket;

    fn deref(&self) -> &SimSocket {
        &self.0
    }
}

impl SocketHandler for SimSocketHandle {
    // ---
    fn set_address(&self, addr: SocketAddr) {
        *self.address.lock().unwrap() = Some(addr);
    }

    fn address(&self) -> Option<SocketAddr> {
        *self.address.lock().unwrap()
    }

    fn connect(&self, _window: Duration) -> Result<()> {
        // ---
        if let Some(addr) = *self.address.lock().unwrap() {
            self.connect_attempts.lock().unwrap().push(addr);
        }

        let result = self
            .connect_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        tracing::trace!(socket = %self.name, ok = result.is_ok(), "connect initiated");
        result
    }

    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.uplink_enabled.store(false, Ordering::SeqCst);
    }

    // ---

    fn enable_uplink(&self) -> Result<()> {
        self.enable_count.fetch_add(1, Ordering::SeqCst);
        self.uplink_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disable_uplink(&self) -> Result<()> {
        self.disable_count.fetch_add(1, Ordering::SeqCst);
        self.uplink_enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    // ---

    fn stream_name(&self) -> String {
        self.name.clone()
    }

    fn ip_addr(&self) -> Option<String> {
        self.address.lock().unwrap().map(|a| a.ip().to_string())
    }

    fn ip_stack(&self) -> Option<String> {
        // ---
        self.address.lock().unwrap().map(|a| {
            if a.is_ipv6() {
                "IPv6".to_string()
            } else {
                "IPv4".to_string()
            }
        })
    }

    fn host_name(&self) -> Option<String> {
        Some(self.host.clone())
    }

    fn last_activity(&self) -> SystemTime {
        *self.last_activity.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// SimNet
// ---------------------------------------------------------------------------

/// Factory retaining every socket it creates, with pre-registration of
/// connect scripts for substreams that do not exist yet (the data-plane
/// siblings are created — and connected — inside the substream-0 connect
/// callback).
#[derive(Default)]
pub struct SimNet {
    // ---
    sockets: Mutex<Vec<Arc<SimSocket>>>,

    /// Connect scripts to seed into sockets created later, by substream.
    pending_scripts: Mutex<HashMap<u16, VecDeque<Result<()>>>>,
}

// ---

impl SimNet {
    // ---

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ---

    /// The socket created for `substream`, if any.
    pub fn socket(&self, substream: u16) -> Option<Arc<SimSocket>> {
        // ---
        self.sockets
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.substream == substream)
            .cloned()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }

    // ---

    /// Script the outcome of the next `connect` on `substream`, before or
    /// after its socket exists.
    pub fn script_connect(&self, substream: u16, result: Result<()>) {
        // ---
        if let Some(socket) = self.socket(substream) {
            socket.script_connect(result);
            return;
        }
        self.pending_scripts
            .lock()
            .unwrap()
            .entry(substream)
            .or_default()
            .push_back(result);
    }
}

// ---

impl SocketFactory for SimNet {
    // ---
    fn create(
        &self,
        url: &XrdUrl,
        substream: u16,
        _poller: Arc<dyn Poller>,
        events: Weak<dyn StreamEvents>,
    ) -> Box<dyn SocketHandler> {
        // ---
        let socket = Arc::new(SimSocket::new(url, substream, events));

        if let Some(script) = self.pending_scripts.lock().unwrap().remove(&substream) {
            *socket.connect_script.lock().unwrap() = script;
        }

        self.sockets.lock().unwrap().push(Arc::clone(&socket));
        Box::new(SimSocketHandle(socket))
    }
}

// ---------------------------------------------------------------------------
// NullPoller
// ---------------------------------------------------------------------------

/// The sim sockets have no readiness to wait for.
#[derive(Debug, Default)]
pub struct NullPoller;

impl Poller for NullPoller {
    fn register(&self, _name: &str) {}

    fn unregister(&self, _name: &str) {}
}
