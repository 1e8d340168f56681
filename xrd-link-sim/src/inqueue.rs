//! Scriptable incoming-handler registry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use xrd_domain::{
    // ---
    IncomingQueue,
    InstalledHandler,
    Message,
    MsgHandler,
    StreamEvent,
    XrdError,
};

// ---------------------------------------------------------------------------
// SimIncomingQueue
// ---------------------------------------------------------------------------

/// Records every interaction; `handler_for_message` answers from a queue
/// of scripted installations.
#[derive(Default)]
pub struct SimIncomingQueue {
    // ---
    /// Scripted answers for `handler_for_message`, in order.
    installable: Mutex<VecDeque<InstalledHandler>>,

    /// Handlers currently registered via `add_message_handler`.
    registered: Mutex<Vec<Arc<dyn MsgHandler>>>,

    /// Forces `add_message_handler` to report a displaced leftover.
    leftover: AtomicBool,

    re_added: Mutex<Vec<(Arc<dyn MsgHandler>, SystemTime)>>,

    removed: Mutex<Vec<Arc<dyn MsgHandler>>>,

    timeouts_assigned: AtomicUsize,

    reported_timeouts: Mutex<Vec<SystemTime>>,

    stream_events: Mutex<Vec<(StreamEvent, XrdError)>>,
}

// ---

impl SimIncomingQueue {
    // ---

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ---

    /// Script the next `handler_for_message` answer.
    pub fn install(&self, handler: InstalledHandler) {
        self.installable.lock().unwrap().push_back(handler);
    }

    pub fn set_leftover(&self, leftover: bool) {
        self.leftover.store(leftover, Ordering::SeqCst);
    }

    // ---

    pub fn registered_count(&self) -> usize {
        self.registered.lock().unwrap().len()
    }

    pub fn re_added(&self) -> Vec<(Arc<dyn MsgHandler>, SystemTime)> {
        self.re_added.lock().unwrap().clone()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.lock().unwrap().len()
    }

    pub fn timeouts_assigned(&self) -> usize {
        self.timeouts_assigned.load(Ordering::SeqCst)
    }

    pub fn reported_timeouts(&self) -> Vec<SystemTime> {
        self.reported_timeouts.lock().unwrap().clone()
    }

    pub fn stream_events(&self) -> Vec<(StreamEvent, XrdError)> {
        self.stream_events.lock().unwrap().clone()
    }
}

// ---

impl IncomingQueue for SimIncomingQueue {
    // ---
    fn add_message_handler(&self, handler: Arc<dyn MsgHandler>) -> bool {
        self.registered.lock().unwrap().push(handler);
        self.leftover.load(Ordering::SeqCst)
    }

    fn re_add_message_handler(&self, handler: Arc<dyn MsgHandler>, expires: SystemTime) {
        self.re_added.lock().unwrap().push((handler, expires));
    }

    fn remove_message_handler(&self, handler: &Arc<dyn MsgHandler>) {
        // ---
        self.registered
            .lock()
            .unwrap()
            .retain(|h| !Arc::ptr_eq(h, handler));
        self.removed.lock().unwrap().push(Arc::clone(handler));
    }

    fn handler_for_message(&self, _msg: &Message) -> Option<InstalledHandler> {
        self.installable.lock().unwrap().pop_front()
    }

    // ---

    fn assign_timeout(&self, _handler: &Arc<dyn MsgHandler>) {
        self.timeouts_assigned.fetch_add(1, Ordering::SeqCst);
    }

    fn report_timeout(&self, now: SystemTime) {
        self.reported_timeouts.lock().unwrap().push(now);
    }

    fn report_stream_event(&self, event: StreamEvent, status: XrdError) {
        self.stream_events.lock().unwrap().push((event, status));
    }
}
