//! Recording message handlers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use xrd_domain::{Message, MsgAction, MsgHandler, PartialAware, Result};

// ---------------------------------------------------------------------------
// RecordingHandler
// ---------------------------------------------------------------------------

/// A [`MsgHandler`] that records every callback it receives.
///
/// Built partial-aware or not — the stream's capability probe drives the
/// partial-fence path only for the aware flavour.
pub struct RecordingHandler {
    // ---
    ready_to_send: AtomicUsize,

    statuses: Mutex<Vec<Result<()>>>,

    messages: Mutex<Vec<Arc<Message>>>,

    partials: AtomicUsize,

    /// Returned by `inspect_status_rsp`.
    inspect_action: Mutex<MsgAction>,

    partial_aware: bool,
}

// ---

impl RecordingHandler {
    // ---

    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    pub fn partial_aware() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    fn build(partial_aware: bool) -> Self {
        Self {
            ready_to_send: AtomicUsize::new(0),
            statuses: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            partials: AtomicUsize::new(0),
            inspect_action: Mutex::new(MsgAction::NONE),
            partial_aware,
        }
    }

    // ---

    pub fn set_inspect_action(&self, action: MsgAction) {
        *self.inspect_action.lock().unwrap() = action;
    }

    // ---

    pub fn ready_to_send_count(&self) -> usize {
        self.ready_to_send.load(Ordering::SeqCst)
    }

    /// Every `on_status_ready` outcome, in order.
    pub fn statuses(&self) -> Vec<Result<()>> {
        self.statuses.lock().unwrap().clone()
    }

    /// Messages dispatched through `on_message`.
    pub fn messages(&self) -> Vec<Arc<Message>> {
        self.messages.lock().unwrap().clone()
    }

    pub fn partials(&self) -> usize {
        self.partials.load(Ordering::SeqCst)
    }
}

// ---

impl MsgHandler for RecordingHandler {
    // ---
    fn on_ready_to_send(&self, _msg: &Message) {
        self.ready_to_send.fetch_add(1, Ordering::SeqCst);
    }

    fn on_status_ready(&self, _msg: &Message, status: Result<()>) {
        self.statuses.lock().unwrap().push(status);
    }

    fn on_message(&self, msg: Arc<Message>) {
        self.messages.lock().unwrap().push(msg);
    }

    fn inspect_status_rsp(&self) -> MsgAction {
        *self.inspect_action.lock().unwrap()
    }

    fn as_partial_aware(&self) -> Option<&dyn PartialAware> {
        self.partial_aware.then_some(self as &dyn PartialAware)
    }
}

// ---

impl PartialAware for RecordingHandler {
    fn partial_received(&self) {
        self.partials.fetch_add(1, Ordering::SeqCst);
    }
}
