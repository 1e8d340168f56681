//! Scriptable transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

use xrd_domain::{
    // ---
    Message,
    PathId,
    Result,
    TransportAction,
    TransportHandler,
    TransportQuery,
    XrdError,
    XrdUrl,
};

// ---------------------------------------------------------------------------
// SimTransport
// ---------------------------------------------------------------------------

/// Deterministic [`TransportHandler`]: routing decisions and received-
/// message actions are queues the test scripts; health judgements are
/// toggles.
pub struct SimTransport {
    // ---
    substream_count: AtomicU16,

    /// Scripted initial path picks; empty = `(0, 0)`.
    routes: Mutex<VecDeque<PathId>>,

    /// Scripted actions for `message_received`; empty = `NONE`.
    received_actions: Mutex<VecDeque<TransportAction>>,

    ttl_elapsed: AtomicBool,

    broken: Mutex<Option<XrdError>>,

    auth: Mutex<Option<String>>,

    /// `(message id, substream, bytes)` per `message_sent`.
    sent: Mutex<Vec<(Uuid, u16, u32)>>,

    /// `(message id, substream)` per `message_received` consultation.
    received: Mutex<Vec<(Uuid, u16)>>,
}

// ---

impl SimTransport {
    // ---

    pub fn new(substream_count: u16) -> Self {
        Self {
            substream_count: AtomicU16::new(substream_count),
            routes: Mutex::new(VecDeque::new()),
            received_actions: Mutex::new(VecDeque::new()),
            ttl_elapsed: AtomicBool::new(false),
            broken: Mutex::new(None),
            auth: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    // ---

    pub fn set_substream_count(&self, count: u16) {
        self.substream_count.store(count, Ordering::SeqCst);
    }

    /// Queue the path returned by the next initial `multiplex_substream`.
    pub fn script_route(&self, path: PathId) {
        self.routes.lock().unwrap().push_back(path);
    }

    /// Queue the action returned by the next `message_received`.
    pub fn script_received_action(&self, action: TransportAction) {
        self.received_actions.lock().unwrap().push_back(action);
    }

    pub fn set_ttl_elapsed(&self, elapsed: bool) {
        self.ttl_elapsed.store(elapsed, Ordering::SeqCst);
    }

    pub fn set_broken(&self, status: Option<XrdError>) {
        *self.broken.lock().unwrap() = status;
    }

    pub fn set_auth(&self, auth: Option<String>) {
        *self.auth.lock().unwrap() = auth;
    }

    // ---

    pub fn sent(&self) -> Vec<(Uuid, u16, u32)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<(Uuid, u16)> {
        self.received.lock().unwrap().clone()
    }
}

// ---

impl TransportHandler for SimTransport {
    // ---
    fn multiplex_substream(&self, _msg: &Message, hint: Option<PathId>) -> PathId {
        // ---
        // The finalize pass keeps whatever the stream settled on.
        if let Some(path) = hint {
            return path;
        }
        self.routes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(PathId::main)
    }

    fn message_received(&self, msg: &Message, substream: u16) -> TransportAction {
        // ---
        self.received.lock().unwrap().push((msg.id(), substream));
        self.received_actions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TransportAction::NONE)
    }

    fn message_sent(&self, msg: &Message, substream: u16, bytes: u32) {
        self.sent.lock().unwrap().push((msg.id(), substream, bytes));
    }

    // ---

    fn substream_count(&self) -> u16 {
        self.substream_count.load(Ordering::SeqCst)
    }

    fn bind_preference(&self, url: &XrdUrl) -> XrdUrl {
        url.clone()
    }

    // ---

    fn is_stream_ttl_elapsed(&self, _idle: Duration) -> bool {
        self.ttl_elapsed.load(Ordering::SeqCst)
    }

    fn is_stream_broken(&self, _idle: Duration) -> Result<()> {
        // ---
        match self.broken.lock().unwrap().clone() {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn query(&self, query: TransportQuery) -> Option<String> {
        // ---
        match query {
            TransportQuery::Auth => self.auth.lock().unwrap().clone(),
        }
    }
}
