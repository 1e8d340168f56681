//! Message-handler and event-handler capabilities.
//!
//! A [`MsgHandler`] follows one request through its whole life: it is
//! notified just before its message is framed onto a socket, when the write
//! completes (or fails), and — once the matching response has been
//! reconstructed — it is dispatched on the job manager, off the I/O thread.
//! Handlers for streamed responses additionally expose [`PartialAware`] so
//! each arriving chunk can lower their timeout fence.

use std::ops::BitOr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::{Result, XrdError};
use crate::message::Message;

// ---------------------------------------------------------------------------
// MsgAction
// ---------------------------------------------------------------------------

/// Bit mask a handler (or the incoming queue) returns to steer how the
/// socket layer treats the in-flight response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgAction(pub u16);

impl MsgAction {
    // ---
    pub const NONE: MsgAction = MsgAction(0);

    /// Do not run the processing callback for this response.
    pub const NO_PROCESS: MsgAction = MsgAction(1 << 0);

    /// Drop the response entirely.
    pub const IGNORE: MsgAction = MsgAction(1 << 1);

    /// Deregister the handler from the incoming queue.
    pub const REMOVE_HANDLER: MsgAction = MsgAction(1 << 2);

    /// The handler wants the body streamed directly into its own buffer.
    pub const RAW: MsgAction = MsgAction(1 << 3);

    /// The frame failed integrity checks.
    pub const CORRUPTED: MsgAction = MsgAction(1 << 4);

    /// More of the body is still expected on the wire.
    pub const MORE: MsgAction = MsgAction(1 << 5);

    // ---

    pub fn contains(self, other: MsgAction) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: MsgAction) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for MsgAction {
    type Output = MsgAction;

    fn bitor(self, rhs: MsgAction) -> MsgAction {
        MsgAction(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// MsgHandler
// ---------------------------------------------------------------------------

/// Per-request callback surface.
///
/// `on_status_ready` is the single completion point for the *send* half:
/// exactly one of `Ok` (bytes hit the wire) or an error (the request was
/// drained from a queue on stream loss or expiry) is delivered for every
/// message handed to a stream.
pub trait MsgHandler: Send + Sync {
    // ---
    /// The message is about to be framed onto a socket.
    fn on_ready_to_send(&self, msg: &Message) {
        let _ = msg;
    }

    /// Send-side completion: `Ok` after a successful write, an error when
    /// the request was failed without ever being written (or rescued and
    /// then failed).
    fn on_status_ready(&self, msg: &Message, status: Result<()>);

    /// Response dispatch, invoked on the job manager.
    fn on_message(&self, msg: Arc<Message>);

    /// Refine handling of a `kXR_status` response.  The returned bits are
    /// OR-ed into the in-flight slot's action mask.
    fn inspect_status_rsp(&self) -> MsgAction {
        MsgAction::NONE
    }

    /// Capability probe: handlers for streamed responses return themselves.
    fn as_partial_aware(&self) -> Option<&dyn PartialAware> {
        None
    }
}

// ---

/// Implemented by handlers that can receive a response in chunks.  Each
/// partial drops the per-chunk timeout fence so silence between chunks,
/// not total transfer time, drives expiry.
pub trait PartialAware {
    fn partial_received(&self);
}

// ---------------------------------------------------------------------------
// IncomingQueue
// ---------------------------------------------------------------------------

/// What the incoming queue hands back when a reconstructed header matches
/// a registered request.
pub struct InstalledHandler {
    // ---
    pub handler: Arc<dyn MsgHandler>,
    pub expires: SystemTime,
    pub action: MsgAction,
}

// ---

/// Stream-level events reported to every handler still registered with the
/// incoming queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// The session was lost; stateful requests cannot be replayed.
    Broken,
    /// The stream gave up; nothing will be retried.
    FatalError,
}

// ---

/// Registry of handlers awaiting responses.  Shared, thread-safe, supplied
/// by the owning channel.
pub trait IncomingQueue: Send + Sync {
    // ---
    /// Register a handler for its response.  Returns `true` when a leftover
    /// registration for the same request had to be displaced.
    fn add_message_handler(&self, handler: Arc<dyn MsgHandler>) -> bool;

    /// Put a handler back after its substream failed mid-flight, keeping
    /// its original expiry.
    fn re_add_message_handler(&self, handler: Arc<dyn MsgHandler>, expires: SystemTime);

    fn remove_message_handler(&self, handler: &Arc<dyn MsgHandler>);

    /// Match a reconstructed header to a registered handler.
    fn handler_for_message(&self, msg: &Message) -> Option<InstalledHandler>;

    /// Make sure the handler has an expiration time now that its request
    /// is on the wire.
    fn assign_timeout(&self, handler: &Arc<dyn MsgHandler>);

    /// Fail every handler whose deadline has passed.
    fn report_timeout(&self, now: SystemTime);

    /// Deliver a stream-level event to every registered handler.
    fn report_stream_event(&self, event: StreamEvent, status: XrdError);
}

// ---------------------------------------------------------------------------
// ChannelEventHandler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    StreamBroken,
    FatalError,
}

// ---

/// Channel-level observer of stream health.  Returning `true` unregisters
/// the handler after the event is delivered.
pub trait ChannelEventHandler: Send + Sync {
    fn on_stream_event(&self, event: ChannelEvent, status: &XrdError) -> bool;
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectInfo {
    // ---
    pub server: String,
    pub started: SystemTime,
    pub done: SystemTime,
    /// Number of substreams established for the session.
    pub streams: usize,
    /// Authentication mechanism in use, empty when none.
    pub auth: String,
}

#[derive(Debug, Clone)]
pub struct DisconnectInfo {
    // ---
    pub server: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connected_for: Duration,
    /// `None` for an orderly teardown.
    pub status: Option<XrdError>,
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Connect(ConnectInfo),
    Disconnect(DisconnectInfo),
}

// ---

/// Optional monitoring hook.
pub trait Monitor: Send + Sync {
    fn event(&self, event: MonitorEvent);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
