//! Socket capabilities and the callback surface a stream exposes to them.
//!
//! A stream owns one [`SocketHandler`] per substream, exclusively.  The
//! socket delivers every readiness and lifecycle event back through
//! [`StreamEvents`] — a non-owning `Weak` handle, so a stream being torn
//! down while a socket callback is still in flight upgrades to `None`
//! rather than touching freed state.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use crate::error::{Result, XrdError};
use crate::handler::{MsgAction, MsgHandler};
use crate::message::Message;
use crate::url::XrdUrl;

// ---------------------------------------------------------------------------
// SocketStatus
// ---------------------------------------------------------------------------

/// Per-attempt connection state.  Monotonic within one attempt; any error
/// resets to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketStatus {
    // ---
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

// ---------------------------------------------------------------------------
// SocketHandler
// ---------------------------------------------------------------------------

/// One non-blocking socket plus its framing machinery.
///
/// `connect` only initiates: completion is delivered later through
/// [`StreamEvents::on_connect`] / [`StreamEvents::on_connect_error`].
/// Implementations are driven by the poller and must tolerate calls from
/// the stream while their own callbacks are pending.
pub trait SocketHandler: Send + Sync {
    // ---
    fn set_address(&self, addr: SocketAddr);

    fn address(&self) -> Option<SocketAddr>;

    /// Begin a non-blocking connect with the given time budget.
    fn connect(&self, window: Duration) -> Result<()>;

    fn close(&self);

    // ---

    /// Ask for write-readiness callbacks.
    fn enable_uplink(&self) -> Result<()>;

    fn disable_uplink(&self) -> Result<()>;

    // ---

    fn stream_name(&self) -> String;

    fn ip_addr(&self) -> Option<String>;

    fn ip_stack(&self) -> Option<String>;

    fn host_name(&self) -> Option<String>;

    /// When this socket last saw traffic in either direction.
    fn last_activity(&self) -> SystemTime;
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// Readiness notification service shared by every socket of a process.
/// Consumed by socket implementations, never by the stream core itself.
pub trait Poller: Send + Sync {
    // ---
    fn register(&self, name: &str);

    fn unregister(&self, name: &str);
}

// ---------------------------------------------------------------------------
// SocketFactory
// ---------------------------------------------------------------------------

/// Creates the socket handler for one substream, wiring it to the poller
/// and to the stream's callback surface.
pub trait SocketFactory: Send + Sync {
    // ---
    fn create(
        &self,
        url: &XrdUrl,
        substream: u16,
        poller: Arc<dyn Poller>,
        events: Weak<dyn StreamEvents>,
    ) -> Box<dyn SocketHandler>;
}

// ---------------------------------------------------------------------------
// StreamEvents
// ---------------------------------------------------------------------------

/// Callback surface invoked by socket handlers.
///
/// All callbacks are expected to return promptly; none performs blocking
/// I/O.  Boolean returns follow the convention "keep referring to me":
/// `false` from `on_read_timeout` means the stream disposed of itself and
/// the socket must not touch it again.
pub trait StreamEvents: Send + Sync {
    // ---
    /// A complete response has been reconstructed on `substream`.
    fn on_incoming(&self, substream: u16, msg: Arc<Message>, bytes_received: u32);

    /// The in-flight outbound message was fully written.
    fn on_message_sent(&self, substream: u16, msg: &Message, bytes_sent: u32);

    /// The socket can accept a new outbound message.  Returns the message
    /// to frame and its handler, or `None` when the queue is drained (in
    /// which case the uplink has been disabled).
    fn on_ready_to_write(&self, substream: u16) -> Option<(Arc<Message>, Arc<dyn MsgHandler>)>;

    // ---

    fn on_connect(&self, substream: u16);

    fn on_connect_error(&self, substream: u16, status: XrdError);

    /// Mid-session socket error.
    fn on_error(&self, substream: u16, status: XrdError);

    // ---

    /// Read-side silence.  Returns `false` when the stream has been
    /// disposed and must no longer be referenced.
    fn on_read_timeout(&self, substream: u16) -> bool;

    fn on_write_timeout(&self, substream: u16) -> bool;

    // ---

    /// Enough header has been parsed to locate the handler awaiting this
    /// response.  Returns the handler only when it requested raw reads, so
    /// the socket can stream the body straight into the handler's buffer.
    fn install_inc_handler(&self, msg: &Message, substream: u16) -> Option<Arc<dyn MsgHandler>>;

    /// Refine handling of a `kXR_status` response.  Returns the surviving
    /// action bits and, when raw reads were requested, the handler.
    fn inspect_status_rsp(&self, substream: u16) -> (MsgAction, Option<Arc<dyn MsgHandler>>);
}
