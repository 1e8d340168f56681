//! The transport capability — protocol brain of a channel.
//!
//! The stream core moves bytes and owns the connect/retry state machine;
//! everything protocol-specific (how many substreams a server grants, which
//! substream a request should travel on, what a received frame means for
//! the stream) is delegated to the [`TransportHandler`] the channel
//! injects.  One transport instance serves one channel and owns whatever
//! per-channel state the protocol needs.

use std::ops::BitOr;
use std::time::Duration;

use crate::error::Result;
use crate::message::Message;
use crate::url::XrdUrl;

// ---------------------------------------------------------------------------
// PathId
// ---------------------------------------------------------------------------

/// A send/receive lane pair: `up` is the substream the request goes out
/// on, `down` the substream its response is expected to arrive on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathId {
    // ---
    pub up: u16,
    pub down: u16,
}

// ---

impl PathId {
    // ---
    pub fn new(up: u16, down: u16) -> Self {
        Self { up, down }
    }

    /// The session substream, used whenever a picked path is not viable.
    pub fn main() -> Self {
        Self { up: 0, down: 0 }
    }
}

// ---------------------------------------------------------------------------
// TransportAction
// ---------------------------------------------------------------------------

/// What the transport wants done with a freshly reconstructed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportAction(pub u16);

impl TransportAction {
    // ---
    pub const NONE: TransportAction = TransportAction(0);

    /// The transport consumed the message; do not dispatch it.
    pub const DIGEST_MSG: TransportAction = TransportAction(1 << 0);

    /// Issue a close for the file handle embedded in the response body.
    pub const REQUEST_CLOSE: TransportAction = TransportAction(1 << 1);

    // ---

    pub fn contains(self, other: TransportAction) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TransportAction {
    type Output = TransportAction;

    fn bitor(self, rhs: TransportAction) -> TransportAction {
        TransportAction(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// TransportQuery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportQuery {
    /// Authentication mechanism in use, for monitoring.
    Auth,
}

// ---------------------------------------------------------------------------
// TransportHandler
// ---------------------------------------------------------------------------

pub trait TransportHandler: Send + Sync {
    // ---
    /// Pick (or, when `hint` carries the stream's earlier pick, finalize)
    /// the path a message travels on.
    fn multiplex_substream(&self, msg: &Message, hint: Option<PathId>) -> PathId;

    /// Inspect a reconstructed response before dispatch.
    fn message_received(&self, msg: &Message, substream: u16) -> TransportAction;

    /// A message has been written out.
    fn message_sent(&self, msg: &Message, substream: u16, bytes: u32);

    /// How many substreams this channel should run.  Consulted on every
    /// substream-0 connect.
    fn substream_count(&self) -> u16;

    /// Local bind preference for an extra substream.
    fn bind_preference(&self, url: &XrdUrl) -> XrdUrl;

    // ---

    /// Whether an idle stream has outlived its usefulness and should be
    /// self-disposed.
    fn is_stream_ttl_elapsed(&self, idle: Duration) -> bool;

    /// Whether the stream should be treated as broken after `idle` of
    /// silence.  `Ok` means keep waiting.
    fn is_stream_broken(&self, idle: Duration) -> Result<()>;

    fn query(&self, query: TransportQuery) -> Option<String>;
}
