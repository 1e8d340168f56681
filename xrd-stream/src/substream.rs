//! Per-substream state: one socket, one out-queue, two in-flight slots.

use std::sync::Arc;
use std::time::SystemTime;

use xrd_domain::{MsgAction, MsgHandler, SocketHandler, SocketStatus};

use crate::outqueue::{OutQueue, QueuedMsg};

// ---------------------------------------------------------------------------
// InMsgHelper
// ---------------------------------------------------------------------------

/// Slot for the response currently being reconstructed on a substream.
/// At most one inbound message is in flight per substream at any time.
pub(crate) struct InMsgHelper {
    // ---
    pub handler: Option<Arc<dyn MsgHandler>>,
    pub expires: SystemTime,
    pub action: MsgAction,
}

// ---

impl Default for InMsgHelper {
    fn default() -> Self {
        Self {
            handler: None,
            expires: SystemTime::UNIX_EPOCH,
            action: MsgAction::NONE,
        }
    }
}

// ---

impl InMsgHelper {
    // ---
    /// Clear the slot, handing back whatever was in flight.
    pub fn reset(&mut self) -> Option<(Arc<dyn MsgHandler>, SystemTime, MsgAction)> {
        // ---
        let handler = self.handler.take()?;
        let expires = std::mem::replace(&mut self.expires, SystemTime::UNIX_EPOCH);
        let action = std::mem::take(&mut self.action);
        Some((handler, expires, action))
    }
}

// ---------------------------------------------------------------------------
// SubStream
// ---------------------------------------------------------------------------

/// One physical connection within a logical stream.
///
/// Substream 0 is privileged: its connect event allocates the others and
/// bumps the session epoch; its loss invalidates the session.
pub(crate) struct SubStream {
    // ---
    pub socket: Box<dyn SocketHandler>,

    pub out_queue: OutQueue,

    /// The outbound message currently handed to the socket for framing.
    /// At most one; rescued back onto the queue front on socket error.
    pub out_helper: Option<QueuedMsg>,

    pub in_helper: InMsgHelper,

    pub status: SocketStatus,
}

// ---

impl SubStream {
    // ---
    pub fn new(socket: Box<dyn SocketHandler>) -> Self {
        Self {
            socket,
            out_queue: OutQueue::new(),
            out_helper: None,
            in_helper: InMsgHelper::default(),
            status: SocketStatus::Disconnected,
        }
    }
}
