//! [`Message`] — an opaque request or response payload with a session tag.
//!
//! The stream core never decodes message bodies; framing and the full wire
//! codec belong to the transport.  What lives here is the minimal response
//! vocabulary the dispatch path needs: enough of the server response header
//! to classify a reply as partial or final, and enough of the body to pull
//! out the file handle when the transport asks for a synthetic close.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{ErrorKind, Result, XrdError};

// ---------------------------------------------------------------------------
// Wire vocabulary
// ---------------------------------------------------------------------------

/// Server response header layout and the status codes the dispatch path
/// has to recognise.  This is classification vocabulary, not a codec.
pub mod proto {
    // ---
    /// Offset of the big-endian `status` field in a server response header.
    pub const STATUS_OFFSET: usize = 2;

    /// Offset of the big-endian `dlen` field in a server response header.
    pub const DLEN_OFFSET: usize = 4;

    /// Server response body starts here.
    pub const BODY_OFFSET: usize = 8;

    /// Offset of the response-type byte inside a `kXR_status` body
    /// (header, then crc32c and stream id).
    pub const RESPTYPE_OFFSET: usize = 14;

    // ---

    pub const KXR_OK: u16 = 0;
    pub const KXR_OKSOFAR: u16 = 4000;
    pub const KXR_ERROR: u16 = 4003;
    pub const KXR_STATUS: u16 = 4007;

    /// Request id of the close request issued when the transport asks the
    /// stream to close a file handle embedded in a response.
    pub const KXR_CLOSE: u16 = 3003;

    // --- kXR_status body response types ---
    pub const FINAL_RESULT: u8 = 0;
    pub const PARTIAL_RESULT: u8 = 1;
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// An opaque payload travelling through a stream.
///
/// The session tag is mutable through a shared reference: responses are
/// stamped with the receiving stream's session epoch on arrival, and
/// requests carry the epoch the upper layer bound them to.  A tag of zero
/// means "not bound to any session" — such messages are freely replayable.
#[derive(Debug)]
pub struct Message {
    // ---
    /// Log identity.  Stable for the lifetime of the message.
    id: Uuid,

    payload: Bytes,

    /// Session epoch, 0 = untagged.
    session_id: AtomicU64,

    /// Human description for logs, e.g. `"open /data/run042.root"`.
    description: String,
}

// ---

impl Message {
    // ---

    pub fn new(payload: Bytes, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            session_id: AtomicU64::new(0),
            description: description.into(),
        }
    }

    // ---

    /// Build the synthetic close request for a server-side file handle.
    ///
    /// Layout: `streamid[2] | requestid:u16be | fhandle[4] | reserved[12] |
    /// dlen:u32be` — 24 bytes, no body.
    pub fn close_request(fhandle: [u8; 4]) -> Self {
        // ---
        let mut buf = [0u8; 24];
        buf[2..4].copy_from_slice(&proto::KXR_CLOSE.to_be_bytes());
        buf[4..8].copy_from_slice(&fhandle);

        Self::new(Bytes::copy_from_slice(&buf), "close file handle")
    }

    // ---

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    // ---

    /// Session epoch this message is bound to, 0 if untagged.
    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::Acquire)
    }

    pub fn set_session_id(&self, session: u64) {
        self.session_id.store(session, Ordering::Release);
    }

    // ---

    /// The `status` field of the server response header, if the payload is
    /// long enough to carry one.
    pub fn response_status(&self) -> Option<u16> {
        // ---
        let raw = self.payload.get(proto::STATUS_OFFSET..proto::STATUS_OFFSET + 2)?;
        Some(u16::from_be_bytes([raw[0], raw[1]]))
    }

    /// The response-type byte of a `kXR_status` body.
    pub fn status_resptype(&self) -> Option<u8> {
        self.payload.get(proto::RESPTYPE_OFFSET).copied()
    }

    // ---

    /// The server-side file handle carried in the first four body bytes.
    ///
    /// Fails with `InvalidMessage` when the declared body is shorter than
    /// a handle.
    pub fn file_handle(&self) -> Result<[u8; 4]> {
        // ---
        let dlen = self
            .payload
            .get(proto::DLEN_OFFSET..proto::DLEN_OFFSET + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| XrdError::new(ErrorKind::InvalidMessage))?;

        let body = self
            .payload
            .get(proto::BODY_OFFSET..proto::BODY_OFFSET + 4)
            .ok_or_else(|| XrdError::new(ErrorKind::InvalidMessage))?;

        if dlen < 4 {
            return Err(XrdError::new(ErrorKind::InvalidMessage));
        }

        Ok([body[0], body[1], body[2], body[3]])
    }
}

// ---------------------------------------------------------------------------
// Partial-response recognition
// ---------------------------------------------------------------------------

/// A response is partial iff its header status is `kXR_oksofar`, or — for
/// `kXR_status` framing — its body-level response type is a partial result.
/// Partial responses keep the handler registered so subsequent chunks can
/// find it.
pub fn is_partial(msg: &Message) -> bool {
    // ---
    match msg.response_status() {
        Some(proto::KXR_OKSOFAR) => true,
        Some(proto::KXR_STATUS) => msg.status_resptype() == Some(proto::PARTIAL_RESULT),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
