//! Ready-made response frames for driving the dispatch path.

use bytes::Bytes;

use xrd_domain::{proto, Message};

// ---------------------------------------------------------------------------
// Frame builders
// ---------------------------------------------------------------------------

/// A server response frame with the given header status and body.
pub fn response_frame(status: u16, body: &[u8]) -> Message {
    // ---
    let mut buf = vec![0u8; proto::BODY_OFFSET];
    buf[proto::STATUS_OFFSET..proto::STATUS_OFFSET + 2].copy_from_slice(&status.to_be_bytes());
    buf[proto::DLEN_OFFSET..proto::DLEN_OFFSET + 4]
        .copy_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);

    Message::new(Bytes::from(buf), format!("response status {status}"))
}

// ---

/// Final `kXR_ok` response carrying a four-byte handle-sized body, enough
/// for the request-close path to chew on.
pub fn ok_frame() -> Message {
    response_frame(proto::KXR_OK, &[0, 0, 0, 1])
}

/// One chunk of a streamed reply.
pub fn oksofar_frame() -> Message {
    response_frame(proto::KXR_OKSOFAR, &[])
}

/// A `kXR_status` response with the given body-level response type.
pub fn status_frame(resptype: u8) -> Message {
    // ---
    // Body: crc32c(4) + stream id(2) + resptype(1) + reserved(1).
    let body = [0, 0, 0, 0, 0, 0, resptype, 0];
    response_frame(proto::KXR_STATUS, &body)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
