//! [`OutQueue`] — FIFO of pending outbound messages.
//!
//! Every substream owns one.  Entries carry their statefulness so session
//! loss can split the backlog: stateful requests (bound to a server-side
//! handle) are drained and failed, stateless ones survive to be retried on
//! the next session.  The `grab_*` family moves entries *between* queues
//! under the stream lock; [`OutQueue::report`] is then invoked on a scratch
//! queue after the lock is released.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use xrd_domain::{Message, MsgHandler, XrdError};

// ---------------------------------------------------------------------------
// QueuedMsg
// ---------------------------------------------------------------------------

/// One pending outbound message together with everything needed to either
/// send it or fail it.
pub struct QueuedMsg {
    // ---
    pub msg: Arc<Message>,
    pub handler: Arc<dyn MsgHandler>,
    pub expires: SystemTime,
    pub stateful: bool,
}

// ---------------------------------------------------------------------------
// OutQueue
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct OutQueue {
    // ---
    entries: VecDeque<QueuedMsg>,
}

// ---

impl OutQueue {
    // ---

    pub fn new() -> Self {
        Self::default()
    }

    // ---

    pub fn push_back(
        &mut self,
        msg: Arc<Message>,
        handler: Arc<dyn MsgHandler>,
        expires: SystemTime,
        stateful: bool,
    ) {
        self.entries.push_back(QueuedMsg {
            msg,
            handler,
            expires,
            stateful,
        });
    }

    /// Re-queue at the front — used when an in-flight message has to go
    /// back after a socket error, preserving send order.
    pub fn push_front(&mut self, entry: QueuedMsg) {
        self.entries.push_front(entry);
    }

    pub fn pop_front(&mut self) -> Option<QueuedMsg> {
        self.entries.pop_front()
    }

    // ---

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn stateless_len(&self) -> usize {
        self.entries.iter().filter(|e| !e.stateful).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ---

    /// Move every entry of `other` to the back of `self`, preserving order.
    pub fn grab_items(&mut self, other: &mut OutQueue) {
        self.entries.append(&mut other.entries);
    }

    /// Move only the stateful entries of `other`, preserving their
    /// relative order.  The stateless residue stays behind in place.
    pub fn grab_stateful(&mut self, other: &mut OutQueue) {
        // ---
        let mut keep = VecDeque::with_capacity(other.entries.len());
        for entry in other.entries.drain(..) {
            if entry.stateful {
                self.entries.push_back(entry);
            } else {
                keep.push_back(entry);
            }
        }
        other.entries = keep;
    }

    /// Move the entries of `other` whose expiry is at or before `now`.
    pub fn grab_expired(&mut self, other: &mut OutQueue, now: SystemTime) {
        // ---
        let mut keep = VecDeque::with_capacity(other.entries.len());
        for entry in other.entries.drain(..) {
            if entry.expires <= now {
                self.entries.push_back(entry);
            } else {
                keep.push_back(entry);
            }
        }
        other.entries = keep;
    }

    // ---

    /// Fail every entry with `status`, draining the queue.
    ///
    /// Must be called without the stream lock held: handlers may
    /// synchronously post new requests.
    pub fn report(&mut self, status: &XrdError) {
        // ---
        for entry in self.entries.drain(..) {
            entry.handler.on_status_ready(&entry.msg, Err(status.clone()));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use xrd_domain::{ErrorKind, Result};

    use super::*;

    // ---

    /// Handler that records every completion it sees.
    struct Probe {
        statuses: Mutex<Vec<Result<()>>>,
    }

    impl Probe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(Vec::new()),
            })
        }
    }

    impl MsgHandler for Probe {
        fn on_status_ready(&self, _msg: &Message, status: Result<()>) {
            self.statuses.lock().unwrap().push(status);
        }

        fn on_message(&self, _msg: Arc<Message>) {}
    }

    // ---

    fn msg(tag: &str) -> Arc<Message> {
        Arc::new(Message::new(Bytes::new(), tag))
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn filled(probe: &Arc<Probe>) -> OutQueue {
        // ---
        let mut q = OutQueue::new();
        q.push_back(msg("a"), probe.clone(), at(10), false);
        q.push_back(msg("b"), probe.clone(), at(20), true);
        q.push_back(msg("c"), probe.clone(), at(30), false);
        q.push_back(msg("d"), probe.clone(), at(40), true);
        q
    }

    // ---

    #[test]
    fn fifo_order_and_front_requeue() {
        // ---
        let probe = Probe::new();
        let mut q = filled(&probe);

        let first = q.pop_front().unwrap();
        assert_eq!(first.msg.description(), "a");

        q.push_front(first);
        assert_eq!(q.pop_front().unwrap().msg.description(), "a");
        assert_eq!(q.pop_front().unwrap().msg.description(), "b");
    }

    #[test]
    fn stateless_len_counts_only_stateless() {
        // ---
        let probe = Probe::new();
        let q = filled(&probe);
        assert_eq!(q.len(), 4);
        assert_eq!(q.stateless_len(), 2);
    }

    #[test]
    fn grab_stateful_plus_residue_reconstructs_set() {
        // ---
        let probe = Probe::new();
        let mut q = filled(&probe);
        let mut scratch = OutQueue::new();

        scratch.grab_stateful(&mut q);
        assert_eq!(scratch.len(), 2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.stateless_len(), 2);

        // Residue order preserved.
        assert_eq!(q.pop_front().unwrap().msg.description(), "a");
        assert_eq!(q.pop_front().unwrap().msg.description(), "c");
        assert_eq!(scratch.pop_front().unwrap().msg.description(), "b");
        assert_eq!(scratch.pop_front().unwrap().msg.description(), "d");
    }

    #[test]
    fn grab_expired_honours_boundary() {
        // ---
        let probe = Probe::new();
        let mut q = filled(&probe);
        let mut scratch = OutQueue::new();

        // Expiry exactly at `now` counts as expired.
        scratch.grab_expired(&mut q, at(20));
        assert_eq!(scratch.len(), 2);
        assert_eq!(q.len(), 2);

        // Far in the past: a no-op.
        let mut none = OutQueue::new();
        none.grab_expired(&mut q, at(0));
        assert!(none.is_empty());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn report_fails_each_entry_exactly_once() {
        // ---
        let probe = Probe::new();
        let mut q = filled(&probe);

        q.report(&XrdError::new(ErrorKind::StreamBroken));
        assert!(q.is_empty());

        let statuses = probe.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 4);
        assert!(statuses
            .iter()
            .all(|s| s.as_ref().err().map(XrdError::kind) == Some(ErrorKind::StreamBroken)));
    }
}
