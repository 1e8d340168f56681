//! Registry of channel-level event observers.

use std::sync::{Arc, Mutex};

use xrd_domain::{ChannelEvent, ChannelEventHandler, XrdError};

// ---------------------------------------------------------------------------
// ChannelHandlerList
// ---------------------------------------------------------------------------

/// Add/remove/report over registered [`ChannelEventHandler`]s.
///
/// Guarded by its own lock, independent of the stream mutex, so events can
/// be reported after the stream lock has been released.
#[derive(Default)]
pub struct ChannelHandlerList {
    // ---
    handlers: Mutex<Vec<Arc<dyn ChannelEventHandler>>>,
}

// ---

impl ChannelHandlerList {
    // ---

    pub fn new() -> Self {
        Self::default()
    }

    // ---

    pub fn add(&self, handler: Arc<dyn ChannelEventHandler>) {
        // ---
        self.handlers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handler);
    }

    pub fn remove(&self, handler: &Arc<dyn ChannelEventHandler>) {
        // ---
        self.handlers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|h| !Arc::ptr_eq(h, handler));
    }

    // ---

    /// Deliver `event` to every handler; handlers returning `true` are
    /// unregistered afterwards.
    pub fn report(&self, event: ChannelEvent, status: &XrdError) {
        // ---
        // Snapshot so a handler may re-register from within its callback.
        let snapshot: Vec<_> = self
            .handlers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        let mut done = Vec::new();
        for handler in &snapshot {
            if handler.on_stream_event(event, status) {
                done.push(Arc::clone(handler));
            }
        }

        if !done.is_empty() {
            self.handlers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .retain(|h| !done.iter().any(|d| Arc::ptr_eq(h, d)));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::atomic::{AtomicUsize, Ordering};

    use xrd_domain::ErrorKind;

    use super::*;

    struct Counting {
        seen: AtomicUsize,
        one_shot: bool,
    }

    impl ChannelEventHandler for Counting {
        fn on_stream_event(&self, _event: ChannelEvent, _status: &XrdError) -> bool {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.one_shot
        }
    }

    #[test]
    fn one_shot_handlers_are_dropped_after_delivery() {
        // ---
        let list = ChannelHandlerList::new();
        let keeper = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            one_shot: false,
        });
        let one_shot = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            one_shot: true,
        });

        list.add(keeper.clone());
        list.add(one_shot.clone());

        let status = XrdError::new(ErrorKind::StreamBroken);
        list.report(ChannelEvent::StreamBroken, &status);
        list.report(ChannelEvent::StreamBroken, &status);

        assert_eq!(keeper.seen.load(Ordering::SeqCst), 2);
        assert_eq!(one_shot.seen.load(Ordering::SeqCst), 1);
    }
}
