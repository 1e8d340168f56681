//! Deferred-work and process-context capabilities.
//!
//! All four are shared objects supplied by the owning channel; the stream
//! core never spawns threads or sleeps on its own.

use std::sync::Arc;
use std::time::SystemTime;

use crate::error::XrdError;
use crate::url::XrdUrl;

// ---------------------------------------------------------------------------
// Task / TaskManager
// ---------------------------------------------------------------------------

/// A unit of deferred work with an optional reschedule.
pub trait Task: Send + Sync {
    // ---
    /// Human name for logs.
    fn name(&self) -> &str;

    /// Run at (or after) the registered deadline.  Returning `Some(when)`
    /// re-arms the task for `when`; `None` retires it.
    fn run(&self, now: SystemTime) -> Option<SystemTime>;
}

// ---

pub trait TaskManager: Send + Sync {
    fn register_task(&self, task: Arc<dyn Task>, when: SystemTime);
}

// ---------------------------------------------------------------------------
// Job / JobManager
// ---------------------------------------------------------------------------

/// Fire-and-forget work dispatched off the I/O threads — user-visible
/// completions run here so a slow callback cannot stall a socket.
///
/// Jobs are shared: the same job may be queued repeatedly (the
/// data-substream connect job fires once per reconnect).
pub trait Job: Send + Sync {
    fn run(&self);
}

// ---

pub trait JobManager: Send + Sync {
    fn queue_job(&self, job: Arc<dyn Job>);
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for the retry and error windows.  Injected so window
/// boundaries are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

// ---

/// The wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

// ---------------------------------------------------------------------------
// PostMaster
// ---------------------------------------------------------------------------

/// Process-wide owner of channels and their streams.
///
/// The stream reaches back into it for exactly three things: self-disposal
/// on TTL elapse (`force_disconnect` unhooks the stream from its channel
/// before destruction, so no socket callback can land on freed state),
/// deferred reconnects, and the global connect / connect-error
/// notifications.
pub trait PostMaster: Send + Sync {
    // ---
    /// Tear down the stream owning `url` and its channel.  After this call
    /// returns the stream may no longer exist.
    fn force_disconnect(&self, url: &XrdUrl);

    /// Re-enter connection establishment for the stream owning `url`.
    fn force_reconnect(&self, url: &XrdUrl);

    // ---

    fn notify_connect(&self, url: &XrdUrl);

    fn notify_connect_error(&self, url: &XrdUrl, status: &XrdError);
}
