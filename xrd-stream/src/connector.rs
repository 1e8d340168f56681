//! Deferred reconnect trigger.

use std::sync::Arc;
use std::time::SystemTime;

use xrd_domain::{PostMaster, Task, XrdUrl};

// ---------------------------------------------------------------------------
// StreamConnectorTask
// ---------------------------------------------------------------------------

/// Registered when a connect attempt fails with time still left in the
/// window: fires at the window's end and re-enters connection
/// establishment through the post-master.  One shot.
pub struct StreamConnectorTask {
    // ---
    url: XrdUrl,
    post_master: Arc<dyn PostMaster>,
    name: String,
}

// ---

impl StreamConnectorTask {
    // ---
    pub fn new(url: XrdUrl, post_master: Arc<dyn PostMaster>) -> Self {
        let name = format!("stream connector for {}", url.host_id());
        Self {
            url,
            post_master,
            name,
        }
    }
}

// ---

impl Task for StreamConnectorTask {
    // ---
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _now: SystemTime) -> Option<SystemTime> {
        // ---
        tracing::debug!(stream = %self.url.host_id(), "reconnect window elapsed, forcing reconnect");
        self.post_master.force_reconnect(&self.url);
        None
    }
}
