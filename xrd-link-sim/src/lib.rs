//! In-process fakes of every collaborator an xrd stream consumes, for
//! unit and integration testing.
//!
//! Nothing here opens a socket: connects succeed or fail by script, and
//! tests drive completion by calling back through the [`SimSocket`]'s
//! handle on the stream.  All fakes record what was asked of them.
//!
//! # Quick start
//!
//! ```rust,ignore
//! let net = SimNet::new();
//! let transport = Arc::new(SimTransport::new(1));
//! stream.initialize(StreamContext { socket_factory: net.clone(), .. })?;
//!
//! stream.send(msg, handler, false, expires)?;
//! net.socket(0).unwrap().complete_connect();
//! ```

mod frames;
mod handler;
mod inqueue;
mod managers;
mod socket;
mod transport;

// --- frames
pub use frames::{ok_frame, oksofar_frame, response_frame, status_frame};

// --- handler
pub use handler::RecordingHandler;

// --- inqueue
pub use inqueue::SimIncomingQueue;

// --- managers
pub use managers::{
    // ---
    InlineJobManager,
    MockClock,
    RecordingMonitor,
    RecordingPostMaster,
    RecordingTaskManager,
    StaticResolver,
};

// --- socket
pub use socket::{NullPoller, SimNet, SimSocket};

// --- transport
pub use transport::SimTransport;
