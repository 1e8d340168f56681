//! Per-endpoint connection core for the xrd client.
//!
//! One [`Stream`] owns the logical conversation with a remote data server:
//! it multiplexes traffic over one or more physical substreams, drives the
//! connect / retry / recover state machine, and marries outgoing requests
//! to their incoming responses.  Everything wire- and protocol-specific is
//! consumed as a capability from `xrd-domain`.
//!
//! # Structure
//!
//! - [`config`]    — per-stream tuning parameters and their defaults
//! - [`outqueue`]  — [`OutQueue`] of pending outbound messages
//! - [`resolver`]  — address resolution and preference ordering
//! - [`connector`] — the deferred reconnect task
//! - [`events`]    — [`ChannelHandlerList`] of channel-level observers
//! - [`runtime`]   — tokio-backed task and job managers
//! - [`stream`]    — [`Stream`] itself

mod config;
mod connector;
mod events;
mod outqueue;
mod resolver;
mod runtime;
mod stream;
mod substream;

// --- config
pub use config::{
    // ---
    StreamParams,
    DEFAULT_CONNECTION_RETRY,
    DEFAULT_CONNECTION_WINDOW,
    DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_STREAM_ERROR_WINDOW,
};

// --- outqueue
pub use outqueue::{OutQueue, QueuedMsg};

// --- resolver
pub use resolver::{collapse_auto, order_with_preference, SystemResolver};

// --- connector
pub use connector::StreamConnectorTask;

// --- events
pub use events::ChannelHandlerList;

// --- runtime
pub use runtime::{TimerTaskManager, WorkerJobManager};

// --- stream
pub use stream::{Stream, StreamContext, StreamQuery};
