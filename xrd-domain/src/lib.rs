//! Core vocabulary for the xrd client-side connection stack.
//!
//! This crate defines the types every other crate speaks. All capabilities
//! a stream consumes (transport, sockets, queues, deferred work, time,
//! monitoring) are traits defined here; no implementations live in this
//! crate beyond trivial ones.
//!
//! # Structure
//!
//! - [`error`]     — [`XrdError`], [`ErrorKind`], [`Result<T>`] alias
//! - [`message`]   — [`Message`], partial-response classification
//! - [`url`]       — [`XrdUrl`] endpoint descriptor
//! - [`net`]       — [`AddressType`], [`Resolver`] capability
//! - [`handler`]   — [`MsgHandler`], [`IncomingQueue`], channel events, monitoring
//! - [`transport`] — [`TransportHandler`], [`PathId`]
//! - [`socket`]    — [`SocketHandler`], [`SocketFactory`], [`StreamEvents`]
//! - [`runtime`]   — [`Task`]/[`Job`] managers, [`Clock`], [`PostMaster`]

mod error;
mod handler;
mod message;
mod net;
mod runtime;
mod socket;
mod transport;
mod url;

// --- error
pub use error::{ErrorKind, Result, XrdError};

// --- message
pub use message::{is_partial, proto, Message};

// --- url
pub use url::{XrdUrl, DEFAULT_PORT};

// --- net
pub use net::{AddressType, Resolver};

// --- handler
pub use handler::{
    // ---
    ChannelEvent,
    ChannelEventHandler,
    ConnectInfo,
    DisconnectInfo,
    IncomingQueue,
    InstalledHandler,
    Monitor,
    MonitorEvent,
    MsgAction,
    MsgHandler,
    PartialAware,
    StreamEvent,
};

// --- transport
pub use transport::{PathId, TransportAction, TransportHandler, TransportQuery};

// --- socket
pub use socket::{Poller, SocketFactory, SocketHandler, SocketStatus, StreamEvents};

// --- runtime
pub use runtime::{Clock, Job, JobManager, PostMaster, SystemClock, Task, TaskManager};
