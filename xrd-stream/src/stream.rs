//! [`Stream`] — one logical conversation with a remote data server.
//!
//! A stream multiplexes its traffic over one or more physical substreams.
//! Substream 0 is the session anchor: its connect event bumps the session
//! epoch and spawns the data-plane siblings; its loss invalidates every
//! stateful request in flight.  The stream owns the connect / retry /
//! recover state machine and marries outgoing requests to their incoming
//! responses; everything protocol- and wire-specific is delegated to the
//! capabilities injected at [`Stream::initialize`].
//!
//! # Locking
//!
//! A single mutex guards all mutable state.  The rule, enforced
//! structurally below: the lock is **released before any handler callout**
//! (`on_ready_to_send`, `on_status_ready`, queue reports, incoming-queue
//! stream events).  Error paths that end in a drain receive the guard *by
//! value* and drop it at the visible handoff point.  The transport, the
//! monitor and the post-master may be called with the lock held — they are
//! prompt, thread-safe collaborators that must not re-enter the stream on
//! the calling thread.
//!
//! # Ownership
//!
//! The stream owns its sockets; each socket holds a `Weak` handle onto the
//! stream's callback surface.  TTL self-disposal therefore routes through
//! the post-master's `force_disconnect`, which unhooks the stream from its
//! channel before dropping it — a socket callback racing the teardown
//! upgrades its `Weak` to `None` instead of touching freed state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::SystemTime;

use xrd_domain::{
    // ---
    is_partial,
    ChannelEvent,
    ChannelEventHandler,
    Clock,
    ConnectInfo,
    DisconnectInfo,
    ErrorKind,
    IncomingQueue,
    Job,
    JobManager,
    Message,
    Monitor,
    MonitorEvent,
    MsgAction,
    MsgHandler,
    PathId,
    Poller,
    PostMaster,
    Resolver,
    Result,
    SocketFactory,
    SocketStatus,
    StreamEvent,
    StreamEvents,
    TaskManager,
    TransportAction,
    TransportHandler,
    TransportQuery,
    XrdError,
    XrdUrl,
};

use crate::config::{StreamParams, DEFAULT_REQUEST_TIMEOUT};
use crate::connector::StreamConnectorTask;
use crate::events::ChannelHandlerList;
use crate::outqueue::OutQueue;
use crate::resolver::{collapse_auto, order_with_preference};
use crate::substream::SubStream;

// ---------------------------------------------------------------------------
// Session epoch generator
// ---------------------------------------------------------------------------

/// Process-wide: no two connected epochs, on any stream, share a value.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// StreamQuery
// ---------------------------------------------------------------------------

/// Introspection keys answered from substream 0's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamQuery {
    IpAddr,
    IpStack,
    HostName,
}

// ---------------------------------------------------------------------------
// StreamContext
// ---------------------------------------------------------------------------

/// Every capability a stream consumes, injected once at
/// [`Stream::initialize`].  All are shared objects supplied by the owning
/// channel.
pub struct StreamContext {
    // ---
    pub transport: Arc<dyn TransportHandler>,
    pub poller: Arc<dyn Poller>,
    pub task_manager: Arc<dyn TaskManager>,
    pub job_manager: Arc<dyn JobManager>,
    pub incoming_queue: Arc<dyn IncomingQueue>,
    pub post_master: Arc<dyn PostMaster>,
    pub socket_factory: Arc<dyn SocketFactory>,
    pub resolver: Arc<dyn Resolver>,
    pub clock: Arc<dyn Clock>,
    pub monitor: Option<Arc<dyn Monitor>>,
}

// ---------------------------------------------------------------------------
// StreamState
// ---------------------------------------------------------------------------

struct StreamState {
    // ---
    substreams: Vec<SubStream>,

    /// Resolved addresses, consumed back to front (preferred last).
    addresses: Vec<SocketAddr>,

    /// Connect attempts within the current window.
    connection_count: u32,

    /// When the last fatal failure armed the error window.
    last_stream_error: Option<SystemTime>,
    last_fatal_error: Option<XrdError>,

    connection_init_time: Option<SystemTime>,
    connection_started: Option<SystemTime>,
    connection_done: Option<SystemTime>,

    /// Current session epoch; 0 until the first connect.
    session_id: u64,

    bytes_sent: u64,
    bytes_received: u64,

    /// Queued on every data-substream connect, if registered.
    data_conn_job: Option<Arc<dyn Job>>,
}

// ---

impl StreamState {
    fn new() -> Self {
        Self {
            substreams: Vec::new(),
            addresses: Vec::new(),
            connection_count: 0,
            last_stream_error: None,
            last_fatal_error: None,
            connection_init_time: None,
            connection_started: None,
            connection_done: None,
            session_id: 0,
            bytes_sent: 0,
            bytes_received: 0,
            data_conn_job: None,
        }
    }
}

// ---------------------------------------------------------------------------
// HandleIncMsgJob
// ---------------------------------------------------------------------------

/// Dispatches a completed response to its handler off the I/O thread.
struct HandleIncMsgJob {
    // ---
    handler: Arc<dyn MsgHandler>,
    msg: Arc<Message>,
}

impl Job for HandleIncMsgJob {
    fn run(&self) {
        self.handler.on_message(Arc::clone(&self.msg));
    }
}

// ---

/// Swallows the completion of internally generated requests.
struct DiscardHandler;

impl MsgHandler for DiscardHandler {
    fn on_status_ready(&self, _msg: &Message, _status: Result<()>) {}

    fn on_message(&self, _msg: Arc<Message>) {}
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

pub struct Stream {
    // ---
    url: XrdUrl,
    prefer: Option<XrdUrl>,

    /// `host:port`, used in every log line.
    stream_name: String,

    params: StreamParams,

    ctx: OnceLock<StreamContext>,

    /// Set at `initialize`; handed to sockets as their callback target.
    self_ref: OnceLock<Weak<Stream>>,

    state: Mutex<StreamState>,

    ev_handlers: ChannelHandlerList,
}

// ---------------------------------------------------------------------------
// Construction and lifecycle
// ---------------------------------------------------------------------------

impl Stream {
    // ---

    /// Build an unconnected stream for `url`.  An optional `prefer`
    /// endpoint re-orders the resolved address list so its addresses are
    /// attempted first.
    pub fn new(url: XrdUrl, prefer: Option<XrdUrl>) -> Self {
        // ---
        let mut params = StreamParams::from_url(&url);
        params.address_type = collapse_auto(params.address_type);

        let stream_name = url.host_id();
        tracing::debug!(
            stream = %stream_name,
            address_type = ?params.address_type,
            connection_window = params.connection_window.as_secs(),
            connection_retry = params.connection_retry,
            stream_error_window = params.stream_error_window.as_secs(),
            "stream parameters"
        );

        Self {
            url,
            prefer,
            stream_name,
            params,
            ctx: OnceLock::new(),
            self_ref: OnceLock::new(),
            state: Mutex::new(StreamState::new()),
            ev_handlers: ChannelHandlerList::new(),
        }
    }

    // ---

    /// Attach the channel's capabilities and create substream 0, still
    /// `Disconnected`.  Must be called exactly once before any traffic.
    pub fn initialize(self: &Arc<Self>, ctx: StreamContext) -> Result<()> {
        // ---
        if self.ctx.get().is_some() {
            return Err(XrdError::new(ErrorKind::LocalError));
        }

        self.self_ref.set(Arc::downgrade(self)).ok();

        let socket = ctx.socket_factory.create(
            &self.url,
            0,
            Arc::clone(&ctx.poller),
            self.events_ref(),
        );

        self.ctx.set(ctx).map_err(|_| XrdError::new(ErrorKind::LocalError))?;
        self.state_lock().substreams.push(SubStream::new(socket));
        Ok(())
    }

    // ---

    pub fn url(&self) -> &XrdUrl {
        &self.url
    }

    /// Close every substream.  Queued messages stay queued.
    pub fn disconnect(&self) {
        // ---
        let mut state = self.state_lock();
        for ss in state.substreams.iter_mut() {
            ss.socket.close();
            ss.status = SocketStatus::Disconnected;
        }
    }

    // ---

    pub fn register_event_handler(&self, handler: Arc<dyn ChannelEventHandler>) {
        self.ev_handlers.add(handler);
    }

    pub fn remove_event_handler(&self, handler: &Arc<dyn ChannelEventHandler>) {
        self.ev_handlers.remove(handler);
    }

    /// Register the job queued on every data-substream connect.
    pub fn set_data_connect_job(&self, job: Arc<dyn Job>) {
        self.state_lock().data_conn_job = Some(job);
    }

    // ---

    fn ctx(&self) -> Result<&StreamContext> {
        self.ctx.get().ok_or_else(|| XrdError::new(ErrorKind::Uninitialized))
    }

    fn state_lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn events_ref(&self) -> Weak<dyn StreamEvents> {
        // ---
        match self.self_ref.get() {
            Some(weak) => weak.clone(),
            None => Weak::<Stream>::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Link establishment
// ---------------------------------------------------------------------------

impl Stream {
    // ---

    /// Make sure a path exists for outgoing traffic, initiating a connect
    /// when substream 0 is down.
    ///
    /// Within the error window this returns the recorded fatal error
    /// unchanged, with no socket activity.
    fn enable_link(
        &self,
        ctx: &StreamContext,
        state: &mut StreamState,
        path: &mut PathId,
    ) -> Result<()> {
        // ---
        if path.up as usize >= state.substreams.len() {
            path.up = 0;
        }
        if path.down as usize >= state.substreams.len() {
            path.down = 0;
        }

        // A connect is already in flight; when it lands, the main stream
        // will bring up everything else.
        if state.substreams[0].status == SocketStatus::Connecting {
            return Ok(());
        }

        // Main stream is up: verify the picked lanes, falling back to 0
        // for any substream that is not ready.
        if state.substreams[0].status == SocketStatus::Connected {
            if state.substreams[path.down as usize].status != SocketStatus::Connected {
                path.down = 0;
            }

            return match state.substreams[path.up as usize].status {
                SocketStatus::Disconnected => {
                    path.up = 0;
                    state.substreams[0].socket.enable_uplink()
                }
                SocketStatus::Connected => state.substreams[path.up as usize].socket.enable_uplink(),
                SocketStatus::Connecting => Ok(()),
            };
        }

        // Main stream is down.  Honour the error window before touching
        // any socket.
        let now = ctx.clock.now();
        if let (Some(last), Some(fatal)) = (state.last_stream_error, &state.last_fatal_error) {
            let since = now.duration_since(last).unwrap_or_default();
            if since < self.params.stream_error_window {
                return Err(fatal.clone());
            }
        }

        state.connection_started = Some(now);
        state.connection_count += 1;

        // Resolve the endpoint, honouring the preferred host if one is
        // configured and resolvable.
        let primary = match ctx.resolver.resolve(&self.url, self.params.address_type) {
            Ok(addrs) => addrs,
            Err(err) => {
                tracing::error!(stream = %self.stream_name, "unable to resolve address for the host");
                let fatal = err.into_fatal();
                state.last_stream_error = Some(now);
                state.last_fatal_error = Some(fatal.clone());
                return Err(fatal);
            }
        };

        state.addresses = match &self.prefer {
            Some(prefer) => match ctx.resolver.resolve(prefer, self.params.address_type) {
                Ok(preferred) => order_with_preference(primary, &preferred),
                Err(_) => {
                    tracing::error!(
                        stream = %self.stream_name,
                        prefer = %prefer.host_id(),
                        "unable to resolve address for the preferred host"
                    );
                    primary
                }
            },
            None => primary,
        };

        tracing::debug!(
            stream = %self.stream_name,
            addresses = ?state.addresses,
            "resolved addresses"
        );

        // Try the work-list back to front until a connect gets going.
        let mut last = Ok(());
        while let Some(addr) = state.addresses.pop() {
            state.substreams[0].socket.set_address(addr);
            state.connection_init_time = Some(ctx.clock.now());
            match state.substreams[0].socket.connect(self.params.connection_window) {
                Ok(()) => {
                    state.substreams[0].status = SocketStatus::Connecting;
                    return Ok(());
                }
                Err(err) => last = Err(err),
            }
        }
        last
    }

    // ---

    /// Abort a connect attempt in progress and start over with a fresh
    /// resolution.
    ///
    /// Known hazard: the status flip below races a concurrent `on_connect`
    /// delivered for the aborted attempt; both paths serialize on the
    /// stream mutex, but their order is otherwise unconstrained.
    pub fn force_connect(&self) {
        // ---
        let Ok(ctx) = self.ctx() else { return };
        let mut guard = self.state_lock();

        if guard.substreams[0].status != SocketStatus::Connecting {
            return;
        }
        guard.substreams[0].status = SocketStatus::Disconnected;

        let mut path = PathId::main();
        if let Err(err) = self.enable_link(ctx, &mut guard, &mut path) {
            self.handle_connect_error(ctx, guard, 0, err);
        }
    }
}

// ---------------------------------------------------------------------------
// Sending
// ---------------------------------------------------------------------------

impl Stream {
    // ---

    /// Queue a message for sending.  Never blocks on I/O: the message is
    /// enqueued on the chosen substream and write-readiness is armed
    /// lazily.
    ///
    /// Fails synchronously only for enqueue-time problems: a stale session
    /// tag, resolution failure, or an exhausted retry budget.  Everything
    /// after enqueue is reported through the handler.
    pub fn send(
        &self,
        msg: Arc<Message>,
        handler: Arc<dyn MsgHandler>,
        stateful: bool,
        expires: SystemTime,
    ) -> Result<()> {
        // ---
        let ctx = self.ctx()?;
        let mut state = self.state_lock();

        // Bounce requests bound to a session this stream no longer runs.
        if msg.session_id() != 0
            && (state.substreams[0].status != SocketStatus::Connected
                || state.session_id != msg.session_id())
        {
            return Err(XrdError::new(ErrorKind::InvalidSession));
        }

        let mut path = ctx.transport.multiplex_substream(&msg, None);
        if path.up as usize >= state.substreams.len() {
            tracing::warn!(
                stream = %self.stream_name,
                msg = %msg.description(),
                substream = path.up,
                "unable to send through requested substream, using 0 instead"
            );
            path.up = 0;
        }

        tracing::trace!(
            stream = %self.stream_name,
            msg = %msg.description(),
            id = %msg.id(),
            up = path.up,
            down = path.down,
            "queueing message"
        );

        match self.enable_link(ctx, &mut state, &mut path) {
            Ok(()) => {
                // Let the transport finalize the choice now that the link
                // state is known.
                let path = ctx.transport.multiplex_substream(&msg, Some(path));
                let up = path.up as usize;
                let up = if up < state.substreams.len() { up } else { 0 };
                state.substreams[up]
                    .out_queue
                    .push_back(msg, handler, expires, stateful);
                Ok(())
            }
            Err(err) => Err(err.into_fatal()),
        }
    }

    // ---

    /// Issue the synthetic close for the file handle embedded in a
    /// response the transport refused to deliver.
    fn request_close(&self, rsp: &Message) -> Result<()> {
        // ---
        let ctx = self.ctx()?;
        let fhandle = rsp.file_handle()?;

        let msg = Arc::new(Message::close_request(fhandle));
        msg.set_session_id(self.state_lock().session_id);

        let expires = ctx.clock.now() + DEFAULT_REQUEST_TIMEOUT;
        self.send(msg, Arc::new(DiscardHandler), true, expires)
    }
}

// ---------------------------------------------------------------------------
// Socket callbacks — write path
// ---------------------------------------------------------------------------

impl Stream {
    // ---

    /// The socket can take a new message.  Pops the queue head into the
    /// in-flight slot and registers its handler for the response.
    pub fn on_ready_to_write(
        &self,
        substream: u16,
    ) -> Option<(Arc<Message>, Arc<dyn MsgHandler>)> {
        // ---
        let ctx = self.ctx().ok()?;
        let mut state = self.state_lock();
        let ss = state.substreams.get_mut(substream as usize)?;

        if ss.out_queue.is_empty() {
            tracing::trace!(stream = %self.stream_name, substream, "nothing to write, disable uplink");
            let _ = ss.socket.disable_uplink();
            return None;
        }

        let entry = ss.out_queue.pop_front()?;
        let msg = Arc::clone(&entry.msg);
        let handler = Arc::clone(&entry.handler);
        ss.out_helper = Some(entry);

        tracing::debug!(
            stream = %self.stream_name,
            substream,
            msg = %msg.description(),
            "moving handler from out-queue to in-queue, starting to send"
        );

        drop(state);

        if ctx.incoming_queue.add_message_handler(Arc::clone(&handler)) {
            tracing::warn!(stream = %self.stream_name, "removed a leftover handler from the in-queue");
        }
        handler.on_ready_to_send(&msg);

        Some((msg, handler))
    }

    // ---

    /// Disable the uplink when the queue is drained.
    pub fn disable_if_empty(&self, substream: u16) {
        // ---
        let mut state = self.state_lock();
        let Some(ss) = state.substreams.get_mut(substream as usize) else {
            return;
        };

        if ss.out_queue.is_empty() {
            tracing::trace!(stream = %self.stream_name, substream, "all messages consumed, disable uplink");
            let _ = ss.socket.disable_uplink();
        }
    }

    // ---

    /// The in-flight message was fully written out.
    pub fn on_message_sent(&self, substream: u16, msg: &Message, bytes_sent: u32) {
        // ---
        let Ok(ctx) = self.ctx() else { return };

        let entry = {
            let mut state = self.state_lock();
            ctx.transport.message_sent(msg, substream, bytes_sent);
            state.bytes_sent += u64::from(bytes_sent);
            state
                .substreams
                .get_mut(substream as usize)
                .and_then(|ss| ss.out_helper.take())
        };

        // Slot already cleared: a completion delivered after this point
        // (success here, or a drain elsewhere) can only happen once.
        if let Some(entry) = entry {
            ctx.incoming_queue.assign_timeout(&entry.handler);
            entry.handler.on_status_ready(&entry.msg, Ok(()));
        }
    }
}

// ---------------------------------------------------------------------------
// Socket callbacks — read path
// ---------------------------------------------------------------------------

impl Stream {
    // ---

    /// Enough header has been parsed to locate the handler awaiting this
    /// response.  Returns the handler only when it asked for raw reads.
    pub fn install_inc_handler(&self, msg: &Message, substream: u16) -> Option<Arc<dyn MsgHandler>> {
        // ---
        let ctx = self.ctx().ok()?;
        let mut state = self.state_lock();
        let ih = &mut state.substreams.get_mut(substream as usize)?.in_helper;

        if ih.handler.is_none() {
            if let Some(installed) = ctx.incoming_queue.handler_for_message(msg) {
                ih.handler = Some(installed.handler);
                ih.expires = installed.expires;
                ih.action = installed.action;
            }
        }

        let handler = ih.handler.as_ref()?;
        ih.action.contains(MsgAction::RAW).then(|| Arc::clone(handler))
    }

    // ---

    /// A `kXR_status` response needs the handler's own judgement before
    /// the body can be read out.
    pub fn inspect_status_rsp(&self, substream: u16) -> (MsgAction, Option<Arc<dyn MsgHandler>>) {
        // ---
        let Ok(ctx) = self.ctx() else {
            return (MsgAction::REMOVE_HANDLER, None);
        };
        let mut state = self.state_lock();
        let Some(ss) = state.substreams.get_mut(substream as usize) else {
            return (MsgAction::REMOVE_HANDLER, None);
        };

        let Some(handler) = ss.in_helper.handler.clone() else {
            return (MsgAction::REMOVE_HANDLER, None);
        };

        let action = handler.inspect_status_rsp();
        ss.in_helper.action = ss.in_helper.action | action;

        if action.contains(MsgAction::REMOVE_HANDLER) {
            ctx.incoming_queue.remove_message_handler(&handler);
        }

        if action.contains(MsgAction::RAW) {
            return (MsgAction::RAW, Some(handler));
        }
        if action.contains(MsgAction::CORRUPTED) {
            return (MsgAction::CORRUPTED, None);
        }
        if action.contains(MsgAction::MORE) {
            return (MsgAction::MORE, None);
        }
        (MsgAction::NONE, None)
    }

    // ---

    /// A complete response has been reconstructed.
    pub fn on_incoming(&self, substream: u16, msg: Arc<Message>, bytes_received: u32) {
        // ---
        let Ok(ctx) = self.ctx() else { return };

        let (handler, action) = {
            let mut state = self.state_lock();
            msg.set_session_id(state.session_id);
            state.bytes_received += u64::from(bytes_received);

            match state
                .substreams
                .get_mut(substream as usize)
                .and_then(|ss| ss.in_helper.reset())
            {
                Some((handler, _expires, action)) => (Some(handler), action),
                None => (None, MsgAction::NONE),
            }
        };

        let partial = is_partial(&msg);

        if !partial {
            let stream_action = ctx.transport.message_received(&msg, substream);
            if stream_action.contains(TransportAction::DIGEST_MSG) {
                return;
            }
            if stream_action.contains(TransportAction::REQUEST_CLOSE) {
                if let Err(err) = self.request_close(&msg) {
                    tracing::warn!(stream = %self.stream_name, %err, "failed to issue close request");
                }
                return;
            }
        }

        let Some(handler) = handler else {
            tracing::warn!(
                stream = %self.stream_name,
                substream,
                id = %msg.id(),
                status = ?msg.response_status(),
                "discarding received message, no handler found"
            );
            return;
        };

        tracing::trace!(stream = %self.stream_name, id = %msg.id(), "handling received message");

        if action.intersects(MsgAction::NO_PROCESS | MsgAction::IGNORE) {
            tracing::trace!(stream = %self.stream_name, id = %msg.id(), "skipping the processing handler");

            // A partial still has to lower the handler's timeout fence so
            // per-chunk silence, not total transfer time, drives expiry.
            if partial {
                if let Some(p) = handler.as_partial_aware() {
                    p.partial_received();
                }
            }
            return;
        }

        ctx.job_manager.queue_job(Arc::new(HandleIncMsgJob { handler, msg }));
    }
}

// ---------------------------------------------------------------------------
// Socket callbacks — connection lifecycle
// ---------------------------------------------------------------------------

impl Stream {
    // ---

    /// A substream finished connecting.
    pub fn on_connect(&self, substream: u16) {
        // ---
        let Ok(ctx) = self.ctx() else { return };
        let mut guard = self.state_lock();
        let state = &mut *guard;
        let Some(ss) = state.substreams.get_mut(substream as usize) else {
            return;
        };
        ss.status = SocketStatus::Connected;

        tracing::debug!(
            stream = %self.stream_name,
            substream,
            ipstack = ?state.substreams[0].socket.ip_stack(),
            "substream connected"
        );

        if substream != 0 {
            if let Some(job) = &state.data_conn_job {
                ctx.job_manager.queue_job(Arc::clone(job));
            }
            return;
        }

        // --- substream 0: a new session begins -----------------------------
        state.last_stream_error = None;
        state.last_fatal_error = None;
        state.connection_count = 0;
        state.session_id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst) + 1;

        // Spawn the data-plane siblings the transport asked for, bound to
        // whatever address preference it declares.
        let num_sub = ctx.transport.substream_count();
        if state.substreams.len() == 1 && num_sub > 1 {
            for i in 1..num_sub {
                let bind = ctx.transport.bind_preference(&self.url);
                let socket = ctx.socket_factory.create(
                    &bind,
                    i,
                    Arc::clone(&ctx.poller),
                    self.events_ref(),
                );
                state.substreams.push(SubStream::new(socket));
            }
        }

        // Connect the extras to the same address as substream 0.  A failed
        // initiation folds that substream's backlog into the main queue;
        // uplink arming is left to the handshake completion.
        if state.substreams.len() > 1 {
            tracing::debug!(
                stream = %self.stream_name,
                extra = state.substreams.len() - 1,
                "attempting to connect additional substreams"
            );
            let main_addr = state.substreams[0].socket.address();
            for i in 1..state.substreams.len() {
                if let Some(addr) = main_addr {
                    state.substreams[i].socket.set_address(addr);
                }
                match state.substreams[i].socket.connect(self.params.connection_window) {
                    Ok(()) => state.substreams[i].status = SocketStatus::Connecting,
                    Err(_) => {
                        let (main, rest) = state.substreams.split_at_mut(i);
                        main[0].out_queue.grab_items(&mut rest[0].out_queue);
                        rest[0].socket.close();
                    }
                }
            }
        }

        state.bytes_sent = 0;
        state.bytes_received = 0;
        state.connection_done = Some(ctx.clock.now());

        if let Some(monitor) = &ctx.monitor {
            let auth = ctx.transport.query(TransportQuery::Auth).unwrap_or_default();
            monitor.event(MonitorEvent::Connect(ConnectInfo {
                server: self.url.host_id(),
                started: state.connection_started.unwrap_or(SystemTime::UNIX_EPOCH),
                done: state.connection_done.unwrap_or(SystemTime::UNIX_EPOCH),
                streams: state.substreams.len(),
                auth,
            }));
        }

        ctx.post_master.notify_connect(&self.url);
    }

    // ---

    /// A connect attempt failed.
    pub fn on_connect_error(&self, substream: u16, status: XrdError) {
        // ---
        let Ok(ctx) = self.ctx() else { return };
        let guard = self.state_lock();
        self.handle_connect_error(ctx, guard, substream, status);
    }

    fn handle_connect_error(
        &self,
        ctx: &StreamContext,
        mut guard: MutexGuard<'_, StreamState>,
        substream: u16,
        status: XrdError,
    ) {
        // ---
        let state = &mut *guard;
        let Some(ss) = state.substreams.get_mut(substream as usize) else {
            return;
        };
        ss.socket.close();

        ctx.post_master.notify_connect_error(&self.url, &status);

        // A data-plane substream that cannot connect is demoted, not
        // fatal: its backlog folds into substream 0.
        if substream > 0 {
            ss.status = SocketStatus::Disconnected;
            let (main, rest) = state.substreams.split_at_mut(substream as usize);
            main[0].out_queue.grab_items(&mut rest[0].out_queue);

            match state.substreams[0].status {
                SocketStatus::Connected => {
                    if let Err(err) = state.substreams[0].socket.enable_uplink() {
                        self.handle_fatal_error(ctx, guard, 0, err);
                    }
                }
                SocketStatus::Connecting => {}
                SocketStatus::Disconnected => {
                    self.handle_fatal_error(ctx, guard, substream, status);
                }
            }
            return;
        }

        // --- substream 0 ---------------------------------------------------
        let now = ctx.clock.now();
        let elapsed = state
            .connection_init_time
            .and_then(|t| now.duration_since(t).ok())
            .unwrap_or_default();
        tracing::error!(
            stream = %self.stream_name,
            %status,
            elapsed = elapsed.as_secs(),
            window = self.params.connection_window.as_secs(),
            "connection attempt failed"
        );

        // Addresses left from the current resolution: keep trying.
        if !state.addresses.is_empty() {
            let mut last = Ok(());
            while let Some(addr) = state.addresses.pop() {
                state.substreams[0].socket.set_address(addr);
                state.connection_init_time = Some(ctx.clock.now());
                match state.substreams[0].socket.connect(self.params.connection_window) {
                    Ok(()) => {
                        last = Ok(());
                        break;
                    }
                    Err(err) => last = Err(err),
                }
            }
            if let Err(err) = last {
                self.handle_fatal_error(ctx, guard, substream, err);
            }
            return;
        }

        // Time left in the window: sleep until its end, then reconnect.
        if elapsed < self.params.connection_window
            && state.connection_count < self.params.connection_retry
            && !status.is_fatal()
        {
            let remaining = self.params.connection_window - elapsed;
            tracing::info!(
                stream = %self.stream_name,
                seconds = remaining.as_secs(),
                "attempting reconnection after the window"
            );

            let task = Arc::new(StreamConnectorTask::new(
                self.url.clone(),
                Arc::clone(&ctx.post_master),
            ));
            let when = state.connection_init_time.unwrap_or(now) + self.params.connection_window;
            ctx.task_manager.register_task(task, when);
            return;
        }

        // Window exhausted but retries remain: re-resolve and start over.
        if state.connection_count < self.params.connection_retry && !status.is_fatal() {
            state.addresses.clear();
            state.substreams[0].status = SocketStatus::Disconnected;
            let mut path = PathId::main();
            if let Err(err) = self.enable_link(ctx, state, &mut path) {
                self.handle_fatal_error(ctx, guard, substream, err);
            }
            return;
        }

        self.handle_fatal_error(ctx, guard, substream, status);
    }

    // ---

    /// Mid-session socket error.
    pub fn on_error(&self, substream: u16, status: XrdError) {
        // ---
        let Ok(ctx) = self.ctx() else { return };
        let guard = self.state_lock();
        self.handle_error(ctx, guard, substream, status);
    }

    fn handle_error(
        &self,
        ctx: &StreamContext,
        mut guard: MutexGuard<'_, StreamState>,
        substream: u16,
        status: XrdError,
    ) {
        // ---
        let state = &mut *guard;
        let Some(ss) = state.substreams.get_mut(substream as usize) else {
            return;
        };
        ss.socket.close();
        ss.status = SocketStatus::Disconnected;

        tracing::debug!(
            stream = %self.stream_name,
            substream,
            %status,
            "recovering socket error"
        );

        // Rescue the in-flight outbound: back to the queue front, handler
        // out of the in-queue (it will be re-registered on resend).
        if let Some(entry) = ss.out_helper.take() {
            ctx.incoming_queue.remove_message_handler(&entry.handler);
            ss.out_queue.push_front(entry);
        }

        // Rescue the in-flight inbound: the handler goes back into the
        // in-queue with its original expiry, partial fence lowered.
        if let Some((handler, expires, _action)) = ss.in_helper.reset() {
            ctx.incoming_queue.re_add_message_handler(Arc::clone(&handler), expires);
            if let Some(p) = handler.as_partial_aware() {
                p.partial_received();
            }
        }

        // A peripheral substream recovers locally when it can.
        if substream > 0 {
            if state.substreams[substream as usize].out_queue.is_empty() {
                return;
            }

            if state.substreams[0].status != SocketStatus::Disconnected {
                let (main, rest) = state.substreams.split_at_mut(substream as usize);
                main[0].out_queue.grab_items(&mut rest[0].out_queue);

                match state.substreams[0].status {
                    SocketStatus::Connected => {
                        if let Err(err) = state.substreams[0].socket.enable_uplink() {
                            self.handle_fatal_error(ctx, guard, 0, err);
                        }
                        return;
                    }
                    // Migrated items flow once the main connect lands.
                    SocketStatus::Connecting => return,
                    SocketStatus::Disconnected => {}
                }
            }
            self.handle_fatal_error(ctx, guard, substream, status);
            return;
        }

        // --- substream 0: the session is gone ------------------------------
        let disconnect_info = self.disconnect_info(ctx, state, Some(status.clone()));

        // Stateless backlog is replayable: reconnect transparently.
        let outstanding: usize = state
            .substreams
            .iter()
            .map(|ss| ss.out_queue.stateless_len())
            .sum();
        if outstanding > 0 {
            let mut path = PathId::main();
            if let Err(err) = self.enable_link(ctx, state, &mut path) {
                if let (Some(monitor), Some(info)) = (&ctx.monitor, disconnect_info) {
                    monitor.event(MonitorEvent::Disconnect(info));
                }
                self.handle_fatal_error(ctx, guard, 0, err);
                return;
            }
        }

        // Stateful requests died with the session.  Drain them, hand off
        // the lock, then report.
        tracing::debug!(stream = %self.stream_name, "reporting disconnection to queued handlers");
        let mut scratch = OutQueue::new();
        for ss in state.substreams.iter_mut() {
            scratch.grab_stateful(&mut ss.out_queue);
        }
        drop(guard);

        if let (Some(monitor), Some(info)) = (&ctx.monitor, disconnect_info) {
            monitor.event(MonitorEvent::Disconnect(info));
        }

        let broken = XrdError::new(ErrorKind::StreamBroken);
        scratch.report(&broken);
        ctx.incoming_queue
            .report_stream_event(StreamEvent::Broken, broken.clone());
        self.ev_handlers.report(ChannelEvent::StreamBroken, &broken);
    }

    // ---

    /// Administrative session loss: used by the channel when it must fail
    /// everything in flight regardless of socket health.
    pub fn force_error(&self, status: XrdError, hush: bool) {
        // ---
        let Ok(ctx) = self.ctx() else { return };
        let mut guard = self.state_lock();
        let state = &mut *guard;

        for ss in state.substreams.iter_mut() {
            if ss.status != SocketStatus::Connected {
                continue;
            }
            ss.socket.close();
            ss.status = SocketStatus::Disconnected;

            if !hush {
                tracing::debug!(stream = %self.stream_name, %status, "forcing error on disconnect");
            }

            if let Some(entry) = ss.out_helper.take() {
                ctx.incoming_queue.remove_message_handler(&entry.handler);
                ss.out_queue.push_front(entry);
            }

            if let Some((handler, expires, _action)) = ss.in_helper.reset() {
                ctx.incoming_queue.re_add_message_handler(Arc::clone(&handler), expires);
                if let Some(p) = handler.as_partial_aware() {
                    p.partial_received();
                }
            }
        }

        state.connection_count = 0;

        let mut scratch = OutQueue::new();
        for ss in state.substreams.iter_mut() {
            scratch.grab_items(&mut ss.out_queue);
        }
        drop(guard);

        scratch.report(&status);
        ctx.incoming_queue
            .report_stream_event(StreamEvent::Broken, status.clone());
        self.ev_handlers.report(ChannelEvent::StreamBroken, &status);
    }

    // ---

    /// No recovery possible: arm the error window (unless the failure is
    /// an authentication problem), fail everything, report fatal.
    ///
    /// Takes the guard by value — the lock handoff before the reports is
    /// the whole point.
    fn handle_fatal_error(
        &self,
        ctx: &StreamContext,
        mut guard: MutexGuard<'_, StreamState>,
        substream: u16,
        status: XrdError,
    ) {
        // ---
        let state = &mut *guard;
        if let Some(ss) = state.substreams.get_mut(substream as usize) {
            ss.status = SocketStatus::Disconnected;
        }
        tracing::error!(stream = %self.stream_name, %status, "unable to recover");

        // Credentials may refresh at any moment; an auth failure must not
        // block the endpoint for the whole error window.
        if status.kind() != ErrorKind::AuthFailed {
            state.connection_count = 0;
            state.last_stream_error = Some(ctx.clock.now());
            state.last_fatal_error = Some(status.clone());
        }

        let mut scratch = OutQueue::new();
        for ss in state.substreams.iter_mut() {
            scratch.grab_items(&mut ss.out_queue);
        }
        drop(guard);

        let fatal = status.into_fatal();
        scratch.report(&fatal);
        ctx.incoming_queue
            .report_stream_event(StreamEvent::FatalError, fatal.clone());
        self.ev_handlers.report(ChannelEvent::FatalError, &fatal);
    }

    // ---

    fn disconnect_info(
        &self,
        ctx: &StreamContext,
        state: &StreamState,
        status: Option<XrdError>,
    ) -> Option<DisconnectInfo> {
        // ---
        ctx.monitor.as_ref()?;
        let connected_for = state
            .connection_done
            .and_then(|done| ctx.clock.now().duration_since(done).ok())
            .unwrap_or_default();

        Some(DisconnectInfo {
            server: self.url.host_id(),
            bytes_received: state.bytes_received,
            bytes_sent: state.bytes_sent,
            connected_for,
            status,
        })
    }
}

// ---------------------------------------------------------------------------
// Timeouts, expiry, introspection
// ---------------------------------------------------------------------------

impl Stream {
    // ---

    /// Read-side silence on a substream.
    ///
    /// Returns `false` when the stream disposed of itself — the caller
    /// must not touch it afterwards.
    pub fn on_read_timeout(&self, substream: u16) -> bool {
        // ---
        // Only the session substream drives TTL decisions.
        if substream != 0 {
            return true;
        }
        let Ok(ctx) = self.ctx() else { return true };

        let guard = self.state_lock();
        let now = ctx.clock.now();

        let mut outgoing = 0usize;
        let mut last_activity = SystemTime::UNIX_EPOCH;
        for ss in guard.substreams.iter() {
            outgoing += ss.out_queue.len();
            let activity = ss.socket.last_activity();
            if activity > last_activity {
                last_activity = activity;
            }
        }
        let idle = now.duration_since(last_activity).unwrap_or_default();

        if outgoing == 0 && ctx.transport.is_stream_ttl_elapsed(idle) {
            tracing::debug!(stream = %self.stream_name, "stream TTL elapsed, disconnecting");
            drop(guard);
            // Tears down this stream and its owning channel; `self` must
            // not be referenced after the call.
            ctx.post_master.force_disconnect(&self.url);
            return false;
        }

        if let Err(err) = ctx.transport.is_stream_broken(idle) {
            drop(guard);
            self.on_error(substream, err);
            return false;
        }

        true
    }

    pub fn on_write_timeout(&self, _substream: u16) -> bool {
        true
    }

    // ---

    /// Periodic clock event: harvest expired requests and let the
    /// incoming queue time out overdue handlers.
    pub fn tick(&self, now: SystemTime) {
        // ---
        let Ok(ctx) = self.ctx() else { return };

        let mut scratch = OutQueue::new();
        {
            let mut state = self.state_lock();
            for ss in state.substreams.iter_mut() {
                scratch.grab_expired(&mut ss.out_queue, now);
            }
        }

        scratch.report(&XrdError::new(ErrorKind::OperationExpired));
        ctx.incoming_queue.report_timeout(now);
    }

    // ---

    /// Whether a channel keyed by `url` may share this stream: true iff
    /// any of the candidate's addresses matches any of this endpoint's
    /// addresses.  Ports are not compared — the channel key carries them.
    pub fn can_collapse(&self, url: &XrdUrl) -> bool {
        // ---
        let Ok(ctx) = self.ctx() else { return false };

        let candidate = match ctx.resolver.resolve(url, self.params.address_type) {
            Ok(addrs) => addrs,
            Err(_) => {
                tracing::error!(stream = %self.stream_name, host = %url.host_id(), "unable to resolve candidate");
                return false;
            }
        };
        let alias = match ctx.resolver.resolve(&self.url, self.params.address_type) {
            Ok(addrs) => addrs,
            Err(_) => {
                tracing::error!(stream = %self.stream_name, "unable to resolve own endpoint");
                return false;
            }
        };

        candidate
            .iter()
            .any(|c| alias.iter().any(|a| a.ip() == c.ip()))
    }

    // ---

    /// Answer an introspection query from substream 0's socket.
    pub fn query(&self, query: StreamQuery) -> Result<String> {
        // ---
        self.ctx()?;
        let state = self.state_lock();
        let socket = &state
            .substreams
            .first()
            .ok_or_else(|| XrdError::new(ErrorKind::Uninitialized))?
            .socket;

        let answer = match query {
            StreamQuery::IpAddr => socket.ip_addr(),
            StreamQuery::IpStack => socket.ip_stack(),
            StreamQuery::HostName => socket.host_name(),
        };
        answer.ok_or_else(|| XrdError::new(ErrorKind::QueryNotSupported))
    }

    // ---

    /// Current session epoch; 0 before the first connect.
    pub fn session_id(&self) -> u64 {
        self.state_lock().session_id
    }
}

// ---------------------------------------------------------------------------
// StreamEvents — the surface sockets call back through
// ---------------------------------------------------------------------------

impl StreamEvents for Stream {
    // ---
    fn on_incoming(&self, substream: u16, msg: Arc<Message>, bytes_received: u32) {
        Stream::on_incoming(self, substream, msg, bytes_received);
    }

    fn on_message_sent(&self, substream: u16, msg: &Message, bytes_sent: u32) {
        Stream::on_message_sent(self, substream, msg, bytes_sent);
    }

    fn on_ready_to_write(&self, substream: u16) -> Option<(Arc<Message>, Arc<dyn MsgHandler>)> {
        Stream::on_ready_to_write(self, substream)
    }

    fn on_connect(&self, substream: u16) {
        Stream::on_connect(self, substream);
    }

    fn on_connect_error(&self, substream: u16, status: XrdError) {
        Stream::on_connect_error(self, substream, status);
    }

    fn on_error(&self, substream: u16, status: XrdError) {
        Stream::on_error(self, substream, status);
    }

    fn on_read_timeout(&self, substream: u16) -> bool {
        Stream::on_read_timeout(self, substream)
    }

    fn on_write_timeout(&self, substream: u16) -> bool {
        Stream::on_write_timeout(self, substream)
    }

    fn install_inc_handler(&self, msg: &Message, substream: u16) -> Option<Arc<dyn MsgHandler>> {
        Stream::install_inc_handler(self, msg, substream)
    }

    fn inspect_status_rsp(&self, substream: u16) -> (MsgAction, Option<Arc<dyn MsgHandler>>) {
        Stream::inspect_status_rsp(self, substream)
    }
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

impl Drop for Stream {
    // ---
    fn drop(&mut self) {
        // ---
        let Some(ctx) = self.ctx.get() else { return };
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);

        for ss in state.substreams.iter_mut() {
            ss.socket.close();
            ss.status = SocketStatus::Disconnected;
        }

        tracing::debug!(stream = %self.stream_name, "destroying stream");

        if let Some(monitor) = &ctx.monitor {
            let connected_for = state
                .connection_done
                .and_then(|done| ctx.clock.now().duration_since(done).ok())
                .unwrap_or_default();
            monitor.event(MonitorEvent::Disconnect(DisconnectInfo {
                server: self.url.host_id(),
                bytes_received: state.bytes_received,
                bytes_sent: state.bytes_sent,
                connected_for,
                status: None,
            }));
        }
    }
}
