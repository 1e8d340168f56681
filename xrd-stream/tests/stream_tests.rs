//! End-to-end exercises of the stream state machine against the link sim.
//!
//! Tests drive the same callback surface the socket layer uses, in the
//! orders real sockets produce them: send → connect completion → write
//! readiness → sent → response, with errors injected at every stage.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use xrd_domain::{
    // ---
    Clock,
    ErrorKind,
    InstalledHandler,
    Message,
    MonitorEvent,
    MsgAction,
    PathId,
    StreamEvent,
    XrdError,
    XrdUrl,
};
use xrd_link_sim::{
    // ---
    ok_frame,
    oksofar_frame,
    InlineJobManager,
    MockClock,
    NullPoller,
    RecordingHandler,
    RecordingMonitor,
    RecordingPostMaster,
    RecordingTaskManager,
    SimIncomingQueue,
    SimNet,
    SimTransport,
    StaticResolver,
};
use xrd_stream::{Stream, StreamContext, StreamQuery};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

const HOST: &str = "data.example.org";

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn addr_a() -> SocketAddr {
    addr("10.0.0.1:1094")
}

fn addr_b() -> SocketAddr {
    addr("10.0.0.2:1094")
}

// ---

struct Rig {
    // ---
    stream: Arc<Stream>,
    net: Arc<SimNet>,
    transport: Arc<SimTransport>,
    in_queue: Arc<SimIncomingQueue>,
    tasks: Arc<RecordingTaskManager>,
    post_master: Arc<RecordingPostMaster>,
    monitor: Arc<RecordingMonitor>,
    resolver: Arc<StaticResolver>,
    clock: Arc<MockClock>,
}

// ---

impl Rig {
    // ---

    /// A stream for `url` wired to fresh fakes.  The resolver starts with
    /// `HOST → [A, B]` — the work-list is consumed back to front, so `B`
    /// is attempted first.
    fn new(url: &str, substreams: u16) -> Self {
        // ---
        let net = SimNet::new();
        let transport = Arc::new(SimTransport::new(substreams));
        let in_queue = SimIncomingQueue::new();
        let tasks = RecordingTaskManager::new();
        let post_master = RecordingPostMaster::new();
        let monitor = RecordingMonitor::new();
        let resolver = StaticResolver::new();
        let clock = MockClock::new();

        resolver.add(HOST, vec![addr_a(), addr_b()]);

        let stream = Arc::new(Stream::new(url.parse().unwrap(), None));
        stream
            .initialize(StreamContext {
                transport: transport.clone(),
                poller: Arc::new(NullPoller),
                task_manager: tasks.clone(),
                job_manager: InlineJobManager::new(),
                incoming_queue: in_queue.clone(),
                post_master: post_master.clone(),
                socket_factory: net.clone(),
                resolver: resolver.clone(),
                clock: clock.clone(),
                monitor: Some(monitor.clone()),
            })
            .unwrap();

        Self {
            stream,
            net,
            transport,
            in_queue,
            tasks,
            post_master,
            monitor,
            resolver,
            clock,
        }
    }

    fn basic() -> Self {
        Self::new(&format!("root://{HOST}:1094"), 1)
    }

    // ---

    fn expires(&self, secs: u64) -> SystemTime {
        self.clock.now() + Duration::from_secs(secs)
    }

    fn msg(&self, tag: &str) -> Arc<Message> {
        Arc::new(Message::new(Bytes::from_static(b"payload"), tag.to_string()))
    }

    /// Queue a stateless message and complete the substream-0 connect.
    fn connect(&self) -> Arc<RecordingHandler> {
        // ---
        let handler = RecordingHandler::new();
        self.stream
            .send(self.msg("bootstrap"), handler.clone(), false, self.expires(60))
            .unwrap();
        self.net.socket(0).unwrap().complete_connect();
        handler
    }

    /// Pop the next queued message through the write path.
    fn pump(&self, substream: u16) -> Arc<Message> {
        // ---
        let socket = self.net.socket(substream).unwrap();
        let events = socket.events().unwrap();
        let (msg, _handler) = events
            .on_ready_to_write(substream)
            .expect("a message ready to frame");
        events.on_message_sent(substream, &msg, msg.payload().len() as u32);
        msg
    }
}

// ---------------------------------------------------------------------------
// Scenario: happy send
// ---------------------------------------------------------------------------

#[test]
fn happy_send_completes_through_the_full_path() {
    // ---
    let rig = Rig::basic();

    let m1 = rig.msg("open /data/run042.root");
    let h1 = RecordingHandler::new();
    rig.stream
        .send(m1.clone(), h1.clone(), false, rig.expires(60))
        .unwrap();

    // Resolution produced [A, B]; B was popped (preferred end) first.
    let socket = rig.net.socket(0).unwrap();
    assert_eq!(socket.connect_attempts(), vec![addr_b()]);

    socket.complete_connect();
    let session = rig.stream.session_id();
    assert!(session > 0);

    // Write readiness: the message moves out-queue → in-flight slot, its
    // handler out-queue → in-queue.
    let events = socket.events().unwrap();
    let (msg, _) = events.on_ready_to_write(0).expect("message to frame");
    assert_eq!(msg.id(), m1.id());
    assert_eq!(h1.ready_to_send_count(), 1);
    assert_eq!(rig.in_queue.registered_count(), 1);

    events.on_message_sent(0, &msg, 7);
    assert_eq!(h1.statuses(), vec![Ok(())]);
    assert_eq!(rig.in_queue.timeouts_assigned(), 1);
    assert_eq!(rig.transport.sent().len(), 1);

    // The response finds its handler and is dispatched on the job manager.
    let rsp = Arc::new(ok_frame());
    rig.in_queue.install(InstalledHandler {
        handler: h1.clone(),
        expires: rig.expires(60),
        action: MsgAction::NONE,
    });
    assert!(rig.stream.install_inc_handler(&rsp, 0).is_none());
    rig.stream.on_incoming(0, rsp, 24);

    assert_eq!(h1.messages().len(), 1);
    assert_eq!(h1.messages()[0].session_id(), session);

    // Monitoring saw the connect.
    assert!(rig
        .monitor
        .events()
        .iter()
        .any(|e| matches!(e, MonitorEvent::Connect(_))));
    assert_eq!(rig.post_master.connects().len(), 1);
}

// ---------------------------------------------------------------------------
// Scenario: multi-substream demotion
// ---------------------------------------------------------------------------

#[test]
fn failed_data_substreams_demote_traffic_to_main() {
    // ---
    let rig = Rig::new(&format!("root://{HOST}:1094"), 4);

    // The three data-plane connects, initiated inside the substream-0
    // connect callback, all fail to even start.
    for sub in 1..4 {
        rig.net
            .script_connect(sub, Err(XrdError::new(ErrorKind::ConnectionError)));
    }

    rig.connect();
    assert_eq!(rig.net.socket_count(), 4);
    for sub in 1..4u16 {
        assert_eq!(rig.net.socket(sub).unwrap().close_count(), 1);
    }

    // Route the next message up substream 2, which never connected: the
    // stream falls back to substream 0.
    rig.transport.script_route(PathId::new(2, 2));
    let m2 = rig.msg("read chunk");
    let h2 = RecordingHandler::new();
    rig.stream
        .send(m2.clone(), h2.clone(), false, rig.expires(60))
        .unwrap();

    assert!(rig.net.socket(0).unwrap().uplink_enabled());

    // The bootstrap message sits ahead of the routed one on substream 0.
    rig.pump(0);
    assert_eq!(rig.pump(0).id(), m2.id());
}

// ---

#[test]
fn out_of_range_route_is_demoted_with_a_warning() {
    // ---
    let rig = Rig::basic();
    rig.connect();

    rig.transport.script_route(PathId::new(7, 0));
    let m = rig.msg("stat /");
    rig.stream
        .send(m.clone(), RecordingHandler::new(), false, rig.expires(60))
        .unwrap();

    // Both the bootstrap and the routed message drain from substream 0.
    rig.pump(0);
    assert_eq!(rig.pump(0).id(), m.id());
}

// ---------------------------------------------------------------------------
// Scenario: mid-session error, stateless traffic
// ---------------------------------------------------------------------------

#[test]
fn stateless_backlog_survives_session_loss() {
    // ---
    let rig = Rig::basic();
    let h0 = rig.connect();
    let session_before = rig.stream.session_id();

    let h1 = RecordingHandler::new();
    let h2 = RecordingHandler::new();
    let m1 = rig.msg("query a");
    let m2 = rig.msg("query b");
    rig.stream
        .send(m1.clone(), h1.clone(), false, rig.expires(60))
        .unwrap();
    rig.stream
        .send(m2.clone(), h2.clone(), false, rig.expires(60))
        .unwrap();

    // Pull the bootstrap message into the in-flight slot, then lose the
    // socket before it is written.
    let socket = rig.net.socket(0).unwrap();
    let events = socket.events().unwrap();
    let (in_flight, _) = events.on_ready_to_write(0).unwrap();

    rig.stream
        .on_error(0, XrdError::new(ErrorKind::ConnectionError));

    // The in-flight message went back to the queue front, its handler out
    // of the in-queue; nobody saw a failure.
    assert_eq!(rig.in_queue.removed_count(), 1);
    assert!(h0.statuses().is_empty());
    assert!(h1.statuses().is_empty());
    assert!(h2.statuses().is_empty());

    // Stateless backlog forced a transparent reconnect.
    assert_eq!(socket.connect_attempts().len(), 2);
    socket.complete_connect();
    assert!(rig.stream.session_id() > session_before);

    // Everything drains in the original order.
    assert_eq!(rig.pump(0).id(), in_flight.id());
    assert_eq!(rig.pump(0).id(), m1.id());
    assert_eq!(rig.pump(0).id(), m2.id());
}

// ---------------------------------------------------------------------------
// Scenario: mid-session error, stateful traffic
// ---------------------------------------------------------------------------

#[test]
fn stateful_backlog_is_failed_on_session_loss() {
    // ---
    let rig = Rig::basic();
    rig.connect();
    rig.pump(0); // drain the bootstrap message
    let session = rig.stream.session_id();

    let h_stateful = RecordingHandler::new();
    let h_stateless = RecordingHandler::new();

    let m_stateful = rig.msg("write handle 7");
    m_stateful.set_session_id(session);
    rig.stream
        .send(m_stateful.clone(), h_stateful.clone(), true, rig.expires(60))
        .unwrap();

    let m_stateless = rig.msg("locate /f");
    rig.stream
        .send(m_stateless.clone(), h_stateless.clone(), false, rig.expires(60))
        .unwrap();

    rig.stream
        .on_error(0, XrdError::new(ErrorKind::ConnectionError));

    // The stateful request died with the session.
    let statuses = h_stateful.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(
        statuses[0].as_ref().unwrap_err().kind(),
        ErrorKind::StreamBroken
    );
    assert!(matches!(
        rig.in_queue.stream_events().as_slice(),
        [(StreamEvent::Broken, _)]
    ));

    // The stateless one survived to the next session.
    assert!(h_stateless.statuses().is_empty());
    rig.net.socket(0).unwrap().complete_connect();
    assert_eq!(rig.pump(0).id(), m_stateless.id());

    // Its old session tag now bounces.
    let stale = rig.msg("write handle 7 again");
    stale.set_session_id(session);
    let err = rig
        .stream
        .send(stale, RecordingHandler::new(), true, rig.expires(60))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSession);
}

// ---------------------------------------------------------------------------
// Scenario: partial response streaming
// ---------------------------------------------------------------------------

#[test]
fn partials_lower_the_fence_and_the_final_dispatches() {
    // ---
    let rig = Rig::basic();
    rig.connect();
    rig.pump(0);

    let handler = RecordingHandler::partial_aware();

    for _ in 0..3 {
        let chunk = Arc::new(oksofar_frame());
        rig.in_queue.install(InstalledHandler {
            handler: handler.clone(),
            expires: rig.expires(60),
            action: MsgAction::NO_PROCESS,
        });
        assert!(rig.stream.install_inc_handler(&chunk, 0).is_none());
        rig.stream.on_incoming(0, chunk, 512);
    }

    // Each chunk lowered the timeout fence; none was dispatched, and the
    // transport was never consulted about them.
    assert_eq!(handler.partials(), 3);
    assert!(handler.messages().is_empty());
    assert!(rig.transport.received().is_empty());

    // The final response goes through the job manager.
    let fin = Arc::new(ok_frame());
    rig.in_queue.install(InstalledHandler {
        handler: handler.clone(),
        expires: rig.expires(60),
        action: MsgAction::NONE,
    });
    rig.stream.install_inc_handler(&fin, 0);
    rig.stream.on_incoming(0, fin, 128);

    assert_eq!(handler.messages().len(), 1);
    assert_eq!(handler.partials(), 3);
    assert_eq!(rig.transport.received().len(), 1);
}

// ---

#[test]
fn raw_capable_handler_is_returned_at_install() {
    // ---
    let rig = Rig::basic();
    rig.connect();

    let handler = RecordingHandler::new();
    let rsp = Arc::new(ok_frame());
    rig.in_queue.install(InstalledHandler {
        handler: handler.clone(),
        expires: rig.expires(60),
        action: MsgAction::RAW,
    });

    let raw = rig.stream.install_inc_handler(&rsp, 0);
    assert!(raw.is_some());
}

// ---------------------------------------------------------------------------
// Scenario: idle TTL self-disposal
// ---------------------------------------------------------------------------

#[test]
fn idle_ttl_routes_through_force_disconnect() {
    // ---
    let rig = Rig::basic();
    rig.connect();
    rig.pump(0);

    // Data substreams never drive TTL.
    assert!(rig.stream.on_read_timeout(1));

    rig.transport.set_ttl_elapsed(true);
    assert!(!rig.stream.on_read_timeout(0));

    let disposed = rig.post_master.force_disconnects();
    assert_eq!(disposed.len(), 1);
    assert_eq!(disposed[0].host_id(), format!("{HOST}:1094"));
}

// ---

#[test]
fn broken_stream_judgement_routes_through_error_recovery() {
    // ---
    let rig = Rig::basic();
    rig.connect();
    rig.pump(0);

    rig.transport
        .set_broken(Some(XrdError::new(ErrorKind::StreamBroken)));
    assert!(!rig.stream.on_read_timeout(0));

    // Empty queues: the session loss is reported, nothing to retry.
    assert!(matches!(
        rig.in_queue.stream_events().as_slice(),
        [(StreamEvent::Broken, _)]
    ));
    assert_eq!(rig.net.socket(0).unwrap().close_count(), 1);
}

// ---------------------------------------------------------------------------
// Boundary: error window
// ---------------------------------------------------------------------------

#[test]
fn error_window_silences_reconnect_attempts() {
    // ---
    let url = format!("root://{HOST}:1094/?StreamErrorWindow=300");
    let rig = Rig::new(&url, 1);

    // First attempt: resolution fails outright → fatal, window armed.
    rig.resolver.remove(HOST);
    let err = rig
        .stream
        .send(rig.msg("m"), RecordingHandler::new(), false, rig.expires(60))
        .unwrap_err();
    assert!(err.is_fatal());

    // Resolution would work now, but the window is still closed: the
    // recorded error comes back with no socket activity.
    rig.resolver.add(HOST, vec![addr_a()]);
    rig.clock.advance(Duration::from_secs(299));
    let err = rig
        .stream
        .send(rig.msg("m"), RecordingHandler::new(), false, rig.expires(60))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);
    assert!(rig.net.socket(0).unwrap().connect_attempts().is_empty());

    // At the boundary the stream resolves and connects again.
    rig.clock.advance(Duration::from_secs(1));
    rig.stream
        .send(rig.msg("m"), RecordingHandler::new(), false, rig.expires(60))
        .unwrap();
    assert_eq!(rig.net.socket(0).unwrap().connect_attempts(), vec![addr_a()]);
}

// ---------------------------------------------------------------------------
// Boundary: retry exhaustion
// ---------------------------------------------------------------------------

#[test]
fn retry_budget_exhaustion_surfaces_fatal() {
    // ---
    let url = format!("root://{HOST}:1094/?ConnectionRetry=2&ConnectionWindow=30");
    let rig = Rig::new(&url, 1);
    rig.resolver.add(HOST, vec![addr_a()]);

    let handler = RecordingHandler::new();
    rig.stream
        .send(rig.msg("m"), handler.clone(), false, rig.expires(600))
        .unwrap();

    let socket = rig.net.socket(0).unwrap();
    assert_eq!(socket.connect_attempts().len(), 1);

    // Attempt 1 fails with time left in the window: a reconnect task is
    // scheduled for the window's end.
    socket.fail_connect(XrdError::new(ErrorKind::ConnectionError));
    let pending = rig.tasks.pending();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].0.contains(&format!("{HOST}:1094")));

    // The task fires and reaches back through the post-master; the
    // channel responds by forcing the connect.
    rig.clock.advance(Duration::from_secs(30));
    assert_eq!(rig.tasks.run_due(rig.clock.now()), 1);
    assert_eq!(rig.post_master.force_reconnects().len(), 1);
    rig.stream.force_connect();
    assert_eq!(socket.connect_attempts().len(), 2);

    // Attempt 2 fails too: the budget is spent, the failure is fatal even
    // though the underlying status was recoverable.
    socket.fail_connect(XrdError::new(ErrorKind::ConnectionError));

    let statuses = handler.statuses();
    assert_eq!(statuses.len(), 1);
    let err = statuses[0].as_ref().unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        rig.in_queue.stream_events().as_slice(),
        [(StreamEvent::FatalError, _)]
    ));

    // And the error window is armed.
    let err = rig
        .stream
        .send(rig.msg("m"), RecordingHandler::new(), false, rig.expires(60))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);
    assert_eq!(socket.connect_attempts().len(), 2);
}

// ---------------------------------------------------------------------------
// Timed expiry
// ---------------------------------------------------------------------------

#[test]
fn tick_harvests_expired_entries() {
    // ---
    let rig = Rig::basic();

    let h_old = RecordingHandler::new();
    let h_new = RecordingHandler::new();
    rig.stream
        .send(rig.msg("old"), h_old.clone(), false, rig.expires(10))
        .unwrap();
    rig.stream
        .send(rig.msg("new"), h_new.clone(), false, rig.expires(500))
        .unwrap();

    let now = rig.clock.now() + Duration::from_secs(60);
    rig.stream.tick(now);

    let statuses = h_old.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(
        statuses[0].as_ref().unwrap_err().kind(),
        ErrorKind::OperationExpired
    );
    assert!(h_new.statuses().is_empty());
    assert_eq!(rig.in_queue.reported_timeouts(), vec![now]);
}

// ---------------------------------------------------------------------------
// Administrative teardown
// ---------------------------------------------------------------------------

#[test]
fn force_error_fails_everything_exactly_once() {
    // ---
    let rig = Rig::basic();
    let h0 = rig.connect();

    let h1 = RecordingHandler::new();
    rig.stream
        .send(rig.msg("pending"), h1.clone(), true, rig.expires(60))
        .unwrap();

    // Pull the bootstrap into the in-flight slot so the rescue path runs.
    let socket = rig.net.socket(0).unwrap();
    socket.events().unwrap().on_ready_to_write(0).unwrap();

    let status = XrdError::new(ErrorKind::OperationInterrupted);
    rig.stream.force_error(status, false);

    for handler in [&h0, &h1] {
        let statuses = handler.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(
            statuses[0].as_ref().unwrap_err().kind(),
            ErrorKind::OperationInterrupted
        );
    }
    assert!(matches!(
        rig.in_queue.stream_events().as_slice(),
        [(StreamEvent::Broken, _)]
    ));
    assert_eq!(socket.close_count(), 1);
}

// ---------------------------------------------------------------------------
// Channel collapse and introspection
// ---------------------------------------------------------------------------

#[test]
fn collapse_matches_on_any_shared_address() {
    // ---
    let rig = Rig::basic();

    // Same machine, different service port: still collapsible.
    rig.resolver.add("alias.example.org", vec![addr("10.0.0.2:1095")]);
    assert!(rig
        .stream
        .can_collapse(&"root://alias.example.org:1095".parse::<XrdUrl>().unwrap()));

    rig.resolver.add("other.example.org", vec![addr("10.9.9.9:1094")]);
    assert!(!rig
        .stream
        .can_collapse(&"root://other.example.org:1094".parse::<XrdUrl>().unwrap()));
}

// ---

#[test]
fn query_reads_from_the_main_socket() {
    // ---
    let rig = Rig::basic();

    // Before any address is assigned there is nothing to report.
    assert!(rig.stream.query(StreamQuery::IpAddr).is_err());

    rig.connect();
    assert_eq!(rig.stream.query(StreamQuery::IpAddr).unwrap(), "10.0.0.2");
    assert_eq!(rig.stream.query(StreamQuery::IpStack).unwrap(), "IPv4");
    assert_eq!(rig.stream.query(StreamQuery::HostName).unwrap(), HOST);
}

// ---------------------------------------------------------------------------
// Session epoch
// ---------------------------------------------------------------------------

#[test]
fn session_epoch_strictly_increases_across_reconnects() {
    // ---
    let rig = Rig::basic();
    rig.connect();
    let first = rig.stream.session_id();

    rig.stream
        .send(rig.msg("keep the backlog nonempty"), RecordingHandler::new(), false, rig.expires(60))
        .unwrap();
    rig.stream
        .on_error(0, XrdError::new(ErrorKind::ConnectionError));
    rig.net.socket(0).unwrap().complete_connect();

    let second = rig.stream.session_id();
    assert!(second > first);

    // Untagged messages are accepted under any session.
    rig.stream
        .send(rig.msg("untagged"), RecordingHandler::new(), false, rig.expires(60))
        .unwrap();
}
