//! Caller and callee endpoints.
//!
//! Both roles share one [`Inner`]: the active transport socket, the
//! signaling state machine, reconnect bookkeeping and the negotiation
//! engine. Socket events arrive on the network thread through the
//! [`MessageDispatcher`]; engine calls are made on the signaling thread.

mod callee;
mod caller;

pub use callee::Callee;
pub use caller::Caller;

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use direct_protocol::{DirectConfig, PeerAddress, ProtocolMessage, Role};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::{MessageDispatcher, SocketHandler, execute_on};
use crate::error::SessionError;
use crate::negotiation::{NegotiationEngine, NegotiationHandle, NegotiationSink};
use crate::reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState};
use crate::runtime::{TaskThread, ThreadRuntime};
use crate::signaling::{
    Action, ConnectionState, CountingLimits, ProtocolViolation, SequenceCounters,
    SignalingStateMachine,
};
use crate::socket::{ListenSocket, PacketSocket};
use crate::tls::TlsOptions;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub listen_backlog: i32,
    pub reconnect: ReconnectPolicy,
    /// Run the counting self-test instead of real negotiation.
    pub counting: Option<CountingLimits>,
    pub tls: TlsOptions,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            listen_backlog: 5,
            reconnect: ReconnectPolicy::default(),
            counting: None,
            tls: TlsOptions::default(),
        }
    }
}

impl From<&DirectConfig> for EndpointOptions {
    fn from(config: &DirectConfig) -> Self {
        Self {
            listen_backlog: config.session.listen_backlog,
            reconnect: ReconnectPolicy::from(&config.session),
            counting: CountingLimits::from_config(&config.session),
            tls: TlsOptions {
                pinned_cert: config.tls.pinned_cert.clone(),
            },
        }
    }
}

/// Operations common to both roles.
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    fn new(
        role: Role,
        runtime: Arc<ThreadRuntime>,
        engine: Arc<dyn NegotiationEngine>,
        options: EndpointOptions,
    ) -> Self {
        let inner = Inner {
            role,
            dispatcher: MessageDispatcher::new(Arc::clone(runtime.network())),
            machine: Mutex::new(SignalingStateMachine::new(role, options.counting)),
            reconnect: ReconnectState::new(options.reconnect),
            socket: Mutex::new(None),
            listener: Mutex::new(None),
            target: Mutex::new(None),
            runtime,
            engine,
            options,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.machine().state()
    }

    pub fn counters(&self) -> SequenceCounters {
        self.inner.machine().counters()
    }

    pub fn runtime(&self) -> &Arc<ThreadRuntime> {
        &self.inner.runtime
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.socket).is_some()
    }

    /// Send one token over the active transport.
    pub fn send_message(&self, message: &ProtocolMessage) -> Result<(), SessionError> {
        self.inner.send_message(message)
    }

    /// End the session: the peer answers BYE with OK.
    pub fn hang_up(&self) -> Result<(), SessionError> {
        info!(role = %self.inner.role, "Hanging up");
        self.inner.send_message(&ProtocolMessage::Bye)
    }

    /// Tear down after a transport drop and decide whether to reconnect.
    /// Safe to call from any thread, any number of times.
    pub fn handle_disconnect(&self) {
        self.inner.handle_disconnect();
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect.attempts()
    }

    /// How many distinct transport drops have been torn down.
    pub fn disconnects_handled(&self) -> u32 {
        self.inner.reconnect.disconnects_handled()
    }
}

pub(crate) struct Inner {
    role: Role,
    runtime: Arc<ThreadRuntime>,
    engine: Arc<dyn NegotiationEngine>,
    dispatcher: MessageDispatcher,
    machine: Mutex<SignalingStateMachine>,
    socket: Mutex<Option<PacketSocket>>,
    listener: Mutex<Option<ListenSocket>>,
    target: Mutex<Option<PeerAddress>>,
    reconnect: ReconnectState,
    options: EndpointOptions,
}

impl Inner {
    fn machine(&self) -> MutexGuard<'_, SignalingStateMachine> {
        lock(&self.machine)
    }

    fn network(&self) -> &Arc<TaskThread> {
        self.runtime.network()
    }

    fn active_conn(&self) -> Option<Uuid> {
        lock(&self.socket).as_ref().map(PacketSocket::id)
    }

    fn send_message(&self, message: &ProtocolMessage) -> Result<(), SessionError> {
        let socket = lock(&self.socket);
        let Some(socket) = socket.as_ref() else {
            error!(role = %self.role, token = message.kind(), "Cannot send, no active socket");
            return Err(SessionError::NotConnected);
        };
        socket.send(message.to_string().as_bytes())?;
        debug!(role = %self.role, token = message.kind(), "Sent message");
        Ok(())
    }

    /// Make `socket` the active transport, closing any previous one.
    fn install_socket(self: &Arc<Self>, socket: PacketSocket) {
        let conn_id = socket.id();
        self.dispatcher.attach(&socket, Arc::downgrade(self));
        let previous = lock(&self.socket).replace(socket);
        if let Some(old) = previous {
            info!(role = %self.role, conn_id = %old.id(), "Closing existing connection for new one");
            MessageDispatcher::detach(&old);
            old.close();
        }
        self.machine().on_connected(conn_id);
        self.reconnect.clear_disconnected();
    }

    /// Close the transport ourselves. Does not count as a disconnect.
    /// A no-op when `conn_id` has already been replaced or dropped.
    fn close_transport(&self, conn_id: Uuid) {
        let socket = {
            let mut active = lock(&self.socket);
            if active.as_ref().map(PacketSocket::id) != Some(conn_id) {
                debug!(role = %self.role, %conn_id, "Connection already replaced, leaving active socket open");
                return;
            }
            active.take()
        };
        if let Some(socket) = socket {
            MessageDispatcher::detach(&socket);
            socket.close();
            info!(role = %self.role, %conn_id, "Transport closed");
        }
        let listening = lock(&self.listener).is_some();
        self.machine().on_transport_closed(listening);
    }

    fn handle_disconnect(self: &Arc<Self>) {
        let network = self.network();
        if !network.is_current() {
            let this = Arc::clone(self);
            network.post(move || this.handle_disconnect());
            return;
        }

        if !self.reconnect.try_begin_handling() {
            info!(role = %self.role, "Already handling disconnect, skipping");
            return;
        }
        if !self.reconnect.mark_disconnected() {
            debug!(role = %self.role, "Already disconnected, skipping");
            self.reconnect.finish_handling();
            return;
        }

        warn!(role = %self.role, "Connection lost");
        let socket = lock(&self.socket).take();
        if let Some(socket) = socket {
            MessageDispatcher::detach(&socket);
            socket.close();
        }
        self.machine().on_transport_lost();
        let this = Arc::clone(self);
        execute_on(self.runtime.signaling(), move || this.engine.close_session());
        self.reconnect.finish_handling();

        if self.runtime.should_quit() || self.machine().state() == ConnectionState::ShuttingDown {
            info!(role = %self.role, "Shutting down, not reconnecting");
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        match self.reconnect.decide(self.role) {
            ReconnectDecision::Disabled => {
                info!(role = %self.role, "Reconnection disabled, staying disconnected");
            }
            ReconnectDecision::AwaitInbound => {
                let listening = lock(&self.listener).is_some();
                self.machine().on_transport_closed(listening);
                info!(role = %self.role, "Waiting for a new connection");
            }
            ReconnectDecision::Retry { attempt, delay } => {
                info!(
                    role = %self.role,
                    attempt,
                    max_attempts = self.reconnect.policy().max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                let this = Arc::clone(self);
                self.network()
                    .post_delayed_async(delay, async move { this.reconnect_now().await });
            }
            ReconnectDecision::Exhausted => {
                error!(
                    role = %self.role,
                    attempts = self.reconnect.attempts(),
                    "Max reconnection attempts reached, giving up"
                );
            }
        }
    }

    async fn reconnect_now(self: Arc<Self>) {
        if self.runtime.should_quit() {
            return;
        }
        match caller::establish(&self).await {
            Ok(()) => {
                self.reconnect.on_reconnected();
                info!(role = %self.role, "Reconnected");
            }
            Err(e) => {
                warn!(role = %self.role, "Reconnect failed: {e}");
                self.schedule_reconnect();
            }
        }
    }

    /// Carry out `actions` in order. Each action runs on its own thread; the
    /// remainder follows it there so ordering holds across hops.
    fn run_actions(self: &Arc<Self>, mut actions: VecDeque<Action>) {
        while let Some(action) = actions.pop_front() {
            if let Some(thread) = self.thread_for(&action)
                && !thread.is_current()
            {
                actions.push_front(action);
                let this = Arc::clone(self);
                if !thread.post(move || this.run_actions(actions)) {
                    warn!(role = %self.role, thread = thread.name(), "Dropping actions, thread stopped");
                }
                return;
            }
            self.perform(action);
        }
    }

    fn thread_for(&self, action: &Action) -> Option<&Arc<TaskThread>> {
        match action {
            Action::BeginNegotiation
            | Action::SetRemoteDescription(_)
            | Action::AddRemoteCandidate(_)
            | Action::TeardownSession => Some(self.runtime.signaling()),
            Action::CloseTransport(_) => Some(self.runtime.network()),
            Action::Send(_) | Action::QuitRuntime => None,
        }
    }

    fn perform(self: &Arc<Self>, action: Action) {
        match action {
            Action::Send(message) => {
                if let Err(e) = self.send_message(&message) {
                    warn!(role = %self.role, token = message.kind(), "Send failed: {e}");
                }
            }
            Action::BeginNegotiation => {
                info!(role = %self.role, "Starting negotiation");
                self.engine.begin_negotiation(self.role, self.negotiation_handle());
            }
            Action::SetRemoteDescription(sdp) => self.engine.set_remote_description(&sdp),
            Action::AddRemoteCandidate(candidate) => self.engine.add_remote_candidate(&candidate),
            Action::TeardownSession => self.engine.close_session(),
            Action::CloseTransport(conn_id) => self.close_transport(conn_id),
            Action::QuitRuntime => {
                if self.runtime.quit() {
                    info!(role = %self.role, "Session complete");
                }
            }
        }
    }

    fn negotiation_handle(self: &Arc<Self>) -> NegotiationHandle {
        let sink: Arc<dyn NegotiationSink> = Arc::clone(self) as Arc<dyn NegotiationSink>;
        NegotiationHandle::new(Arc::downgrade(&sink))
    }

    /// Engine output always leaves through the signaling thread.
    fn send_from_signaling(self: Arc<Self>, message: ProtocolMessage) {
        let signaling = Arc::clone(self.runtime.signaling());
        execute_on(&signaling, move || {
            if let Err(e) = self.send_message(&message) {
                warn!(role = %self.role, token = message.kind(), "Dropping local negotiation output: {e}");
            }
        });
    }
}

impl SocketHandler for Inner {
    fn on_message(self: Arc<Self>, conn_id: Uuid, text: String, remote: SocketAddr) {
        if self.active_conn() != Some(conn_id) {
            debug!(role = %self.role, %conn_id, "Dropping message from stale socket");
            return;
        }
        let message = ProtocolMessage::decode(&text);
        info!(role = %self.role, token = message.kind(), "Received message");

        let result = self.machine().handle(message);
        match result {
            Ok(actions) => self.run_actions(actions.into()),
            Err(violation @ ProtocolViolation::Unrecognized(_)) => {
                warn!(role = %self.role, %remote, "{violation}");
            }
            Err(violation) => {
                error!(role = %self.role, %remote, "Protocol violation: {violation}");
            }
        }
    }

    fn on_close(self: Arc<Self>, conn_id: Uuid, reason: Option<io::ErrorKind>) {
        if self.active_conn() != Some(conn_id) {
            debug!(role = %self.role, %conn_id, "Ignoring close of stale socket");
            return;
        }
        info!(role = %self.role, ?reason, "Transport closed by peer");
        self.handle_disconnect();
    }
}

impl NegotiationSink for Inner {
    fn local_description_ready(self: Arc<Self>, sdp: String) {
        let message = self.machine().local_description(sdp);
        self.send_from_signaling(message);
    }

    fn local_candidate_ready(self: Arc<Self>, candidate: String) {
        self.send_from_signaling(ProtocolMessage::Ice(candidate));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use direct_protocol::encode_packet;

    use crate::error::SetupStage;
    use crate::negotiation::LoggingEngine;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Records every engine call. The caller side offers as soon as it
    /// starts; the callee side answers as soon as it sees the offer.
    #[derive(Default)]
    struct ScriptedEngine {
        calls: Mutex<Vec<String>>,
        session: Mutex<Option<(Role, NegotiationHandle)>>,
    }

    impl ScriptedEngine {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn saw(&self, call: &str) -> bool {
            self.calls().iter().any(|c| c == call)
        }
    }

    impl NegotiationEngine for ScriptedEngine {
        fn begin_negotiation(&self, role: Role, handle: NegotiationHandle) {
            self.calls.lock().unwrap().push(format!("begin:{role}"));
            *self.session.lock().unwrap() = Some((role, handle.clone()));
            if role.is_caller() {
                handle.local_description_ready("caller-sdp".into());
                handle.local_candidate_ready("caller-candidate".into());
            }
        }

        fn set_remote_description(&self, sdp: &str) {
            self.calls.lock().unwrap().push(format!("remote:{sdp}"));
            let session = self.session.lock().unwrap().clone();
            if let Some((Role::Callee, handle)) = session {
                handle.local_description_ready("callee-sdp".into());
            }
        }

        fn add_remote_candidate(&self, candidate: &str) {
            self.calls.lock().unwrap().push(format!("candidate:{candidate}"));
        }

        fn close_session(&self) {
            self.calls.lock().unwrap().push("close".into());
        }
    }

    /// Engine whose session teardown takes a while, leaving a window in
    /// which a new caller can be accepted.
    #[derive(Default)]
    struct SlowCloseEngine {
        begun: AtomicUsize,
        closed: AtomicUsize,
    }

    impl NegotiationEngine for SlowCloseEngine {
        fn begin_negotiation(&self, _role: Role, _handle: NegotiationHandle) {
            self.begun.fetch_add(1, Ordering::SeqCst);
        }
        fn set_remote_description(&self, _sdp: &str) {}
        fn add_remote_candidate(&self, _candidate: &str) {}
        fn close_session(&self) {
            thread::sleep(Duration::from_millis(500));
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    fn runtime() -> Arc<ThreadRuntime> {
        let runtime = ThreadRuntime::new().unwrap();
        runtime.initialize().unwrap();
        runtime
    }

    fn shutdown(runtime: &Arc<ThreadRuntime>) {
        runtime.quit();
        runtime.cleanup_socket_server();
    }

    fn write_token(stream: &mut TcpStream, token: &str) {
        stream
            .write_all(&encode_packet(token.as_bytes()).unwrap())
            .unwrap();
    }

    fn read_token(stream: &mut TcpStream) -> String {
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).unwrap();
        let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn local(port: u16) -> PeerAddress {
        PeerAddress {
            host: "127.0.0.1".to_string(),
            port,
            scheme: None,
        }
    }

    fn listening_callee(
        engine: Arc<dyn NegotiationEngine>,
        options: EndpointOptions,
    ) -> (Arc<ThreadRuntime>, Callee, SocketAddr) {
        let runtime = runtime();
        let callee = Callee::new(Arc::clone(&runtime), engine, options);
        let addr = callee.start_listening(0).unwrap();
        assert_eq!(callee.state(), ConnectionState::Listening);
        assert_eq!(callee.local_addr(), Some(addr));
        (runtime, callee, addr)
    }

    fn connect_raw(addr: SocketAddr) -> TcpStream {
        TcpStream::connect(("127.0.0.1", addr.port())).unwrap()
    }

    #[test]
    fn callee_answers_handshake() {
        let engine = Arc::new(ScriptedEngine::default());
        let (runtime, callee, addr) = listening_callee(engine.clone(), EndpointOptions::default());

        let mut peer = connect_raw(addr);
        write_token(&mut peer, "HELLO");
        assert_eq!(read_token(&mut peer), "WELCOME");
        assert!(callee.is_connected());

        write_token(&mut peer, "INIT");
        assert_eq!(read_token(&mut peer), "WAITING");
        // Negotiation began before WAITING was sent
        assert_eq!(engine.calls(), vec!["begin:callee"]);
        assert_eq!(callee.state(), ConnectionState::Negotiating);

        write_token(&mut peer, "OFFER:v=0");
        assert_eq!(read_token(&mut peer), "ANSWER:callee-sdp");
        write_token(&mut peer, "ICE:candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        assert!(wait_until(|| engine.saw("candidate:candidate:1 1 udp 1 10.0.0.1 5000 typ host")));

        shutdown(&runtime);
    }

    #[test]
    fn callee_drops_bad_tokens_without_reply() {
        let engine = Arc::new(ScriptedEngine::default());
        let (runtime, _callee, addr) = listening_callee(engine.clone(), EndpointOptions::default());

        let mut peer = connect_raw(addr);
        // Wrong direction, empty payload, unknown and invalid UTF-8
        write_token(&mut peer, "WAITING");
        write_token(&mut peer, "OFFER:");
        write_token(&mut peer, "PING");
        peer.write_all(&encode_packet(&[0xff, 0xfe]).unwrap()).unwrap();
        write_token(&mut peer, "HELLO");
        assert_eq!(read_token(&mut peer), "WELCOME");
        assert!(engine.calls().is_empty());

        shutdown(&runtime);
    }

    #[test]
    fn caller_drives_handshake_and_offers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let runtime = runtime();
        let engine = Arc::new(ScriptedEngine::default());
        let caller = Caller::new(Arc::clone(&runtime), engine.clone(), EndpointOptions::default());

        caller.connect(local(listener.local_addr().unwrap().port())).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        assert_eq!(read_token(&mut peer), "HELLO");
        write_token(&mut peer, "WELCOME");
        assert_eq!(read_token(&mut peer), "INIT");
        write_token(&mut peer, "WAITING");

        assert_eq!(read_token(&mut peer), "OFFER:caller-sdp");
        assert_eq!(read_token(&mut peer), "ICE:caller-candidate");
        assert_eq!(caller.state(), ConnectionState::Negotiating);

        write_token(&mut peer, "ANSWER:answer-sdp");
        assert!(wait_until(|| engine.saw("remote:answer-sdp")));

        shutdown(&runtime);
    }

    #[test]
    fn caller_connect_failure_reports_stage() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let runtime = runtime();
        let caller = Caller::new(Arc::clone(&runtime), LoggingEngine::new(), EndpointOptions::default());

        let err = caller.connect(local(port)).unwrap_err();
        assert_eq!(err.stage(), Some(SetupStage::Connect));
        assert!(err.errno().is_some());
        assert_eq!(caller.state(), ConnectionState::Disconnected);
        assert!(matches!(caller.hang_up(), Err(SessionError::NotConnected)));

        shutdown(&runtime);
    }

    #[test]
    fn full_session_ends_with_bye_ok() {
        let callee_engine = Arc::new(ScriptedEngine::default());
        let (callee_rt, callee, addr) =
            listening_callee(callee_engine.clone(), EndpointOptions::default());

        let caller_rt = runtime();
        let caller_engine = Arc::new(ScriptedEngine::default());
        let caller = Caller::new(
            Arc::clone(&caller_rt),
            caller_engine.clone(),
            EndpointOptions::default(),
        );
        caller.connect(local(addr.port())).unwrap();

        assert!(wait_until(|| {
            caller.state() == ConnectionState::Negotiating
                && callee.state() == ConnectionState::Negotiating
        }));
        assert!(wait_until(|| {
            callee_engine.saw("remote:caller-sdp")
                && callee_engine.saw("candidate:caller-candidate")
                && caller_engine.saw("remote:callee-sdp")
        }));
        assert_eq!(caller_engine.calls()[0], "begin:caller");
        assert_eq!(callee_engine.calls()[0], "begin:callee");

        caller.hang_up().unwrap();
        assert!(wait_until(|| caller_rt.should_quit()));
        assert!(wait_until(|| callee.state() == ConnectionState::Listening));
        assert!(callee_engine.saw("close"));
        assert_eq!(callee.disconnects_handled(), 0);

        // The listener survives the session
        let mut client = connect_raw(addr);
        write_token(&mut client, "HELLO");
        assert_eq!(read_token(&mut client), "WELCOME");

        shutdown(&caller_rt);
        shutdown(&callee_rt);
    }

    #[test]
    fn counting_exchange_runs_to_completion() {
        let options = EndpointOptions {
            counting: Some(CountingLimits {
                max_ice_candidates: 3,
                max_sdp_fragments: 2,
            }),
            ..EndpointOptions::default()
        };
        let (callee_rt, callee, addr) = listening_callee(LoggingEngine::new(), options.clone());
        let caller_rt = runtime();
        let caller = Caller::new(Arc::clone(&caller_rt), LoggingEngine::new(), options);
        caller.connect(local(addr.port())).unwrap();

        assert!(wait_until(|| caller_rt.should_quit()));
        assert!(wait_until(|| callee.state() == ConnectionState::Listening));
        assert_eq!(
            callee.counters(),
            SequenceCounters {
                ice_sent: 3,
                ice_received: 3,
                sdp_sent: 2,
                sdp_received: 2,
            }
        );

        shutdown(&caller_rt);
        shutdown(&callee_rt);
    }

    #[test]
    fn new_connection_replaces_old_one() {
        let (runtime, callee, addr) =
            listening_callee(LoggingEngine::new(), EndpointOptions::default());

        let mut first = connect_raw(addr);
        write_token(&mut first, "HELLO");
        assert_eq!(read_token(&mut first), "WELCOME");

        let mut second = connect_raw(addr);
        write_token(&mut second, "HELLO");
        assert_eq!(read_token(&mut second), "WELCOME");

        // The first connection was closed by the callee, not counted as a drop
        first.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(first.read(&mut buf).unwrap_or(0), 0);
        assert_eq!(callee.disconnects_handled(), 0);
        assert!(callee.is_connected());

        shutdown(&runtime);
    }

    #[test]
    fn bye_teardown_leaves_replacement_connection_open() {
        let engine = Arc::new(SlowCloseEngine::default());
        let (runtime, callee, addr) = listening_callee(engine.clone(), EndpointOptions::default());

        let mut first = connect_raw(addr);
        write_token(&mut first, "HELLO");
        assert_eq!(read_token(&mut first), "WELCOME");
        write_token(&mut first, "BYE");
        assert_eq!(read_token(&mut first), "OK");

        // Accepted while the engine is still closing the first session
        let mut second = connect_raw(addr);
        write_token(&mut second, "HELLO");
        assert_eq!(read_token(&mut second), "WELCOME");
        assert_eq!(engine.closed.load(Ordering::SeqCst), 0);

        // INIT queues behind the teardown on the signaling thread, so
        // WAITING only arrives once the first session is closed and the
        // close of the first transport has been queued on the network thread.
        write_token(&mut second, "INIT");
        assert_eq!(read_token(&mut second), "WAITING");
        assert_eq!(engine.closed.load(Ordering::SeqCst), 1);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(engine.begun.load(Ordering::SeqCst), 1);
        assert!(callee.is_connected());
        assert_eq!(callee.state(), ConnectionState::Negotiating);

        write_token(&mut second, "OFFER:v=0");
        write_token(&mut second, "HELLO");
        assert_eq!(read_token(&mut second), "WELCOME");

        shutdown(&runtime);
    }

    #[test]
    fn restart_renegotiates_without_dropping_the_caller() {
        let engine = Arc::new(ScriptedEngine::default());
        let (runtime, callee, addr) = listening_callee(engine.clone(), EndpointOptions::default());

        let mut peer = connect_raw(addr);
        write_token(&mut peer, "HELLO");
        assert_eq!(read_token(&mut peer), "WELCOME");
        write_token(&mut peer, "INIT");
        assert_eq!(read_token(&mut peer), "WAITING");

        write_token(&mut peer, "RESTART");
        assert_eq!(read_token(&mut peer), "WAITING");
        assert_eq!(engine.calls(), vec!["begin:callee", "close", "begin:callee"]);
        assert!(callee.is_connected());
        assert_eq!(callee.disconnects_handled(), 0);

        shutdown(&runtime);
    }

    #[test]
    fn callee_waits_for_next_caller_after_drop() {
        let engine = Arc::new(ScriptedEngine::default());
        let (runtime, callee, addr) = listening_callee(engine.clone(), EndpointOptions::default());

        let mut peer = connect_raw(addr);
        write_token(&mut peer, "HELLO");
        assert_eq!(read_token(&mut peer), "WELCOME");
        drop(peer);

        assert!(wait_until(|| callee.disconnects_handled() == 1));
        assert!(wait_until(|| callee.state() == ConnectionState::Listening));
        assert!(wait_until(|| engine.saw("close")));
        assert!(!callee.is_connected());
        assert_eq!(callee.reconnect_attempts(), 0);
        assert_eq!(runtime.network().pending_delayed(), 0);

        let mut next = connect_raw(addr);
        write_token(&mut next, "HELLO");
        assert_eq!(read_token(&mut next), "WELCOME");

        shutdown(&runtime);
    }

    #[test]
    fn concurrent_disconnect_reports_tear_down_once() {
        let (runtime, callee, addr) =
            listening_callee(LoggingEngine::new(), EndpointOptions::default());
        let mut peer = connect_raw(addr);
        write_token(&mut peer, "HELLO");
        assert_eq!(read_token(&mut peer), "WELCOME");

        let callee = Arc::new(callee);
        let reporters: Vec<_> = (0..2)
            .map(|_| {
                let callee = Arc::clone(&callee);
                thread::spawn(move || callee.handle_disconnect())
            })
            .collect();
        for reporter in reporters {
            reporter.join().unwrap();
        }

        assert!(wait_until(|| callee.disconnects_handled() == 1));
        // The peer sees the close; its own EOF must not count again
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap_or(0), 0);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(callee.disconnects_handled(), 1);
        assert_eq!(callee.state(), ConnectionState::Listening);

        shutdown(&runtime);
    }

    fn fast_retry(max_attempts: u32) -> EndpointOptions {
        EndpointOptions {
            reconnect: ReconnectPolicy {
                enabled: true,
                max_attempts,
                delay: Duration::from_millis(20),
            },
            ..EndpointOptions::default()
        }
    }

    #[test]
    fn caller_reconnects_when_callee_returns() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let runtime = runtime();
        let caller = Caller::new(Arc::clone(&runtime), LoggingEngine::new(), fast_retry(5));
        caller.connect(local(listener.local_addr().unwrap().port())).unwrap();

        let (mut first, _) = listener.accept().unwrap();
        assert_eq!(read_token(&mut first), "HELLO");
        drop(first);

        let (mut second, _) = listener.accept().unwrap();
        assert_eq!(read_token(&mut second), "HELLO");
        assert!(wait_until(|| caller.reconnect_attempts() == 0 && caller.is_connected()));
        assert_eq!(caller.disconnects_handled(), 1);

        shutdown(&runtime);
    }

    #[test]
    fn caller_gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let runtime = runtime();
        let caller = Caller::new(Arc::clone(&runtime), LoggingEngine::new(), fast_retry(5));
        caller.connect(local(listener.local_addr().unwrap().port())).unwrap();

        let (mut peer, _) = listener.accept().unwrap();
        assert_eq!(read_token(&mut peer), "HELLO");
        drop(listener);
        drop(peer);

        assert!(wait_until(|| {
            caller.reconnect_attempts() == 5 && runtime.network().pending_delayed() == 0
        }));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(caller.reconnect_attempts(), 5);
        assert_eq!(runtime.network().pending_delayed(), 0);
        assert_eq!(caller.disconnects_handled(), 1);
        assert_eq!(caller.state(), ConnectionState::Disconnected);

        shutdown(&runtime);
    }

    #[test]
    fn reconnect_attempts_wait_for_the_delay() {
        let delay = Duration::from_millis(150);
        let options = EndpointOptions {
            reconnect: ReconnectPolicy {
                enabled: true,
                max_attempts: 5,
                delay,
            },
            ..EndpointOptions::default()
        };
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let runtime = runtime();
        let caller = Caller::new(Arc::clone(&runtime), LoggingEngine::new(), options);
        caller.connect(local(listener.local_addr().unwrap().port())).unwrap();

        let (mut peer, _) = listener.accept().unwrap();
        assert_eq!(read_token(&mut peer), "HELLO");
        for _ in 0..3 {
            let dropped_at = Instant::now();
            drop(peer);
            let (mut next, _) = listener.accept().unwrap();
            let gap = dropped_at.elapsed();
            assert!(gap >= delay, "re-dialed after {gap:?}, expected at least {delay:?}");
            assert_eq!(read_token(&mut next), "HELLO");
            peer = next;
        }

        // Failed attempts are spaced the same way: five of them take at
        // least five delays.
        let dropped_at = Instant::now();
        drop(listener);
        drop(peer);
        assert!(wait_until(|| {
            caller.reconnect_attempts() == 5 && runtime.network().pending_delayed() == 0
        }));
        let elapsed = dropped_at.elapsed();
        assert!(elapsed >= delay * 5, "five attempts took only {elapsed:?}");

        shutdown(&runtime);
    }

    #[test]
    fn disabled_reconnect_stays_down() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let runtime = runtime();
        let mut options = fast_retry(5);
        options.reconnect.enabled = false;
        let caller = Caller::new(Arc::clone(&runtime), LoggingEngine::new(), options);
        caller.connect(local(listener.local_addr().unwrap().port())).unwrap();

        let (mut peer, _) = listener.accept().unwrap();
        assert_eq!(read_token(&mut peer), "HELLO");
        drop(peer);

        assert!(wait_until(|| caller.disconnects_handled() == 1));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(caller.reconnect_attempts(), 0);
        assert_eq!(runtime.network().pending_delayed(), 0);

        shutdown(&runtime);
    }
}
