//! In-memory sockets and control sessions for driving a [`ProxySession`]
//! event by event.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::{RouteConfig, SessionConfig, TargetConfig};
use crate::grip::control::{ControlManager, ControlSession};
use crate::net::connection::SessionId;
use crate::routing::RouteTable;
use crate::security::headers::ForwardingEnricher;
use crate::session::events::{EventSink, SessionEvent, SocketEvent, Source};
use crate::session::{ProxySession, SessionContext, SessionSettings};
use crate::transport::frame::Frame;
use crate::transport::socket::{
    ConnectRequest, FrameSocket, InboundSocket, OutboundSocket, Rejection, RequestData,
    SocketFactory, SocketState,
};

#[derive(Debug, Default)]
pub struct MockState {
    pub state: Option<SocketState>,
    pub incoming: VecDeque<Frame>,
    pub written: Vec<Frame>,
    pub close_calls: usize,
    pub accepted: Option<(String, HeaderMap)>,
    pub rejected: Option<Rejection>,
    pub connect: Option<ConnectRequest>,
    pub dropped: bool,
}

/// Test-side view of a mock socket.
#[derive(Debug, Clone, Default)]
pub struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    pub fn push(&self, frame: Frame) {
        self.with(|s| s.incoming.push_back(frame));
    }

    pub fn set_state(&self, state: SocketState) {
        self.with(|s| s.state = Some(state));
    }

    pub fn state(&self) -> SocketState {
        self.with(|s| s.state.unwrap_or(SocketState::Idle))
    }

    pub fn written(&self) -> Vec<Frame> {
        self.with(|s| s.written.clone())
    }

    pub fn buffered(&self) -> usize {
        self.with(|s| s.incoming.len())
    }

    pub fn close_calls(&self) -> usize {
        self.with(|s| s.close_calls)
    }

    pub fn rejected(&self) -> Option<Rejection> {
        self.with(|s| s.rejected.clone())
    }

    pub fn accepted(&self) -> Option<(String, HeaderMap)> {
        self.with(|s| s.accepted.clone())
    }

    pub fn connect_request(&self) -> Option<ConnectRequest> {
        self.with(|s| s.connect.clone())
    }

    pub fn is_dropped(&self) -> bool {
        self.with(|s| s.dropped)
    }
}

struct MockSocket {
    handle: MockHandle,
}

impl FrameSocket for MockSocket {
    fn state(&self) -> SocketState {
        self.handle.state()
    }

    fn frames_available(&self) -> usize {
        self.handle.buffered()
    }

    fn read_frame(&mut self) -> Option<Frame> {
        self.handle.with(|s| s.incoming.pop_front())
    }

    fn write_frame(&mut self, frame: Frame) {
        self.handle.with(|s| s.written.push(frame));
    }

    fn close(&mut self) {
        self.handle.with(|s| {
            s.close_calls += 1;
            s.state = Some(SocketState::Closing);
        });
    }
}

impl Drop for MockSocket {
    fn drop(&mut self) {
        self.handle.with(|s| s.dropped = true);
    }
}

pub struct MockInbound {
    socket: MockSocket,
    request: RequestData,
    peer: Option<IpAddr>,
}

impl MockInbound {
    pub fn new(uri: &str, peer: Option<IpAddr>) -> (Self, MockHandle) {
        let handle = MockHandle::default();
        handle.set_state(SocketState::Connecting);
        let request = RequestData {
            uri: uri.parse().unwrap(),
            headers: HeaderMap::new(),
        };
        let sock = Self {
            socket: MockSocket {
                handle: handle.clone(),
            },
            request,
            peer,
        };
        (sock, handle)
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.request
            .headers
            .append(name, HeaderValue::from_static(value));
        self
    }
}

impl FrameSocket for MockInbound {
    fn state(&self) -> SocketState {
        self.socket.state()
    }
    fn frames_available(&self) -> usize {
        self.socket.frames_available()
    }
    fn read_frame(&mut self) -> Option<Frame> {
        self.socket.read_frame()
    }
    fn write_frame(&mut self, frame: Frame) {
        self.socket.write_frame(frame)
    }
    fn close(&mut self) {
        self.socket.close()
    }
}

impl InboundSocket for MockInbound {
    fn request(&self) -> &RequestData {
        &self.request
    }

    fn peer_address(&self) -> Option<IpAddr> {
        self.peer
    }

    fn respond_success(&mut self, reason: &str, headers: HeaderMap) {
        self.socket.handle.with(|s| {
            s.accepted = Some((reason.to_string(), headers));
            s.state = Some(SocketState::Connected);
        });
    }

    fn respond_error(&mut self, rejection: Rejection) {
        self.socket.handle.with(|s| {
            s.rejected = Some(rejection);
            s.state = Some(SocketState::Closing);
        });
    }
}

struct MockOutbound {
    socket: MockSocket,
}

impl FrameSocket for MockOutbound {
    fn state(&self) -> SocketState {
        self.socket.state()
    }
    fn frames_available(&self) -> usize {
        self.socket.frames_available()
    }
    fn read_frame(&mut self) -> Option<Frame> {
        self.socket.read_frame()
    }
    fn write_frame(&mut self, frame: Frame) {
        self.socket.write_frame(frame)
    }
    fn close(&mut self) {
        self.socket.close()
    }
}

impl OutboundSocket for MockOutbound {
    fn start(&mut self, request: ConnectRequest) {
        self.socket.handle.with(|s| {
            s.connect = Some(request);
            s.state = Some(SocketState::Connecting);
        });
    }
}

/// Records every outbound socket a session creates.
#[derive(Clone, Default)]
pub struct MockFactory {
    created: Arc<Mutex<Vec<(MockHandle, Source)>>>,
}

impl MockFactory {
    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Handle of the `n`th socket created (0-based).
    pub fn socket(&self, n: usize) -> MockHandle {
        self.created.lock().unwrap()[n].0.clone()
    }

    pub fn source(&self, n: usize) -> Source {
        self.created.lock().unwrap()[n].1
    }
}

impl SocketFactory for MockFactory {
    fn create_socket(&self, events: EventSink) -> Box<dyn OutboundSocket> {
        let handle = MockHandle::default();
        self.created
            .lock()
            .unwrap()
            .push((handle.clone(), events.source()));
        Box::new(MockOutbound {
            socket: MockSocket { handle },
        })
    }
}

/// Control manager recording started sessions and forwarded messages.
#[derive(Clone, Default)]
pub struct MockControl {
    pub started: Arc<Mutex<usize>>,
    pub messages: Arc<Mutex<Vec<Bytes>>>,
    pub live: Arc<Mutex<usize>>,
}

struct MockControlSession {
    control: MockControl,
}

impl ControlSession for MockControlSession {
    fn start(&mut self) {
        *self.control.started.lock().unwrap() += 1;
    }

    fn send_grip_message(&mut self, message: Bytes) {
        self.control.messages.lock().unwrap().push(message);
    }
}

impl Drop for MockControlSession {
    fn drop(&mut self) {
        *self.control.live.lock().unwrap() -= 1;
    }
}

impl ControlManager for MockControl {
    fn create_session(&self, _events: EventSink) -> Box<dyn ControlSession> {
        *self.live.lock().unwrap() += 1;
        Box::new(MockControlSession {
            control: self.clone(),
        })
    }
}

impl MockControl {
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .collect()
    }

    pub fn live(&self) -> usize {
        *self.live.lock().unwrap()
    }
}

pub fn target(port: u16) -> TargetConfig {
    TargetConfig {
        connect_host: "127.0.0.1".into(),
        connect_port: port,
        host: None,
        secure: false,
        trusted: false,
        insecure: false,
        sub_channel: None,
    }
}

pub fn route(host: &str, targets: Vec<TargetConfig>) -> RouteConfig {
    RouteConfig {
        name: host.to_string(),
        host: Some(host.to_string()),
        path_prefix: None,
        secure: None,
        priority: 0,
        channel_prefix: "chan-".into(),
        sig_iss: None,
        sig_key: None,
        targets,
    }
}

/// A session wired to mocks.
pub struct Harness {
    pub session: ProxySession,
    pub inbox: mpsc::UnboundedReceiver<SessionEvent>,
    pub factory: MockFactory,
    pub control: MockControl,
}

impl Harness {
    pub fn new(routes: Vec<RouteConfig>, with_control: bool) -> Self {
        let factory = MockFactory::default();
        let control = MockControl::default();
        let context = SessionContext {
            routes: Arc::new(ArcSwap::from_pointee(RouteTable::from_config(routes))),
            enricher: Arc::new(ForwardingEnricher::from_config(&SessionConfig::default())),
            sockets: Arc::new(factory.clone()),
            control: with_control.then(|| Arc::new(control.clone()) as Arc<dyn ControlManager>),
            settings: SessionSettings::default(),
        };
        let (session, inbox) = ProxySession::new(SessionId::new(), context);
        Self {
            session,
            inbox,
            factory,
            control,
        }
    }

    /// Start with a client request for `uri`, returning the client handle.
    pub fn start(&mut self, uri: &str) -> MockHandle {
        let (sock, handle) = MockInbound::new(uri, "192.0.2.1".parse().ok());
        self.session.start(Box::new(sock));
        handle
    }

    pub fn inbound(&mut self, event: SocketEvent) {
        self.session.handle(SessionEvent::Socket {
            source: Source::Inbound,
            event,
        });
    }

    /// Deliver an event from the `n`th outbound socket (0-based).
    pub fn outbound(&mut self, n: usize, event: SocketEvent) {
        let source = self.factory.source(n);
        self.session.handle(SessionEvent::Socket { source, event });
    }

    /// Mark outbound `n` connected and deliver the handshake.
    pub fn connect(&mut self, n: usize, headers: HeaderMap) {
        self.factory.socket(n).set_state(SocketState::Connected);
        self.outbound(
            n,
            SocketEvent::Connected(crate::transport::socket::HandshakeResponse {
                reason: "Switching Protocols".into(),
                headers,
            }),
        );
    }
}
