//! Per-connection WebSocket proxy session.
//!
//! # Responsibilities
//! - Resolve the inbound request to a route and prepare the outbound request
//! - Connect to the route's targets in order, failing over on network errors
//! - Relay frames both ways under per-direction flow control
//! - Attach the grip control bridge and honor its send/detach events
//! - Tear down both sockets and report completion exactly once
//!
//! # Data Flow
//! ```text
//! inbound socket ─┐                         ┌─ outbound socket (attempt N)
//!   events        ├─→ inbox ─→ ProxySession ┤
//! control session ┘     (one at a time)     └─ ControlBridge
//! ```
//!
//! # Design Decisions
//! - Every notification is a [`SessionEvent`] handled sequentially, so the
//!   session owns all its state without locks
//! - Outbound events carry their connect attempt; events from a discarded
//!   attempt are ignored
//! - States only move forward: Idle → Connecting → Connected → Closing

pub mod events;
pub mod relay;
pub mod targets;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::http::header::SEC_WEBSOCKET_EXTENSIONS;
use axum::http::HeaderValue;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::config::SessionConfig;
use crate::grip::bridge::{message_prefix_for, ControlBridge};
use crate::grip::control::ControlManager;
use crate::grip::extension::{find_in_headers, GRIP_EXTENSION};
use crate::net::connection::SessionId;
use crate::observability::metrics;
use crate::routing::{RouteTable, Target};
use crate::security::headers::{HeaderEnricher, SigningIdentity};
use crate::transport::frame::Frame;
use crate::transport::socket::{
    ConnectRequest, HandshakeResponse, InboundSocket, OutboundSocket, Rejection, RequestData,
    SocketError, SocketFactory, SocketState,
};

use self::events::{ControlEvent, EventSink, SessionEvent, SocketEvent, Source};
use self::relay::{Disposition, MessageTracker, PendingCounter};
use self::targets::TargetSequencer;

const ORIGIN_ERROR: &str = "Error while proxying to origin.";

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closing,
}

/// Tunables shared by all sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_pending_frames: usize,
    pub default_signing: Option<SigningIdentity>,
}

impl SessionSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        let default_signing = match (&config.sig_iss, &config.sig_key) {
            (Some(iss), Some(key)) => Some(SigningIdentity {
                iss: iss.clone(),
                key: key.clone(),
            }),
            _ => None,
        };
        Self {
            max_pending_frames: config.max_pending_frames,
            default_signing,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_pending_frames: relay::PENDING_FRAMES_MAX,
            default_signing: None,
        }
    }
}

/// Read-only collaborators shared by all sessions.
#[derive(Clone)]
pub struct SessionContext {
    pub routes: Arc<ArcSwap<RouteTable>>,
    pub enricher: Arc<dyn HeaderEnricher>,
    pub sockets: Arc<dyn SocketFactory>,
    pub control: Option<Arc<dyn ControlManager>>,
    pub settings: SessionSettings,
}

/// Reported to the owner when a session completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub detached: bool,
    pub frames_to_client: u64,
    pub frames_to_backend: u64,
}

/// One inbound connection proxied to at most one outbound connection.
pub struct ProxySession {
    id: SessionId,
    context: SessionContext,
    state: SessionState,
    events: mpsc::UnboundedSender<SessionEvent>,

    in_sock: Option<Box<dyn InboundSocket>>,
    out_sock: Option<Box<dyn OutboundSocket>>,
    attempt: u64,

    request: RequestData,
    channel_prefix: String,
    targets: TargetSequencer,
    sub_channel: Option<String>,

    bridge: Option<ControlBridge>,
    detached: bool,

    /// Unacknowledged writes to the client.
    to_client: PendingCounter,
    /// Unacknowledged writes to the backend.
    to_backend: PendingCounter,
    upstream_message: MessageTracker,
    /// Frames pushed by the control channel awaiting client capacity, at
    /// most `max_pending_frames`.
    pushed: VecDeque<Frame>,

    frames_to_client: u64,
    frames_to_backend: u64,
    completion: Option<oneshot::Sender<SessionSummary>>,
    finished: bool,
}

impl ProxySession {
    /// Create a session and the inbox its sockets report to.
    pub fn new(id: SessionId, context: SessionContext) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, inbox) = mpsc::unbounded_channel();
        let max_pending = context.settings.max_pending_frames;
        let session = Self {
            id,
            context,
            state: SessionState::Idle,
            events,
            in_sock: None,
            out_sock: None,
            attempt: 0,
            request: RequestData::default(),
            channel_prefix: String::new(),
            targets: TargetSequencer::default(),
            sub_channel: None,
            bridge: None,
            detached: false,
            to_client: PendingCounter::new(max_pending),
            to_backend: PendingCounter::new(max_pending),
            upstream_message: MessageTracker::default(),
            pushed: VecDeque::new(),
            frames_to_client: 0,
            frames_to_backend: 0,
            completion: None,
            finished: false,
        };
        (session, inbox)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn channel_prefix(&self) -> &str {
        &self.channel_prefix
    }

    /// Message prefix of the attached bridge, if any.
    pub fn message_prefix(&self) -> Option<&[u8]> {
        self.bridge.as_ref().map(ControlBridge::message_prefix)
    }

    pub fn pending_to_client(&self) -> usize {
        self.to_client.pending()
    }

    pub fn pending_to_backend(&self) -> usize {
        self.to_backend.pending()
    }

    /// Control-channel frames not yet written to the client.
    pub fn queued_pushes(&self) -> usize {
        self.pushed.len()
    }

    /// Sink for the inbound socket's notifications.
    pub fn inbound_sink(&self) -> EventSink {
        EventSink::new(self.events.clone(), Source::Inbound)
    }

    /// Receiver fired once, after both connections are released.
    pub fn on_finished(&mut self) -> oneshot::Receiver<SessionSummary> {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        rx
    }

    /// Take ownership of an accepted inbound connection and begin proxying.
    pub fn start(&mut self, sock: Box<dyn InboundSocket>) {
        if self.state != SessionState::Idle {
            tracing::warn!(session_id = %self.id, "Session already started");
            return;
        }

        self.state = SessionState::Connecting;
        self.request = sock.request().clone();
        let peer = sock.peer_address();
        self.in_sock = Some(sock);
        metrics::record_session_started();

        let host = self.request.uri.host().unwrap_or_default().to_string();
        let secure = self.request.uri.scheme_str() == Some("wss");
        let path = self.request.uri.path().to_string();

        let routes = self.context.routes.load();
        let Some(entry) = routes.resolve(secure, &host, &path).cloned() else {
            tracing::warn!(session_id = %self.id, host = %host, "No route for host");
            self.reject(Rejection::bad_gateway(&format!("No route for host: {}", host)));
            return;
        };
        drop(routes);

        let signing = SigningIdentity::resolve(&entry, self.context.settings.default_signing.as_ref());

        self.channel_prefix = entry.channel_prefix.clone();
        self.targets = TargetSequencer::new(entry.targets.iter().cloned());

        let trusted = self
            .context
            .enricher
            .enrich(&mut self.request, &entry, signing.as_ref(), peer);

        tracing::debug!(
            session_id = %self.id,
            host = %host,
            route = %entry.name,
            targets = self.targets.remaining(),
            trusted_client = trusted,
            "Route resolved"
        );

        // unknown extensions are not proxied; offer grip instead
        self.request.headers.remove(SEC_WEBSOCKET_EXTENSIONS);
        self.request
            .headers
            .insert(SEC_WEBSOCKET_EXTENSIONS, HeaderValue::from_static(GRIP_EXTENSION));

        self.try_next_target();
    }

    /// Drive the session from its inbox until it finishes.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionEvent>) -> SessionSummary {
        while !self.finished {
            match inbox.recv().await {
                Some(event) => self.handle(event),
                None => break,
            }
        }
        self.summary()
    }

    /// Handle one inbox event.
    pub fn handle(&mut self, event: SessionEvent) {
        if self.finished {
            return;
        }

        match event {
            SessionEvent::Socket {
                source: Source::Inbound,
                event,
            } => {
                if self.in_sock.is_some() {
                    self.on_inbound(event);
                }
            }
            SessionEvent::Socket {
                source: Source::Outbound(attempt),
                event,
            } => {
                if attempt == self.attempt && self.out_sock.is_some() {
                    self.on_outbound(event);
                } else {
                    tracing::trace!(session_id = %self.id, attempt, "Ignoring event from discarded socket");
                }
            }
            SessionEvent::Socket {
                source: Source::Control,
                ..
            } => {}
            SessionEvent::Control(event) => {
                if self.bridge.is_some() {
                    self.on_control(event);
                }
            }
        }
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            detached: self.detached,
            frames_to_client: self.frames_to_client,
            frames_to_backend: self.frames_to_backend,
        }
    }

    fn begin_closing(&mut self) {
        self.state = SessionState::Closing;
    }

    fn reject(&mut self, rejection: Rejection) {
        debug_assert_eq!(self.state, SessionState::Connecting);

        self.begin_closing();
        metrics::record_rejection(rejection.status.as_u16());
        if let Some(sock) = self.in_sock.as_mut() {
            sock.respond_error(rejection);
        }
    }

    fn try_next_target(&mut self) {
        let Some(target) = self.targets.next() else {
            self.reject(Rejection::bad_gateway(ORIGIN_ERROR));
            return;
        };

        let Some(uri) = outbound_uri(&self.request, &target) else {
            tracing::warn!(session_id = %self.id, uri = %self.request.uri, "Cannot build outbound URI");
            self.reject(Rejection::bad_gateway(ORIGIN_ERROR));
            return;
        };

        self.sub_channel = target.sub_channel.clone();
        self.attempt += 1;

        tracing::debug!(
            session_id = %self.id,
            connect_host = %target.connect_host,
            connect_port = target.connect_port,
            attempt = self.attempt,
            "Forwarding to target"
        );

        let sink = EventSink::new(self.events.clone(), Source::Outbound(self.attempt));
        let mut sock = self.context.sockets.create_socket(sink);
        sock.start(ConnectRequest {
            uri,
            headers: self.request.headers.clone(),
            connect_host: target.connect_host,
            connect_port: target.connect_port,
            ignore_policies: target.trusted,
            ignore_tls_errors: target.insecure,
        });
        self.out_sock = Some(sock);
    }

    fn try_read_in(&mut self) {
        let Some(in_sock) = self.in_sock.as_deref_mut() else {
            return;
        };

        if self.detached {
            relay::drain(in_sock);
            return;
        }

        let Some(out_sock) = self.out_sock.as_deref_mut() else {
            return;
        };

        let written = relay::pump(in_sock, out_sock, &mut self.to_backend, Some);
        if written > 0 {
            self.frames_to_backend += written as u64;
            metrics::record_frames_relayed("to_backend", written);
        }
    }

    fn try_read_out(&mut self) {
        let Some(out_sock) = self.out_sock.as_deref_mut() else {
            return;
        };

        if self.detached {
            relay::drain(out_sock);
            return;
        }

        let Some(in_sock) = self.in_sock.as_deref_mut() else {
            return;
        };

        let tracker = &mut self.upstream_message;
        let prefix = self.bridge.as_ref().map(ControlBridge::message_prefix);
        let mut control_messages = Vec::new();

        let written = relay::pump(out_sock, in_sock, &mut self.to_client, |frame| {
            match relay::route_upstream_frame(&frame, tracker, prefix) {
                Disposition::Forward => Some(frame),
                Disposition::Suppress => None,
                Disposition::Control(message) => {
                    control_messages.push(message);
                    None
                }
            }
        });

        if written > 0 {
            self.frames_to_client += written as u64;
            metrics::record_frames_relayed("to_client", written);
        }

        if let Some(bridge) = self.bridge.as_mut() {
            for message in control_messages {
                bridge.send_grip_message(message);
            }
        }

        self.flush_pushed();
    }

    /// Write control-channel frames to the client, between relayed messages only.
    fn flush_pushed(&mut self) {
        if !self.upstream_message.is_idle() {
            return;
        }

        let Some(in_sock) = self.in_sock.as_deref_mut() else {
            self.pushed.clear();
            return;
        };

        while self.to_client.has_capacity() {
            let Some(frame) = self.pushed.pop_front() else {
                break;
            };
            in_sock.write_frame(frame);
            self.to_client.record_write();
            self.frames_to_client += 1;
        }
    }

    fn try_finish(&mut self) {
        if self.finished || self.in_sock.is_some() || self.out_sock.is_some() {
            return;
        }

        self.finished = true;
        self.begin_closing();
        self.bridge = None;
        self.pushed.clear();

        let summary = self.summary();
        tracing::debug!(
            session_id = %self.id,
            detached = summary.detached,
            frames_to_client = summary.frames_to_client,
            frames_to_backend = summary.frames_to_backend,
            "Session finished"
        );
        metrics::record_session_finished();

        if let Some(tx) = self.completion.take() {
            let _ = tx.send(summary);
        }
    }

    fn out_is_open(&self) -> bool {
        self.out_sock
            .as_ref()
            .is_some_and(|s| s.state() != SocketState::Closing)
    }

    fn in_is_open(&self) -> bool {
        self.in_sock
            .as_ref()
            .is_some_and(|s| s.state() != SocketState::Closing)
    }

    fn close_out(&mut self) {
        if let Some(sock) = self.out_sock.as_mut() {
            sock.close();
        }
    }

    fn close_in(&mut self) {
        if let Some(sock) = self.in_sock.as_mut() {
            sock.close();
        }
    }

    fn on_inbound(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::ReadyRead => {
                let out_connected = self
                    .out_sock
                    .as_ref()
                    .is_some_and(|s| s.state() == SocketState::Connected);
                if self.detached || out_connected {
                    self.try_read_in();
                }
            }
            SocketEvent::FramesWritten(count) => {
                self.to_client.acknowledge(count);
                self.flush_pushed();
                if !self.detached {
                    self.try_read_out();
                }
            }
            SocketEvent::PeerClosed => {
                if !self.detached && self.out_is_open() {
                    self.close_out();
                }
            }
            SocketEvent::Closed => {
                self.in_sock = None;
                self.begin_closing();
                if !self.detached && self.out_is_open() {
                    self.close_out();
                }
                self.try_finish();
            }
            SocketEvent::Error(e) => {
                tracing::debug!(session_id = %self.id, error = %e, "Client connection error");
                self.in_sock = None;
                if !self.detached {
                    self.out_sock = None;
                }
                self.begin_closing();
                self.try_finish();
            }
            SocketEvent::Connected(_) => {}
        }
    }

    fn on_outbound(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Connected(response) => self.on_connected(response),
            SocketEvent::ReadyRead => self.try_read_out(),
            SocketEvent::FramesWritten(count) => {
                self.to_backend.acknowledge(count);
                if !self.detached {
                    self.try_read_in();
                }
            }
            SocketEvent::PeerClosed => {
                if !self.detached && self.in_is_open() {
                    self.close_in();
                }
            }
            SocketEvent::Closed => {
                self.out_sock = None;
                if !self.detached && self.in_is_open() {
                    self.close_in();
                }
                self.begin_closing();
                self.try_finish();
            }
            SocketEvent::Error(e) => self.on_outbound_error(e),
        }
    }

    fn on_outbound_error(&mut self, error: SocketError) {
        tracing::debug!(
            session_id = %self.id,
            state = ?self.state,
            error = %error,
            "Target error"
        );

        if self.detached {
            self.out_sock = None;
            self.try_finish();
            return;
        }

        if self.state == SessionState::Connecting {
            self.out_sock = None;
            metrics::record_connect_attempt(connect_result_label(&error));

            if error.is_retryable() {
                self.try_next_target();
                return;
            }

            match error {
                SocketError::Rejected(rejection) => self.reject(rejection),
                _ => self.reject(Rejection::bad_gateway(ORIGIN_ERROR)),
            }
        } else {
            self.in_sock = None;
            self.out_sock = None;
            self.begin_closing();
            self.try_finish();
        }
    }

    fn on_connected(&mut self, response: HandshakeResponse) {
        if self.state != SessionState::Connecting || self.in_sock.is_none() {
            // the client is gone; the outbound close already issued finishes teardown
            tracing::debug!(session_id = %self.id, state = ?self.state, "Ignoring connect of closing session");
            return;
        }

        tracing::debug!(session_id = %self.id, attempt = self.attempt, "Connected");
        metrics::record_connect_attempt("connected");

        self.state = SessionState::Connected;

        let HandshakeResponse { reason, mut headers } = response;

        // extensions are negotiated per hop
        let grip = find_in_headers(&headers, GRIP_EXTENSION);
        headers.remove(SEC_WEBSOCKET_EXTENSIONS);

        if grip.is_some() || self.sub_channel.is_some() {
            let prefix = message_prefix_for(grip.as_ref());
            tracing::debug!(
                session_id = %self.id,
                message_prefix = %String::from_utf8_lossy(&prefix),
                "Grip enabled"
            );

            if let Some(manager) = self.context.control.clone() {
                let sink = EventSink::new(self.events.clone(), Source::Control);
                let mut bridge = ControlBridge::attach(manager.as_ref(), sink, prefix);

                if let Some(channel) = &self.sub_channel {
                    tracing::debug!(session_id = %self.id, channel = %channel, "Forcing subscription");
                    if let Err(e) = bridge.subscribe(channel) {
                        tracing::warn!(session_id = %self.id, error = %e, "Failed to encode subscription");
                    }
                }

                self.bridge = Some(bridge);
            }
        }

        if let Some(sock) = self.in_sock.as_mut() {
            sock.respond_success(&reason, headers);
        }

        // send any frames the client queued while we were connecting
        self.try_read_in();
    }

    fn on_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Send {
                content_type,
                message,
            } => {
                if !self.in_is_open() {
                    return;
                }
                if self.pushed.len() >= self.context.settings.max_pending_frames {
                    tracing::warn!(
                        session_id = %self.id,
                        queued = self.pushed.len(),
                        "Dropping pushed message, client not keeping up"
                    );
                    return;
                }
                let frame = if content_type == "binary" {
                    Frame::binary(message)
                } else {
                    Frame::text(message)
                };
                self.pushed.push_back(frame);
                self.flush_pushed();
            }
            ControlEvent::Detach => {
                if self.detached {
                    return;
                }

                tracing::debug!(session_id = %self.id, "Detached");
                self.detached = true;
                // the relayed message can no longer complete
                self.upstream_message = MessageTracker::default();

                if self.out_is_open() {
                    self.close_out();
                }

                if let Some(in_sock) = self.in_sock.as_deref_mut() {
                    relay::drain(in_sock);
                }
                self.flush_pushed();
            }
        }
    }
}

fn connect_result_label(error: &SocketError) -> &'static str {
    match error {
        SocketError::Connect(_) => "connect_failed",
        SocketError::ConnectTimeout => "connect_timeout",
        SocketError::Tls(_) => "tls_failed",
        SocketError::Rejected(_) => "rejected",
        SocketError::Other(_) => "error",
    }
}

/// The inbound URI rewritten for a target: ws/wss per the target, host
/// replaced when the target overrides it.
fn outbound_uri(request: &RequestData, target: &Target) -> Option<Url> {
    let mut uri = Url::parse(&request.uri.to_string()).ok()?;
    uri.set_scheme(if target.secure { "wss" } else { "ws" }).ok()?;
    if let Some(host) = &target.host {
        uri.set_host(Some(host)).ok()?;
    }
    Some(uri)
}

#[cfg(test)]
mod tests;
