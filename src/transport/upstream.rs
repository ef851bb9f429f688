//! Backend-facing WebSocket client.
//!
//! # Responsibilities
//! - Dial a target (TCP, optional TLS) within the connect timeout
//! - Perform the client handshake with the prepared request headers
//! - Classify failures so the session can decide whether to fail over
//! - Optionally refuse private destinations for untrusted targets
//!
//! # Design Decisions
//! - The connection attempt and the relay run in one spawned task that is
//!   aborted when the socket is dropped
//! - A non-101 handshake response becomes [`SocketError::Rejected`] carrying
//!   the backend's status, headers and body

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::{Request, Response};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::net::tls::{server_name, TlsConnectors};
use crate::session::events::{EventSink, SocketEvent};
use crate::transport::frame::Frame;
use crate::transport::link::{link, LinkHandle, LinkTask};
use crate::transport::socket::{
    ConnectRequest, FrameSocket, HandshakeResponse, OutboundSocket, Rejection, SharedState,
    SocketError, SocketFactory, SocketState,
};
use crate::transport::strip_hop_headers;

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Creates [`UpstreamSocket`]s sharing TLS connectors and timeouts.
#[derive(Debug, Clone)]
pub struct UpstreamFactory {
    tls: TlsConnectors,
    connect_timeout: Duration,
    deny_private: bool,
}

impl UpstreamFactory {
    pub fn new(tls: TlsConnectors, connect_timeout: Duration) -> Self {
        Self {
            tls,
            connect_timeout,
            deny_private: false,
        }
    }

    /// Refuse loopback, private and link-local destinations unless the
    /// request ignores policies.
    pub fn deny_private_targets(mut self, deny: bool) -> Self {
        self.deny_private = deny;
        self
    }
}

/// Addresses an untrusted target may not resolve to under the private policy.
fn is_private_destination(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_destination(IpAddr::V4(v4)),
            None => {
                let first = v6.segments()[0];
                v6.is_loopback()
                    || v6.is_unspecified()
                    || (first & 0xfe00) == 0xfc00
                    || (first & 0xffc0) == 0xfe80
            }
        },
    }
}

async fn resolve(factory: &UpstreamFactory, request: &ConnectRequest) -> Result<Vec<SocketAddr>, SocketError> {
    let mut addrs: Vec<SocketAddr> =
        tokio::net::lookup_host((request.connect_host.as_str(), request.connect_port))
            .await
            .map_err(|e| SocketError::Connect(e.to_string()))?
            .collect();

    if factory.deny_private && !request.ignore_policies {
        addrs.retain(|addr| !is_private_destination(addr.ip()));
        if addrs.is_empty() {
            tracing::debug!(connect_host = %request.connect_host, "Target refused by address policy");
            return Err(SocketError::Other(format!(
                "{} resolves only to private addresses",
                request.connect_host
            )));
        }
    }
    Ok(addrs)
}

impl SocketFactory for UpstreamFactory {
    fn create_socket(&self, events: EventSink) -> Box<dyn OutboundSocket> {
        Box::new(UpstreamSocket::new(events, self.clone()))
    }
}

/// One outbound connection attempt and, once connected, its relay.
pub struct UpstreamSocket {
    events: EventSink,
    state: SharedState,
    link: LinkHandle,
    pending_task: Option<LinkTask>,
    task: Option<JoinHandle<()>>,
    factory: UpstreamFactory,
}

impl UpstreamSocket {
    fn new(events: EventSink, factory: UpstreamFactory) -> Self {
        let (link, task) = link();
        Self {
            events,
            state: SharedState::new(SocketState::Idle),
            link,
            pending_task: Some(task),
            task: None,
            factory,
        }
    }
}

impl FrameSocket for UpstreamSocket {
    fn state(&self) -> SocketState {
        self.state.get()
    }

    fn frames_available(&self) -> usize {
        self.link.frames_available()
    }

    fn read_frame(&mut self) -> Option<Frame> {
        self.link.read_frame()
    }

    fn write_frame(&mut self, frame: Frame) {
        self.link.write_frame(frame);
    }

    fn close(&mut self) {
        match self.state.get() {
            SocketState::Idle | SocketState::Connecting => {
                if let Some(task) = self.task.take() {
                    task.abort();
                }
                self.state.set(SocketState::Closed);
                self.events.emit(SocketEvent::Closed);
            }
            SocketState::Connected | SocketState::PeerClosed => self.link.close(),
            SocketState::Closing | SocketState::Closed => {}
        }
    }
}

impl OutboundSocket for UpstreamSocket {
    fn start(&mut self, request: ConnectRequest) {
        let Some(link_task) = self.pending_task.take() else {
            tracing::warn!("Outbound socket started twice");
            return;
        };

        self.state.set(SocketState::Connecting);
        let state = self.state.clone();
        let events = self.events.clone();
        let factory = self.factory.clone();

        self.task = Some(tokio::spawn(async move {
            match connect(&factory, request).await {
                Ok((ws, response)) => {
                    state.advance(SocketState::Connected);
                    events.emit(SocketEvent::Connected(response));
                    link_task.run(ws, state, events).await;
                }
                Err(e) => {
                    state.set(SocketState::Closed);
                    events.emit(SocketEvent::Error(e));
                }
            }
        }));
    }
}

impl Drop for UpstreamSocket {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn connect(
    factory: &UpstreamFactory,
    request: ConnectRequest,
) -> Result<(Upstream, HandshakeResponse), SocketError> {
    let handshake = build_handshake(&request)?;

    let stream = tokio::time::timeout(factory.connect_timeout, dial(factory, &request))
        .await
        .map_err(|_| SocketError::ConnectTimeout)??;

    let (ws, response) = tokio_tungstenite::client_async(handshake, stream)
        .await
        .map_err(classify_handshake_error)?;

    Ok((ws, handshake_response(&response)))
}

async fn dial(
    factory: &UpstreamFactory,
    request: &ConnectRequest,
) -> Result<MaybeTlsStream<TcpStream>, SocketError> {
    let addrs = resolve(factory, request).await?;
    let tcp = TcpStream::connect(&addrs[..])
        .await
        .map_err(|e| SocketError::Connect(e.to_string()))?;
    let _ = tcp.set_nodelay(true);

    if request.uri.scheme() != "wss" {
        return Ok(MaybeTlsStream::Plain(tcp));
    }

    let host = request
        .uri
        .host_str()
        .unwrap_or(request.connect_host.as_str());
    let name = server_name(host.trim_start_matches('[').trim_end_matches(']'))
        .map_err(SocketError::Tls)?;
    let tls = factory
        .tls
        .connector(request.ignore_tls_errors)
        .connect(name, tcp)
        .await
        .map_err(|e| SocketError::Tls(e.to_string()))?;

    Ok(MaybeTlsStream::Rustls(tls))
}

/// The tungstenite handshake request: its own upgrade headers plus ours.
fn build_handshake(request: &ConnectRequest) -> Result<Request, SocketError> {
    let mut handshake = request
        .uri
        .as_str()
        .into_client_request()
        .map_err(|e| SocketError::Other(e.to_string()))?;

    let mut headers = request.headers.clone();
    strip_hop_headers(&mut headers);
    for (name, value) in headers.iter() {
        handshake.headers_mut().append(name, value.clone());
    }
    Ok(handshake)
}

fn handshake_response(response: &Response) -> HandshakeResponse {
    let mut headers = response.headers().clone();
    strip_hop_headers(&mut headers);
    HandshakeResponse {
        reason: reason_phrase(response.status()),
        headers,
    }
}

fn reason_phrase(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or_default().to_string()
}

fn classify_handshake_error(error: tokio_tungstenite::tungstenite::Error) -> SocketError {
    use tokio_tungstenite::tungstenite::Error;

    match error {
        Error::Http(response) => {
            let mut headers: HeaderMap = response.headers().clone();
            strip_hop_headers(&mut headers);
            SocketError::Rejected(Rejection {
                status: response.status(),
                reason: reason_phrase(response.status()),
                headers,
                body: response
                    .body()
                    .as_ref()
                    .map(|body| Bytes::copy_from_slice(body))
                    .unwrap_or_default(),
            })
        }
        Error::Tls(e) => SocketError::Tls(e.to_string()),
        other => SocketError::Other(other.to_string()),
    }
}
