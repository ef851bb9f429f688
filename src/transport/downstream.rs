//! Client-facing WebSocket built on axum's upgrade extractor.
//!
//! The HTTP handler cannot answer the upgrade until the session has reached
//! a backend, so the socket hands its decision back over a oneshot. The
//! handler turns an accept into the 101 response and passes the upgraded
//! connection to the socket's link task over a second oneshot.
//!
//! ```text
//! handler ──(request)──→ DownstreamSocket ──→ session
//! handler ←─(Decision)── respond_success / respond_error
//! on_upgrade ──(WebSocket)──→ link task
//! ```

use std::net::IpAddr;

use axum::extract::ws::WebSocket;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, Uri};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::session::events::{EventSink, SocketEvent};
use crate::transport::frame::Frame;
use crate::transport::link::{link, LinkHandle, LinkTask};
use crate::transport::socket::{
    FrameSocket, InboundSocket, Rejection, RequestData, SharedState, SocketState,
};
use crate::transport::strip_hop_headers;

const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// The session's answer to a pending upgrade.
#[derive(Debug)]
pub enum Decision {
    Accept {
        headers: HeaderMap,
        upgraded: oneshot::Sender<WebSocket>,
    },
    Reject(Rejection),
}

pub struct DownstreamSocket {
    request: RequestData,
    peer: Option<IpAddr>,
    events: EventSink,
    state: SharedState,
    link: LinkHandle,
    pending: Option<(LinkTask, oneshot::Sender<Decision>)>,
    task: Option<JoinHandle<()>>,
}

impl DownstreamSocket {
    /// Wrap a pending upgrade. The receiver yields the session's decision.
    pub fn new(
        request: RequestData,
        peer: Option<IpAddr>,
        events: EventSink,
    ) -> (Self, oneshot::Receiver<Decision>) {
        let (decision_tx, decision_rx) = oneshot::channel();
        let (link, task) = link();
        let sock = Self {
            request,
            peer,
            events,
            state: SharedState::new(SocketState::Connecting),
            link,
            pending: Some((task, decision_tx)),
            task: None,
        };
        (sock, decision_rx)
    }

    fn abandon(&mut self) {
        self.pending = None;
        self.state.set(SocketState::Closed);
        self.events.emit(SocketEvent::Closed);
    }
}

/// Capture an upgrade request as an absolute URI plus its headers.
///
/// The listener itself is plain; a request is `wss` only when a trusted
/// TLS front end says so with `X-Forwarded-Proto`.
pub fn request_data(parts: &Parts, trust_forwarded: bool) -> RequestData {
    let secure = trust_forwarded
        && parts
            .headers
            .get(X_FORWARDED_PROTO)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .is_some_and(|proto| {
                proto.eq_ignore_ascii_case("https") || proto.eq_ignore_ascii_case("wss")
            });
    let scheme = if secure { "wss" } else { "ws" };

    let host = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
        .unwrap_or_default();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");

    let uri = format!("{}://{}{}", scheme, host, path)
        .parse::<Uri>()
        .unwrap_or_else(|_| parts.uri.clone());

    RequestData {
        uri,
        headers: parts.headers.clone(),
    }
}

impl FrameSocket for DownstreamSocket {
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
                // dropping the decision makes the handler answer 502
                self.abandon();
            }
            SocketState::Connected | SocketState::PeerClosed => self.link.close(),
            SocketState::Closing | SocketState::Closed => {}
        }
    }
}

impl InboundSocket for DownstreamSocket {
    fn request(&self) -> &RequestData {
        &self.request
    }

    fn peer_address(&self) -> Option<IpAddr> {
        self.peer
    }

    fn respond_success(&mut self, _reason: &str, mut headers: HeaderMap) {
        let Some((link_task, decision)) = self.pending.take() else {
            return;
        };

        strip_hop_headers(&mut headers);
        let (upgraded_tx, upgraded_rx) = oneshot::channel();
        if decision
            .send(Decision::Accept {
                headers,
                upgraded: upgraded_tx,
            })
            .is_err()
        {
            tracing::debug!("Client went away before upgrade");
            self.abandon();
            return;
        }

        self.state.set(SocketState::Connected);
        let state = self.state.clone();
        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            match upgraded_rx.await {
                Ok(ws) => link_task.run(ws, state, events).await,
                Err(_) => {
                    state.set(SocketState::Closed);
                    events.emit(SocketEvent::Closed);
                }
            }
        }));
    }

    fn respond_error(&mut self, rejection: Rejection) {
        if let Some((_, decision)) = self.pending.take() {
            let _ = decision.send(Decision::Reject(rejection));
        }
        self.state.set(SocketState::Closed);
        self.events.emit(SocketEvent::Closed);
    }
}

impl Drop for DownstreamSocket {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
