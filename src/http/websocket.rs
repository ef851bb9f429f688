//! WebSocket upgrade handling.
//!
//! # Responsibilities
//! - Refuse plain HTTP requests with 426
//! - Reserve a session slot (503 when the listener is full)
//! - Start a [`ProxySession`] for the upgrade and wait for its decision
//! - Turn the decision into the 101 response or the HTTP error response
//!
//! # Data Flow
//! ```text
//! Client ──upgrade──→ handler ──→ ProxySession (spawned) ──→ Backend
//!        ←──101/5xx── handler ←── Decision
//! ```
//!
//! # Design Decisions
//! - The handler only waits for the decision; all relaying happens in the
//!   session task, which outlives the request
//! - Frame-level forwarding (no message buffering)

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::header::{CONTENT_TYPE, UPGRADE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::Instrument;

use crate::http::server::AppState;
use crate::session::ProxySession;
use crate::transport::downstream::{request_data, Decision, DownstreamSocket};
use crate::transport::socket::Rejection;

/// Build the HTTP response for a refused upgrade.
pub fn rejection_response(rejection: Rejection) -> Response {
    let mut response = Response::new(Body::from(rejection.body));
    *response.status_mut() = rejection.status;
    let headers = response.headers_mut();
    for (name, value) in rejection.headers.iter() {
        headers.append(name, value.clone());
    }
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    }
    response
}

/// Proxy one WebSocket upgrade.
pub async fn upgrade_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (mut parts, _body) = request.into_parts();

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => {
            tracing::debug!(peer = %peer, path = %parts.uri.path(), reason = %rejection.body_text(), "Not a WebSocket upgrade");
            let mut response = rejection_response(Rejection::with_message(
                StatusCode::UPGRADE_REQUIRED,
                "WebSocket upgrade required.",
            ));
            response
                .headers_mut()
                .insert(UPGRADE, HeaderValue::from_static("websocket"));
            return response;
        }
    };

    let Some(guard) = state.tracker.try_track() else {
        tracing::warn!(peer = %peer, active = state.tracker.active_count(), "Session limit reached");
        return rejection_response(Rejection::with_message(
            StatusCode::SERVICE_UNAVAILABLE,
            "Too many connections.",
        ));
    };

    let id = guard.id();
    let span = tracing::debug_span!("session", session_id = %id, peer = %peer);

    let (mut session, inbox) = ProxySession::new(id, state.context.clone());
    let trusted = state.context.enricher.is_trusted(Some(peer.ip()));
    let (socket, decision) = DownstreamSocket::new(
        request_data(&parts, trusted),
        Some(peer.ip()),
        session.inbound_sink(),
    );

    span.in_scope(|| session.start(Box::new(socket)));

    tokio::spawn(
        async move {
            let summary = session.run(inbox).await;
            drop(guard);
            tracing::debug!(
                detached = summary.detached,
                frames_to_client = summary.frames_to_client,
                frames_to_backend = summary.frames_to_backend,
                "Session task finished"
            );
        }
        .instrument(span),
    );

    match decision.await {
        Ok(Decision::Accept { headers, upgraded }) => {
            let mut response = ws
                .on_failed_upgrade(move |e| {
                    tracing::debug!(session_id = %id, error = %e, "Client upgrade failed");
                })
                .on_upgrade(move |socket| async move {
                    let _ = upgraded.send(socket);
                });
            response.headers_mut().extend(headers);
            response
        }
        Ok(Decision::Reject(rejection)) => rejection_response(rejection),
        Err(_) => rejection_response(Rejection::bad_gateway("Error while proxying to origin.")),
    }
}
