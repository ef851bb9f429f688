use axum::http::header::SEC_WEBSOCKET_EXTENSIONS;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;

use super::testing::{route, target, Harness, MockInbound};
use super::*;
use crate::transport::frame::FrameKind;

fn grip_headers(value: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(SEC_WEBSOCKET_EXTENSIONS, HeaderValue::from_static(value));
    headers
}

fn chat(targets: Vec<crate::config::TargetConfig>) -> Vec<crate::config::RouteConfig> {
    vec![route("chat.example.com", targets)]
}

fn payloads(frames: &[Frame]) -> Vec<String> {
    frames
        .iter()
        .map(|f| String::from_utf8_lossy(&f.payload).into_owned())
        .collect()
}

#[test]
fn test_no_route_rejects_with_bad_gateway() {
    let mut h = Harness::new(chat(vec![target(9001)]), false);
    let mut done = h.session.on_finished();
    let client = h.start("ws://unknown.example/ws");

    let rejection = client.rejected().unwrap();
    assert_eq!(rejection.status, StatusCode::BAD_GATEWAY);
    assert_eq!(&rejection.body[..], b"No route for host: unknown.example\n");
    assert_eq!(h.factory.count(), 0);
    assert_eq!(h.session.state(), SessionState::Closing);
    assert!(done.try_recv().is_err());

    h.inbound(SocketEvent::Closed);
    assert!(h.session.is_finished());
    assert!(done.try_recv().is_ok());
}

#[test]
fn test_outbound_request_preparation() {
    let mut secure = target(9443);
    secure.secure = true;
    secure.host = Some("backend.internal".into());
    let mut h = Harness::new(chat(vec![secure]), false);

    let (sock, _client) = MockInbound::new("ws://chat.example.com/ws?room=1", "192.0.2.1".parse().ok());
    let sock = sock
        .with_header("sec-websocket-extensions", "permessage-deflate")
        .with_header("x-forwarded-for", "10.9.9.9");
    h.session.start(Box::new(sock));

    assert_eq!(h.session.state(), SessionState::Connecting);
    assert_eq!(h.session.channel_prefix(), "chan-");

    let request = h.factory.socket(0).connect_request().unwrap();
    assert_eq!(request.uri.as_str(), "wss://backend.internal/ws?room=1");
    assert_eq!(request.connect_port, 9443);
    let extensions: Vec<_> = request.headers.get_all(SEC_WEBSOCKET_EXTENSIONS).iter().collect();
    assert_eq!(extensions, vec!["grip"]);
    assert_eq!(request.headers.get("x-forwarded-for").unwrap(), "192.0.2.1");
}

#[test]
fn test_failover_to_next_target() {
    let mut h = Harness::new(chat(vec![target(9001), target(9002)]), false);
    let client = h.start("ws://chat.example.com/ws");
    assert_eq!(h.factory.source(0), Source::Outbound(1));

    h.outbound(0, SocketEvent::Error(SocketError::Connect("refused".into())));
    assert_eq!(h.factory.count(), 2);
    assert!(h.factory.socket(0).is_dropped());
    assert_eq!(h.factory.socket(1).connect_request().unwrap().connect_port, 9002);

    // late event from the discarded attempt
    h.outbound(0, SocketEvent::Connected(HandshakeResponse::default()));
    assert!(client.accepted().is_none());

    h.connect(1, HeaderMap::new());
    assert_eq!(h.session.state(), SessionState::Connected);
    assert_eq!(client.accepted().unwrap().0, "Switching Protocols");
}

#[test]
fn test_exhausted_targets_reject() {
    let mut h = Harness::new(chat(vec![target(9001), target(9002)]), false);
    let client = h.start("ws://chat.example.com/ws");

    h.outbound(0, SocketEvent::Error(SocketError::ConnectTimeout));
    h.outbound(1, SocketEvent::Error(SocketError::Tls("bad certificate".into())));

    assert_eq!(h.factory.count(), 2);
    let rejection = client.rejected().unwrap();
    assert_eq!(rejection.status, StatusCode::BAD_GATEWAY);
    assert_eq!(&rejection.body[..], b"Error while proxying to origin.\n");
}

#[test]
fn test_upstream_rejection_passed_through() {
    let mut h = Harness::new(chat(vec![target(9001), target(9002)]), false);
    let client = h.start("ws://chat.example.com/ws");

    let mut upstream = Rejection::with_message(StatusCode::FORBIDDEN, "go away");
    upstream
        .headers
        .insert("x-reason", HeaderValue::from_static("policy"));
    h.outbound(0, SocketEvent::Error(SocketError::Rejected(upstream.clone())));

    assert_eq!(h.factory.count(), 1);
    assert_eq!(client.rejected().unwrap(), upstream);
    assert_eq!(h.session.state(), SessionState::Closing);
}

#[test]
fn test_other_failure_is_generic_bad_gateway() {
    let mut h = Harness::new(chat(vec![target(9001), target(9002)]), false);
    let client = h.start("ws://chat.example.com/ws");

    h.outbound(0, SocketEvent::Error(SocketError::Other("protocol error".into())));

    assert_eq!(h.factory.count(), 1);
    assert_eq!(client.rejected().unwrap().status, StatusCode::BAD_GATEWAY);
}

#[test]
fn test_frames_queued_during_connect_are_flushed() {
    let mut h = Harness::new(chat(vec![target(9001)]), false);
    let client = h.start("ws://chat.example.com/ws");

    client.push(Frame::text("early"));
    h.inbound(SocketEvent::ReadyRead);
    assert!(h.factory.socket(0).written().is_empty());

    h.connect(0, HeaderMap::new());
    assert_eq!(payloads(&h.factory.socket(0).written()), vec!["early"]);
}

#[test]
fn test_backpressure_towards_backend() {
    let mut h = Harness::new(chat(vec![target(9001)]), false);
    let client = h.start("ws://chat.example.com/ws");
    for _ in 0..150 {
        client.push(Frame::binary("x"));
    }

    h.connect(0, HeaderMap::new());
    let backend = h.factory.socket(0);
    assert_eq!(backend.written().len(), 100);
    assert_eq!(h.session.pending_to_backend(), 100);

    h.inbound(SocketEvent::ReadyRead);
    assert_eq!(backend.written().len(), 100);

    h.outbound(0, SocketEvent::FramesWritten(40));
    assert_eq!(backend.written().len(), 140);
    assert_eq!(h.session.pending_to_backend(), 100);
    assert_eq!(client.buffered(), 10);
}

#[test]
fn test_plain_backend_relays_everything() {
    let mut h = Harness::new(chat(vec![target(9001)]), true);
    let client = h.start("ws://chat.example.com/ws");
    h.connect(0, HeaderMap::new());
    assert_eq!(*h.control.started.lock().unwrap(), 0);

    let backend = h.factory.socket(0);
    backend.push(Frame::text("c:not control"));
    backend.push(Frame::text("hello"));
    h.outbound(0, SocketEvent::ReadyRead);

    assert_eq!(payloads(&client.written()), vec!["c:not control", "hello"]);
    assert!(h.session.message_prefix().is_none());
}

#[test]
fn test_grip_backend_filters_and_routes_control() {
    let mut h = Harness::new(chat(vec![target(9001)]), true);
    let client = h.start("ws://chat.example.com/ws");
    h.connect(0, grip_headers("grip; message-prefix=\"g:\""));

    let (_, headers) = client.accepted().unwrap();
    assert!(headers.get(SEC_WEBSOCKET_EXTENSIONS).is_none());
    assert_eq!(*h.control.started.lock().unwrap(), 1);
    assert_eq!(h.session.message_prefix(), Some(&b"g:"[..]));

    let backend = h.factory.socket(0);
    backend.push(Frame::text("g:for client"));
    backend.push(Frame::text("m:wrong prefix"));
    backend.push(Frame::text("c:{\"type\":\"subscribe\",\"channel\":\"a\"}"));
    backend.push(Frame::new(FrameKind::Ping, Bytes::new(), false));
    h.outbound(0, SocketEvent::ReadyRead);

    let written = client.written();
    assert_eq!(written.len(), 2);
    assert_eq!(written[0].payload, "g:for client");
    assert_eq!(written[1].kind, FrameKind::Ping);
    assert_eq!(h.control.messages(), vec![r#"{"type":"subscribe","channel":"a"}"#]);
}

#[test]
fn test_sub_channel_forces_subscription() {
    let mut forced = target(9001);
    forced.sub_channel = Some("lobby".into());
    let mut h = Harness::new(chat(vec![forced]), true);
    let client = h.start("ws://chat.example.com/ws");
    h.connect(0, HeaderMap::new());

    assert_eq!(h.control.messages(), vec![r#"{"type":"subscribe","channel":"lobby"}"#]);
    assert_eq!(h.session.message_prefix(), Some(&b"m:"[..]));

    h.factory.socket(0).push(Frame::text("m:hi"));
    h.factory.socket(0).push(Frame::text("dropped"));
    h.outbound(0, SocketEvent::ReadyRead);
    assert_eq!(payloads(&client.written()), vec!["m:hi"]);
}

#[test]
fn test_grip_without_control_manager_relays_unfiltered() {
    let mut h = Harness::new(chat(vec![target(9001)]), false);
    let client = h.start("ws://chat.example.com/ws");
    h.connect(0, grip_headers("grip"));

    h.factory.socket(0).push(Frame::text("anything"));
    h.outbound(0, SocketEvent::ReadyRead);
    assert_eq!(payloads(&client.written()), vec!["anything"]);
}

#[test]
fn test_pushed_frames_wait_for_relayed_message() {
    let mut h = Harness::new(chat(vec![target(9001)]), true);
    let client = h.start("ws://chat.example.com/ws");
    h.connect(0, grip_headers("grip"));
    let backend = h.factory.socket(0);

    backend.push(Frame::new(FrameKind::Text, "m:part1 ", true));
    h.outbound(0, SocketEvent::ReadyRead);

    h.session.handle(SessionEvent::Control(ControlEvent::Send {
        content_type: "binary".into(),
        message: Bytes::from_static(b"pushed"),
    }));
    assert_eq!(client.written().len(), 1);

    backend.push(Frame::new(FrameKind::Continuation, "part2", false));
    h.outbound(0, SocketEvent::ReadyRead);

    let written = client.written();
    assert_eq!(payloads(&written), vec!["m:part1 ", "part2", "pushed"]);
    assert_eq!(written[2].kind, FrameKind::Binary);
}

#[test]
fn test_pushed_text_frame() {
    let mut h = Harness::new(chat(vec![target(9001)]), true);
    let client = h.start("ws://chat.example.com/ws");
    h.connect(0, grip_headers("grip"));

    h.session.handle(SessionEvent::Control(ControlEvent::Send {
        content_type: "text".into(),
        message: Bytes::from_static(b"hi"),
    }));
    assert_eq!(client.written(), vec![Frame::text("hi")]);
}

#[test]
fn test_detach_hands_delivery_to_control() {
    let mut h = Harness::new(chat(vec![target(9001)]), true);
    let mut done = h.session.on_finished();
    let client = h.start("ws://chat.example.com/ws");
    h.connect(0, grip_headers("grip"));
    let backend = h.factory.socket(0);

    h.session.handle(SessionEvent::Control(ControlEvent::Detach));
    assert!(h.session.is_detached());
    assert_eq!(backend.close_calls(), 1);

    h.session.handle(SessionEvent::Control(ControlEvent::Detach));
    assert_eq!(backend.close_calls(), 1);

    backend.push(Frame::text("m:late"));
    h.outbound(0, SocketEvent::ReadyRead);
    assert!(client.written().is_empty());
    assert_eq!(backend.buffered(), 0);

    client.push(Frame::text("to backend"));
    h.inbound(SocketEvent::ReadyRead);
    assert!(backend.written().is_empty());
    assert_eq!(client.buffered(), 0);

    h.session.handle(SessionEvent::Control(ControlEvent::Send {
        content_type: "text".into(),
        message: Bytes::from_static(b"from broker"),
    }));
    assert_eq!(payloads(&client.written()), vec!["from broker"]);

    h.outbound(0, SocketEvent::Closed);
    assert_eq!(client.close_calls(), 0);
    assert!(!h.session.is_finished());

    h.inbound(SocketEvent::Closed);
    assert!(h.session.is_finished());
    assert_eq!(h.control.live(), 0);
    let summary = done.try_recv().unwrap();
    assert!(summary.detached);
}

#[test]
fn test_backend_peer_close_mirrors_to_client() {
    let mut h = Harness::new(chat(vec![target(9001)]), false);
    let mut done = h.session.on_finished();
    let client = h.start("ws://chat.example.com/ws");
    h.connect(0, HeaderMap::new());
    let backend = h.factory.socket(0);

    h.outbound(0, SocketEvent::PeerClosed);
    assert_eq!(client.close_calls(), 1);

    h.inbound(SocketEvent::Closed);
    assert_eq!(backend.close_calls(), 1);
    assert_eq!(h.session.state(), SessionState::Closing);
    assert!(!h.session.is_finished());

    h.outbound(0, SocketEvent::Closed);
    assert!(h.session.is_finished());
    assert!(done.try_recv().is_ok());
}

#[test]
fn test_client_peer_close_propagates_once() {
    let mut h = Harness::new(chat(vec![target(9001)]), false);
    let _client = h.start("ws://chat.example.com/ws");
    h.connect(0, HeaderMap::new());
    let backend = h.factory.socket(0);

    h.inbound(SocketEvent::PeerClosed);
    h.inbound(SocketEvent::Closed);
    assert_eq!(backend.close_calls(), 1);
}

#[test]
fn test_error_after_connect_tears_down_both() {
    let mut h = Harness::new(chat(vec![target(9001), target(9002)]), true);
    let mut done = h.session.on_finished();
    let client = h.start("ws://chat.example.com/ws");
    h.connect(0, grip_headers("grip"));

    h.outbound(0, SocketEvent::Error(SocketError::Other("reset".into())));

    assert_eq!(h.factory.count(), 1);
    assert!(client.rejected().is_none());
    assert!(client.is_dropped());
    assert!(h.factory.socket(0).is_dropped());
    assert!(h.session.is_finished());
    assert_eq!(h.control.live(), 0);
    assert!(done.try_recv().is_ok());
}

#[test]
fn test_events_after_finish_are_ignored() {
    let mut h = Harness::new(chat(vec![target(9001)]), false);
    let client = h.start("ws://chat.example.com/ws");
    h.connect(0, HeaderMap::new());
    h.inbound(SocketEvent::Error(SocketError::Other("broken pipe".into())));
    assert!(h.session.is_finished());

    h.inbound(SocketEvent::Closed);
    h.outbound(0, SocketEvent::Closed);
    assert!(h.session.is_finished());
    assert_eq!(client.close_calls(), 0);
}

#[tokio::test]
async fn test_run_completes_from_inbox() {
    let mut h = Harness::new(chat(vec![target(9001)]), false);
    let _client = h.start("ws://missing.example/ws");

    h.session.inbound_sink().emit(SocketEvent::Closed);
    let summary = h.session.run(h.inbox).await;
    assert!(!summary.detached);
    assert_eq!(summary.frames_to_client, 0);
}

#[test]
fn test_late_connect_after_client_close_is_ignored() {
    let mut h = Harness::new(chat(vec![target(9001)]), true);
    let mut done = h.session.on_finished();
    let _client = h.start("ws://chat.example.com/ws");

    h.inbound(SocketEvent::Closed);
    assert_eq!(h.session.state(), SessionState::Closing);
    assert_eq!(h.factory.socket(0).close_calls(), 1);

    h.connect(0, grip_headers("grip"));
    assert_eq!(h.session.state(), SessionState::Closing);
    assert_eq!(*h.control.started.lock().unwrap(), 0);
    assert!(h.control.messages().is_empty());
    assert!(h.session.message_prefix().is_none());

    h.outbound(0, SocketEvent::Closed);
    assert!(h.session.is_finished());
    assert!(done.try_recv().is_ok());
}

#[test]
fn test_secure_route_matches_only_wss() {
    let mut secure_route = route("chat.example.com", vec![target(9443)]);
    secure_route.secure = Some(true);

    let mut h = Harness::new(vec![secure_route.clone()], false);
    let client = h.start("ws://chat.example.com/ws");
    assert_eq!(client.rejected().unwrap().status, StatusCode::BAD_GATEWAY);
    assert_eq!(h.factory.count(), 0);

    let mut h = Harness::new(vec![secure_route], false);
    let client = h.start("wss://chat.example.com/ws");
    assert!(client.rejected().is_none());
    assert_eq!(h.factory.socket(0).connect_request().unwrap().connect_port, 9443);
}

#[test]
fn test_timeout_then_next_target_connects() {
    let mut h = Harness::new(chat(vec![target(9001), target(9002)]), false);
    let client = h.start("ws://chat.example.com/ws");

    h.outbound(0, SocketEvent::Error(SocketError::ConnectTimeout));
    assert_eq!(h.factory.count(), 2);
    assert!(client.rejected().is_none());

    h.connect(1, HeaderMap::new());
    assert_eq!(h.session.state(), SessionState::Connected);
    assert!(client.accepted().is_some());
}

#[test]
fn test_detach_discards_client_backlog() {
    let mut h = Harness::new(chat(vec![target(9001)]), true);
    let client = h.start("ws://chat.example.com/ws");
    for _ in 0..150 {
        client.push(Frame::binary("x"));
    }
    h.connect(0, grip_headers("grip"));
    let backend = h.factory.socket(0);
    assert_eq!(backend.written().len(), 100);
    assert_eq!(client.buffered(), 50);

    h.session.handle(SessionEvent::Control(ControlEvent::Detach));
    assert_eq!(client.buffered(), 0);

    h.outbound(0, SocketEvent::FramesWritten(100));
    client.push(Frame::binary("y"));
    h.inbound(SocketEvent::ReadyRead);
    assert_eq!(backend.written().len(), 100);
    assert_eq!(client.buffered(), 0);
}

#[test]
fn test_detach_mid_message_releases_pushes() {
    let mut h = Harness::new(chat(vec![target(9001)]), true);
    let client = h.start("ws://chat.example.com/ws");
    h.connect(0, grip_headers("grip"));
    let backend = h.factory.socket(0);

    backend.push(Frame::new(FrameKind::Text, "m:part1 ", true));
    h.outbound(0, SocketEvent::ReadyRead);
    h.session.handle(SessionEvent::Control(ControlEvent::Send {
        content_type: "text".into(),
        message: Bytes::from_static(b"pushed"),
    }));
    assert_eq!(h.session.queued_pushes(), 1);

    h.session.handle(SessionEvent::Control(ControlEvent::Detach));
    assert_eq!(h.session.queued_pushes(), 0);

    backend.push(Frame::new(FrameKind::Continuation, "part2", false));
    h.outbound(0, SocketEvent::ReadyRead);
    assert_eq!(payloads(&client.written()), vec!["m:part1 ", "pushed"]);
}

#[test]
fn test_pushed_queue_is_bounded() {
    let mut h = Harness::new(chat(vec![target(9001)]), true);
    let client = h.start("ws://chat.example.com/ws");
    h.connect(0, grip_headers("grip"));
    let backend = h.factory.socket(0);

    backend.push(Frame::new(FrameKind::Text, "m:open", true));
    h.outbound(0, SocketEvent::ReadyRead);
    for _ in 0..150 {
        h.session.handle(SessionEvent::Control(ControlEvent::Send {
            content_type: "text".into(),
            message: Bytes::from_static(b"p"),
        }));
    }
    assert_eq!(h.session.queued_pushes(), 100);

    backend.push(Frame::new(FrameKind::Continuation, "end", false));
    h.outbound(0, SocketEvent::ReadyRead);
    assert_eq!(client.written().len(), 100);
    assert_eq!(h.session.queued_pushes(), 2);

    h.inbound(SocketEvent::FramesWritten(100));
    assert_eq!(client.written().len(), 102);
    assert_eq!(h.session.queued_pushes(), 0);
}
