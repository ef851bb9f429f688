//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use grip_proxy::config::{ProxyConfig, RouteConfig, TargetConfig};
use grip_proxy::grip::control::ControlManager;
use grip_proxy::{HttpServer, Shutdown};

/// Handshake headers seen by a mock backend, one entry per connection.
pub type SeenHeaders = Arc<Mutex<Vec<HeaderMap>>>;

/// Start a WebSocket backend. It advertises `extensions` in its handshake
/// response, sends `greeting` right after the upgrade, then echoes text and
/// binary messages back.
pub async fn start_ws_backend(
    extensions: Option<&'static str>,
    greeting: Vec<&'static str>,
) -> (SocketAddr, SeenHeaders) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: SeenHeaders = Arc::default();
    let seen_by_backend = seen.clone();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let seen = seen_by_backend.clone();
            let greeting = greeting.clone();
            tokio::spawn(async move {
                let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                    seen.lock().unwrap().push(req.headers().clone());
                    if let Some(ext) = extensions {
                        resp.headers_mut()
                            .insert("sec-websocket-extensions", HeaderValue::from_static(ext));
                    }
                    Ok(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await else {
                    return;
                };
                for text in greeting {
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(_) | Message::Binary(_) => {
                            if ws.send(message).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    (addr, seen)
}

/// Start a backend that answers every upgrade with a fixed HTTP response.
pub async fn start_rejecting_backend(status_line: &'static str, body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                // wait for the request head before answering
                let mut buf = [0u8; 4096];
                let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nX-Backend: rejecting\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// A loopback port with nothing listening on it.
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
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
        name: format!("route-{}", host),
        host: Some(host.to_string()),
        path_prefix: None,
        secure: None,
        priority: 0,
        channel_prefix: String::new(),
        sig_iss: None,
        sig_key: None,
        targets,
    }
}

/// A running proxy on an ephemeral loopback port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Start the proxy with `routes` and an optional control manager.
pub async fn start_proxy(
    routes: Vec<RouteConfig>,
    control: Option<Arc<dyn ControlManager>>,
) -> TestProxy {
    let mut config = ProxyConfig {
        routes,
        ..ProxyConfig::default()
    };
    config.proxy.connect_timeout_secs = 2;
    start_proxy_with_config(config, control).await
}

/// Start the proxy from a full configuration.
pub async fn start_proxy_with_config(
    config: ProxyConfig,
    control: Option<Arc<dyn ControlManager>>,
) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(&config, control).unwrap();
    let shutdown = Shutdown::new();
    let signalled = shutdown.signalled();

    tokio::spawn(async move {
        let _ = server.run(listener, signalled).await;
    });

    TestProxy { addr, shutdown }
}

/// Poll `f` until it returns `Some`, or panic after `timeout`.
pub async fn wait_for<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = f() {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
