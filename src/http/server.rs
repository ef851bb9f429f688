//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the upgrade handler on every path
//! - Wire up middleware (tracing)
//! - Build the shared session context (routes, enrichment, sockets, control)
//! - Swap the route table on config reload
//! - Serve until shutdown, then wait for sessions to drain

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::routing::any;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::grip::control::ControlManager;
use crate::http::websocket::upgrade_handler;
use crate::net::connection::SessionTracker;
use crate::net::tls::TlsConnectors;
use crate::routing::RouteTable;
use crate::security::headers::ForwardingEnricher;
use crate::session::{SessionContext, SessionSettings};
use crate::transport::upstream::UpstreamFactory;

/// Error type for server construction.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to build TLS client configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub context: SessionContext,
    pub tracker: SessionTracker,
}

/// HTTP server for the WebSocket proxy.
pub struct HttpServer {
    router: Router,
    routes: Arc<ArcSwap<RouteTable>>,
    tracker: SessionTracker,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(
        config: &ProxyConfig,
        control: Option<Arc<dyn ControlManager>>,
    ) -> Result<Self, ServerError> {
        let routes = Arc::new(ArcSwap::from_pointee(RouteTable::from_config(
            config.routes.clone(),
        )));
        let sockets = UpstreamFactory::new(
            TlsConnectors::new()?,
            Duration::from_secs(config.proxy.connect_timeout_secs),
        )
        .deny_private_targets(config.proxy.deny_private_targets);

        let context = SessionContext {
            routes: routes.clone(),
            enricher: Arc::new(ForwardingEnricher::from_config(&config.proxy)),
            sockets: Arc::new(sockets),
            control,
            settings: SessionSettings::from_config(&config.proxy),
        };
        let tracker = SessionTracker::new(config.listener.max_connections);

        let state = AppState {
            context,
            tracker: tracker.clone(),
        };

        Ok(Self {
            router: Self::build_router(state),
            routes,
            tracker,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/", any(upgrade_handler))
            .route("/{*path}", any(upgrade_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// The live route table, swapped on reload.
    pub fn routes(&self) -> Arc<ArcSwap<RouteTable>> {
        self.routes.clone()
    }

    pub fn tracker(&self) -> SessionTracker {
        self.tracker.clone()
    }

    /// Run the server until `shutdown` resolves.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!(
            active_sessions = self.tracker.active_count(),
            "HTTP server stopped"
        );
        Ok(())
    }
}

/// Apply reloaded configurations to the route table. New sessions see the
/// new routes; running sessions keep the routes they resolved.
pub async fn apply_route_updates(
    routes: Arc<ArcSwap<RouteTable>>,
    mut updates: mpsc::UnboundedReceiver<ProxyConfig>,
) {
    while let Some(config) = updates.recv().await {
        let table = RouteTable::from_config(config.routes);
        tracing::info!(routes = table.len(), "Route table swapped");
        routes.store(Arc::new(table));
    }
}
