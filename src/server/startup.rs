//! Testable server startup logic.
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! spin up a real server on an ephemeral port, exercise its HTTP and
//! WebSocket endpoints, and shut it down cleanly. Shutdown closes every
//! live session through the connection service before the listener stops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::connection::{
    capability_middleware, provider_router, CapabilityConfig, ConnectionService,
};

/// Everything needed to start a server.
pub struct ServerConfig {
    pub service: Arc<ConnectionService>,
    pub bind_address: SocketAddr,
    /// Bearer token granting the full capability set on the HTTP surface.
    pub api_token: Option<String>,
    /// Base for report URLs embedded in connection tokens. `None` derives
    /// `ws://<bound-address>/api` once the listener is bound, which is what
    /// ephemeral-port tests want.
    pub endpoint_base: Option<String>,
}

impl ServerConfig {
    /// Minimal config suitable for integration tests: binds to
    /// `127.0.0.1:0` and derives the endpoint base from the bound port.
    pub fn for_testing(service: Arc<ConnectionService>) -> Self {
        ServerConfig {
            service,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            api_token: None,
            endpoint_base: None,
        }
    }
}

/// Handle to a running server. Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    service: Arc<ConnectionService>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to (useful when binding to port 0).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The full local address (ip + port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn service(&self) -> &Arc<ConnectionService> {
        &self.service
    }

    /// Trigger graceful shutdown: close every live session, then await the
    /// server task.
    pub async fn shutdown(self) {
        self.service.shutdown().await;
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => error!("Server task returned error: {}", err),
            Ok(Err(err)) => error!("Server task panicked: {}", err),
            Err(_) => warn!("Server task did not finish within 5s timeout"),
        }
    }
}

/// Start a server from a fully-assembled [`ServerConfig`].
pub async fn run_server_with_config(
    config: ServerConfig,
) -> Result<ServerHandle, Box<dyn std::error::Error>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let capability = CapabilityConfig {
        api_token: config.api_token.clone(),
    };
    let app = Router::new()
        .nest("/api/connection", provider_router(config.service.clone()))
        .layer(middleware::from_fn_with_state(
            capability,
            capability_middleware,
        ));

    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;

    let endpoint_base = config
        .endpoint_base
        .clone()
        .unwrap_or_else(|| format!("ws://{local_addr}/api"));
    config.service.set_endpoint_base(&endpoint_base);
    info!(address = %local_addr, endpoint_base = %endpoint_base, "connection provider listening");

    let mut shutdown_watch = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown_watch.borrow() {
                    break;
                }
                if shutdown_watch.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        service: config.service,
        server_task,
    })
}
