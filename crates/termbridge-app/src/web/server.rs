use anyhow::{Context, Result};
use axum::http::{request::Parts, HeaderValue};
use axum::Router;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use termbridge_terminal::TerminalManager;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::web::routes;

/// Web server configuration
#[derive(Debug, Clone)]
pub struct WebServerConfig {
    pub bind_addr: SocketAddr,
    /// Port the browser client is served from; part of the CORS allow-list
    pub cors_dev_port: u16,
    pub list_refresh: Duration,
    pub update_buffer: usize,
}

/// Web server instance
pub struct WebServer {
    config: WebServerConfig,
    manager: Arc<TerminalManager>,
    shutdown: CancellationToken,
}

impl WebServer {
    /// Create a new web server
    pub fn new(config: WebServerConfig, manager: Arc<TerminalManager>) -> Self {
        Self {
            config,
            manager,
            shutdown: CancellationToken::new(),
        }
    }

    /// Router with CORS and request tracing applied
    pub fn router(&self) -> Router {
        let app_state = routes::AppState {
            manager: self.manager.clone(),
            list_refresh: self.config.list_refresh,
            update_buffer: self.config.update_buffer,
            shutdown: self.shutdown.clone(),
        };

        routes::create_router(app_state)
            .layer(cors_layer(self.config.cors_dev_port))
            .layer(TraceLayer::new_for_http())
    }

    /// Start the web server and run until a shutdown signal arrives
    pub async fn start(self) -> Result<()> {
        // Not fatal: the next request retries the connection
        if let Err(e) = self.manager.connect().await {
            tracing::error!("Failed to connect to terminal backend: {}", e);
        }

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.bind_addr))?;

        tracing::info!("Web server listening on http://{}", self.config.bind_addr);
        tracing::info!("   WebSocket endpoints: ws://{}/ws/terminals[/{{id}}]", self.config.bind_addr);
        tracing::info!("   API endpoints: http://{}/api/terminals", self.config.bind_addr);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                wait_for_shutdown_signal().await;
                shutdown.cancel();
            })
            .await
            .context("Web server failed")?;

        tracing::info!("Shutting down terminal manager...");
        self.manager.shutdown().await;
        Ok(())
    }

    /// Get the terminal manager
    pub fn manager(&self) -> Arc<TerminalManager> {
        self.manager.clone()
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Wait for Ctrl-C or SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

/// CORS restricted to local-network origins on the client dev port
pub fn cors_layer(dev_port: u16) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _: &Parts| {
            origin
                .to_str()
                .map(|origin| is_allowed_origin(origin, dev_port))
                .unwrap_or(false)
        }))
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
}

/// `http://<host>:<dev_port>` where host is localhost, loopback or a private IPv4
pub fn is_allowed_origin(origin: &str, dev_port: u16) -> bool {
    let Some(authority) = origin.strip_prefix("http://") else {
        return false;
    };
    let Some((host, port)) = authority.rsplit_once(':') else {
        return false;
    };
    if port.parse::<u16>().ok() != Some(dev_port) {
        return false;
    }

    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<Ipv4Addr>() {
        Ok(ip) => ip.is_loopback() || ip.is_private(),
        Err(_) => false,
    }
}
