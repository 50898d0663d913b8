#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use termbridge::terminal::fake::FakeBackend;
use termbridge::types::CursorPosition;
use termbridge::web::{WebServer, WebServerConfig};
use termbridge::TerminalManager;

pub const DEV_PORT: u16 = 5173;

/// One window, one tab, two panes; `%1` has something on screen
pub fn backend() -> Arc<FakeBackend> {
    Arc::new(
        FakeBackend::new()
            .with_window("$0", "main", vec![("@0", "zsh", vec!["%0", "%1"])])
            .with_screen(
                "%1",
                &["$ ls", "Cargo.toml  README.md", "$ "],
                CursorPosition { x: 2, y: 2 },
            )
            .with_overflow("%1", 12),
    )
}

pub fn server(backend: Arc<FakeBackend>, list_refresh: Duration) -> WebServer {
    let manager = Arc::new(TerminalManager::new(backend));
    let config = WebServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        cors_dev_port: DEV_PORT,
        list_refresh,
        update_buffer: 16,
    };
    WebServer::new(config, manager)
}

/// Serve the router on an ephemeral port
pub async fn spawn(server: &WebServer) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
