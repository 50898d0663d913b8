use anyhow::Result;
use std::sync::Arc;

use termbridge_terminal::{TerminalManager, TmuxBackend};

use crate::config::Config;
use crate::web::server::{WebServer, WebServerConfig};

/// Wire the tmux backend, terminal manager and web server together
pub fn build_server(config: &Config) -> Result<WebServer> {
    let server_config = WebServerConfig {
        bind_addr: config.bind_addr()?,
        cors_dev_port: config.server.cors_dev_port,
        list_refresh: config.list_refresh(),
        update_buffer: config.terminals.update_buffer,
    };

    let backend = Arc::new(TmuxBackend::new(config.tmux_config()));
    let manager = Arc::new(TerminalManager::new(backend));

    Ok(WebServer::new(server_config, manager))
}

/// Run the web server
pub async fn run_web_server(config: Config) -> Result<()> {
    tracing::info!("Starting termbridge...");
    tracing::info!(
        bind = %config.server.bind,
        port = config.server.port,
        tmux_socket = ?config.terminals.tmux_socket,
        "Configuration loaded"
    );

    let server = build_server(&config)?;
    server.start().await?;

    Ok(())
}
