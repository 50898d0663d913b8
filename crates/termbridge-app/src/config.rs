//! Server configuration
//!
//! Values come from an optional TOML file; explicit CLI flags (or their
//! environment variables) override it.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use termbridge_terminal::{TmuxConfig, DEFAULT_STREAM_POLL_MS, DEFAULT_UPDATE_BUFFER};

use crate::cli::Cli;

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 4001;
pub const DEFAULT_CORS_DEV_PORT: u16 = 5173;
pub const DEFAULT_LIST_REFRESH_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log filter used when RUST_LOG is not set
    pub log_level: String,
    pub server: ServerSection,
    pub terminals: TerminalSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
    /// Browser origins are only accepted on this port
    pub cors_dev_port: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TerminalSection {
    pub list_refresh_secs: u64,
    pub stream_poll_ms: u64,
    /// Updates buffered per WebSocket listener before the stream waits
    pub update_buffer: usize,
    pub tmux_socket: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            server: ServerSection::default(),
            terminals: TerminalSection::default(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            cors_dev_port: DEFAULT_CORS_DEV_PORT,
        }
    }
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            list_refresh_secs: DEFAULT_LIST_REFRESH_SECS,
            stream_poll_ms: DEFAULT_STREAM_POLL_MS,
            update_buffer: DEFAULT_UPDATE_BUFFER,
            tmux_socket: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// File (if given) overlaid with CLI/env values
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(ref bind) = cli.bind {
            self.server.bind = bind.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(port) = cli.cors_port {
            self.server.cors_dev_port = port;
        }
        if let Some(secs) = cli.list_refresh_secs {
            self.terminals.list_refresh_secs = secs;
        }
        if let Some(ms) = cli.stream_poll_ms {
            self.terminals.stream_poll_ms = ms;
        }
        if let Some(ref socket) = cli.tmux_socket {
            self.terminals.tmux_socket = Some(socket.clone());
        }
        if let Some(ref level) = cli.log_level {
            self.log_level = level.clone();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.terminals.list_refresh_secs == 0 {
            anyhow::bail!("terminals.list_refresh_secs must be at least 1");
        }
        if self.terminals.stream_poll_ms == 0 {
            anyhow::bail!("terminals.stream_poll_ms must be at least 1");
        }
        if self.terminals.update_buffer == 0 {
            anyhow::bail!("terminals.update_buffer must be at least 1");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.bind, self.server.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.server.bind, self.server.port))
    }

    pub fn list_refresh(&self) -> Duration {
        Duration::from_secs(self.terminals.list_refresh_secs)
    }

    pub fn tmux_config(&self) -> TmuxConfig {
        TmuxConfig {
            socket_name: self.terminals.tmux_socket.clone(),
            poll_interval: Duration::from_millis(self.terminals.stream_poll_ms),
        }
    }
}
