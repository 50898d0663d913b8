use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for termbridge
///
/// Every flag falls back to a `TERMBRIDGE_*` environment variable, then to
/// the config file, then to the built-in default.
#[derive(Parser, Debug, Default)]
#[command(name = "termbridge")]
#[command(about = "Expose tmux panes to a browser over HTTP and WebSocket")]
#[command(version)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(long, short = 'c', value_name = "PATH", env = "TERMBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind the HTTP server to
    #[arg(long, value_name = "ADDR", env = "TERMBRIDGE_BIND")]
    pub bind: Option<String>,

    /// Port to listen on
    #[arg(long, short = 'p', env = "TERMBRIDGE_PORT")]
    pub port: Option<u16>,

    /// Port of the browser client's dev server; only origins on this port pass CORS
    #[arg(long, value_name = "PORT", env = "TERMBRIDGE_CORS_PORT")]
    pub cors_port: Option<u16>,

    /// Seconds of client silence before /ws/terminals pushes a fresh list
    #[arg(long, value_name = "SECS", env = "TERMBRIDGE_LIST_REFRESH_SECS")]
    pub list_refresh_secs: Option<u64>,

    /// How often a subscribed pane is re-captured, in milliseconds
    #[arg(long, value_name = "MS", env = "TERMBRIDGE_STREAM_POLL_MS")]
    pub stream_poll_ms: Option<u64>,

    /// tmux socket name (as in `tmux -L`); the default server when unset
    #[arg(long, value_name = "NAME", env = "TERMBRIDGE_TMUX_SOCKET")]
    pub tmux_socket: Option<String>,

    /// Log filter used when RUST_LOG is not set (e.g. "info", "termbridge=debug")
    #[arg(long, value_name = "FILTER", env = "TERMBRIDGE_LOG")]
    pub log_level: Option<String>,
}
