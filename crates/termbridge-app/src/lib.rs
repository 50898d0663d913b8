//! termbridge application library
//!
//! HTTP/WebSocket front for the terminal session directory: CLI, config,
//! logging setup and the axum router.

// Re-export workspace crates
pub use termbridge_terminal::{self as terminal, TerminalManager};
pub use termbridge_types as types;

pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod web;

pub use app::run_web_server;
pub use cli::Cli;
pub use config::Config;
