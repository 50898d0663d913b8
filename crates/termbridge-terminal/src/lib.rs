// Terminal session directory and live update broadcasting
//
// This crate talks to the terminal multiplexer (tmux) through a narrow backend
// trait, flattens its window/tab/session tree into a session directory, and runs
// one delivery task per subscribed session that forwards screen updates to a
// listener.

pub mod backend;
mod manager;
mod registry;
mod tmux_backend;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

// Re-export public API
pub use backend::{
    BackendError, GridSize, LineInfo, ScreenContents, ScreenStream, SessionRef, Tab,
    TerminalBackend, Window,
};
pub use manager::TerminalManager;
pub use registry::{StreamRegistry, StreamTicket, Subscription};
pub use tmux_backend::{TmuxBackend, TmuxConfig};

// Constants
pub const DEFAULT_STREAM_POLL_MS: u64 = 250;
pub const DEFAULT_UPDATE_BUFFER: usize = 64;
