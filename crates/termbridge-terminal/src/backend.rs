/// Terminal backend abstraction
///
/// The backend owns the real session state. Everything above this trait only
/// ever reads it back or asks the backend to act on it.
use async_trait::async_trait;
use termbridge_types::CursorPosition;
use thiserror::Error;

/// Closed set of backend failures callers are expected to branch on
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend could not be reached at all
    #[error("backend unreachable: {0}")]
    Connectivity(String),

    /// The session (or its parent window/tab) no longer exists
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend was reached but refused or failed the request
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, BackendError::Connectivity(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

/// Handle to one session inside the backend tree
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionRef {
    pub id: String,
}

impl SessionRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A tab and the sessions (panes) it holds, in backend order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tab {
    pub id: String,
    pub title: String,
    pub sessions: Vec<SessionRef>,
}

/// A top-level window and its tabs, in backend order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub id: String,
    pub title: String,
    pub tabs: Vec<Tab>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSize {
    pub width: u16,
    pub height: u16,
}

/// Scrollback bookkeeping for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineInfo {
    /// Lines that scrolled off the visible grid
    pub overflow: u64,
}

/// Visible screen lines plus the cursor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenContents {
    pub lines: Vec<String>,
    pub cursor: CursorPosition,
}

impl ScreenContents {
    pub fn new(lines: Vec<String>, cursor: CursorPosition) -> Self {
        Self { lines, cursor }
    }

    /// Lines joined with `\n`, no trailing newline
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Push stream of screen updates for one session
///
/// `close` must be called once the stream is no longer wanted so the backend
/// can release whatever it holds for it.
#[async_trait]
pub trait ScreenStream: Send {
    /// Wait for the next screen update
    async fn pull(&mut self) -> Result<ScreenContents, BackendError>;

    /// Release the backend side of the stream
    async fn close(self: Box<Self>);
}

/// Operations the session directory consumes from the terminal backend
///
/// Implementations must tolerate concurrent independent calls: a single
/// backend instance is shared by every request handler and delivery task.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Establish (or re-establish) the connection
    async fn connect(&self) -> Result<(), BackendError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Full window -> tab -> session tree
    async fn list_windows(&self) -> Result<Vec<Window>, BackendError>;

    /// Read a named session variable (`session.name`, `session.path`,
    /// `session.command`, `session.pid`); `None` when unset or unknown
    async fn get_variable(&self, session: &SessionRef, name: &str) -> Result<Option<String>, BackendError>;

    async fn get_grid_size(&self, session: &SessionRef) -> Result<GridSize, BackendError>;

    async fn get_screen_contents(&self, session: &SessionRef) -> Result<ScreenContents, BackendError>;

    async fn get_line_info(&self, session: &SessionRef) -> Result<LineInfo, BackendError>;

    /// Type literal text into the session
    async fn send_text(&self, session: &SessionRef, text: &str) -> Result<(), BackendError>;

    async fn open_screen_stream(&self, session: &SessionRef) -> Result<Box<dyn ScreenStream>, BackendError>;

    /// Get backend name for logging
    fn backend_name(&self) -> &str;
}
