//! Wire types shared across termbridge crates
//!
//! Everything here is serialized as snake_case JSON with RFC 3339 timestamps,
//! the shape the browser client consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// Constants
// ============================================================================

/// Name reported for a session that has no title
pub const DEFAULT_SESSION_NAME: &str = "Unnamed";

/// Working directory reported when the backend does not know it
pub const DEFAULT_WORKING_DIRECTORY: &str = "/";

/// Error text for commands aimed at a session that no longer exists
pub const SESSION_NOT_FOUND: &str = "Session not found";

// ============================================================================
// Sessions
// ============================================================================

/// One terminal pane as seen by the backend
///
/// A read-only projection: it is rebuilt from the backend on every listing
/// and never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub window_id: String,
    pub window_title: String,
    pub tab_id: String,
    pub tab_title: String,
    pub current_directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub rows: u16,
    pub columns: u16,
    /// The backend has no creation time, so this is the observation time
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
}

// ============================================================================
// Content
// ============================================================================

/// Cursor location on the visible screen, zero based
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: u16,
    pub y: u16,
}

/// Screen capture of a single session
///
/// `content` and `visible_content` are currently identical: scrollback is
/// not exposed, only the visible grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSnapshot {
    pub terminal_id: String,
    pub content: String,
    pub visible_content: String,
    pub cursor_position: CursorPosition,
    pub has_more_history: bool,
    pub timestamp: DateTime<Utc>,
}

impl ContentSnapshot {
    pub fn new(
        terminal_id: impl Into<String>,
        visible: String,
        cursor_position: CursorPosition,
        has_more_history: bool,
    ) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            content: visible.clone(),
            visible_content: visible,
            cursor_position,
            has_more_history,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

fn default_newline() -> bool {
    true
}

/// Text to type into a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Accepted for client compatibility; the id in the request path wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_id: Option<String>,
    pub command: String,
    #[serde(default = "default_newline")]
    pub newline: bool,
}

impl CommandRequest {
    /// The exact text handed to the backend
    pub fn payload(&self) -> String {
        command_payload(&self.command, self.newline)
    }
}

/// Append the submit newline when requested
pub fn command_payload(command: &str, newline: bool) -> String {
    if newline {
        format!("{}\n", command)
    } else {
        command.to_string()
    }
}

/// Result of a single command delivery; returned once, never updated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub terminal_id: String,
    pub command: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn success(terminal_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            command: command.into(),
            success: true,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failure(
        terminal_id: impl Into<String>,
        command: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            command: command.into(),
            success: false,
            timestamp: Utc::now(),
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// Live updates
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Output,
    Status,
    Closed,
}

/// Event pushed to a WebSocket listener; exists only in transit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub terminal_id: String,
    pub event_type: UpdateKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl UpdateEvent {
    pub fn new(terminal_id: impl Into<String>, event_type: UpdateKind, data: Value) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Screen refresh carrying the full visible text and the cursor
    pub fn output(terminal_id: impl Into<String>, content: &str, cursor: CursorPosition) -> Self {
        Self::new(
            terminal_id,
            UpdateKind::Output,
            json!({
                "content": content,
                "cursor": cursor,
            }),
        )
    }

    pub fn status(terminal_id: impl Into<String>, state: &str) -> Self {
        Self::new(terminal_id, UpdateKind::Status, json!({ "state": state }))
    }

    pub fn closed(terminal_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            terminal_id,
            UpdateKind::Closed,
            json!({ "reason": reason.into() }),
        )
    }
}
