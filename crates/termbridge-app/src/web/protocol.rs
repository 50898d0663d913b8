use serde::{Deserialize, Serialize};
use termbridge_types::Session;

/// Messages pushed on the session directory socket (`/ws/terminals`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DirectoryMessage {
    /// Full session list
    Terminals(Vec<Session>),
    /// The list could not be read; the socket stays open
    Error { message: String },
}
