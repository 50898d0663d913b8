/// Tmux-based terminal backend
///
/// tmux sessions play the role of windows, tmux windows the role of tabs and
/// panes are the sessions exposed to clients. Pane ids (`%N`) are stable for
/// the lifetime of the pane, which is what makes them usable as session ids.
use super::backend::{
    BackendError, GridSize, LineInfo, ScreenContents, ScreenStream, SessionRef, Tab, TerminalBackend, Window,
};
use async_trait::async_trait;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use termbridge_types::CursorPosition;
use tokio::process::Command;
use tokio::time::{Interval, MissedTickBehavior};

use super::DEFAULT_STREAM_POLL_MS;

/// Pane tree listing, one line per pane
const PANE_TREE_FORMAT: &str = "#{session_id}\t#{window_id}\t#{pane_id}\t#{session_name}\t#{window_name}";

/// Settings for talking to the tmux server
#[derive(Debug, Clone)]
pub struct TmuxConfig {
    /// Socket name passed as `tmux -L`; the default server when unset
    pub socket_name: Option<String>,
    /// How often a screen stream re-captures its pane
    pub poll_interval: Duration,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            socket_name: None,
            poll_interval: Duration::from_millis(DEFAULT_STREAM_POLL_MS),
        }
    }
}

/// Runs tmux commands; cheap to clone so screen streams can carry one
#[derive(Debug, Clone)]
struct TmuxRunner {
    socket_name: Option<String>,
    connected: Arc<AtomicBool>,
}

impl TmuxRunner {
    /// Run a tmux command and return stdout
    async fn run(&self, args: &[&str]) -> Result<String, BackendError> {
        let mut cmd = Command::new("tmux");
        if let Some(ref socket) = self.socket_name {
            cmd.args(["-L", socket]);
        }
        // A cancelled pull drops this future; don't leave the child behind
        cmd.args(args).kill_on_drop(true);

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(BackendError::Connectivity(format!("failed to run tmux: {}", e)));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = classify_tmux_error(&stderr);
            if err.is_connectivity() {
                self.connected.store(false, Ordering::SeqCst);
            }
            return Err(err);
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Expand a format string against a pane
    async fn display(&self, pane_id: &str, format: &str) -> Result<String, BackendError> {
        let output = self.run(&["display-message", "-p", "-t", pane_id, format]).await?;
        Ok(output.trim_end_matches('\n').to_string())
    }

    async fn capture(&self, pane_id: &str) -> Result<ScreenContents, BackendError> {
        let text = self.run(&["capture-pane", "-p", "-t", pane_id]).await?;
        let cursor = self.display(pane_id, "#{cursor_x} #{cursor_y}").await?;
        let (x, y) = parse_pair(&cursor)?;

        Ok(ScreenContents::new(
            text.lines().map(str::to_string).collect(),
            CursorPosition { x, y },
        ))
    }
}

/// Tmux backend using external tmux multiplexer
pub struct TmuxBackend {
    runner: TmuxRunner,
    poll_interval: Duration,
}

impl TmuxBackend {
    pub fn new(config: TmuxConfig) -> Self {
        Self {
            runner: TmuxRunner {
                socket_name: config.socket_name,
                connected: Arc::new(AtomicBool::new(false)),
            },
            poll_interval: config.poll_interval,
        }
    }
}

#[async_trait]
impl TerminalBackend for TmuxBackend {
    async fn connect(&self) -> Result<(), BackendError> {
        self.runner.run(&["list-sessions", "-F", "#{session_id}"]).await?;
        self.runner.connected.store(true, Ordering::SeqCst);
        tracing::debug!(socket = ?self.runner.socket_name, "Connected to tmux server");
        Ok(())
    }

    async fn disconnect(&self) {
        // Every call is its own tmux client; there is no connection to tear down
        self.runner.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.runner.connected.load(Ordering::SeqCst)
    }

    async fn list_windows(&self) -> Result<Vec<Window>, BackendError> {
        let output = self.runner.run(&["list-panes", "-a", "-F", PANE_TREE_FORMAT]).await?;
        Ok(parse_pane_tree(&output))
    }

    async fn get_variable(&self, session: &SessionRef, name: &str) -> Result<Option<String>, BackendError> {
        let Some(format) = variable_format(name) else {
            return Ok(None);
        };

        let value = self.runner.display(&session.id, format).await?;
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    async fn get_grid_size(&self, session: &SessionRef) -> Result<GridSize, BackendError> {
        let output = self.runner.display(&session.id, "#{pane_width} #{pane_height}").await?;
        let (width, height) = parse_pair(&output)?;
        Ok(GridSize { width, height })
    }

    async fn get_screen_contents(&self, session: &SessionRef) -> Result<ScreenContents, BackendError> {
        self.runner.capture(&session.id).await
    }

    async fn get_line_info(&self, session: &SessionRef) -> Result<LineInfo, BackendError> {
        let output = self.runner.display(&session.id, "#{history_size}").await?;
        let overflow = output
            .trim()
            .parse()
            .map_err(|_| unexpected_output(&output))?;
        Ok(LineInfo { overflow })
    }

    async fn send_text(&self, session: &SessionRef, text: &str) -> Result<(), BackendError> {
        for input in key_inputs(text) {
            match input {
                KeyInput::Literal(chunk) => {
                    let arg = literal_arg(&chunk);
                    self.runner
                        .run(&["send-keys", "-t", &session.id, "-l", "--", &arg])
                        .await?;
                }
                KeyInput::Enter => {
                    self.runner.run(&["send-keys", "-t", &session.id, "Enter"]).await?;
                }
            }
        }
        Ok(())
    }

    async fn open_screen_stream(&self, session: &SessionRef) -> Result<Box<dyn ScreenStream>, BackendError> {
        // Fail fast on a pane that is already gone
        self.runner.display(&session.id, "#{pane_id}").await?;

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Box::new(TmuxScreenStream {
            runner: self.runner.clone(),
            pane_id: session.id.clone(),
            interval,
            last: None,
        }))
    }

    fn backend_name(&self) -> &str {
        "tmux"
    }
}

/// Polling stream: re-captures the pane on every tick and yields on change
struct TmuxScreenStream {
    runner: TmuxRunner,
    pane_id: String,
    interval: Interval,
    last: Option<ScreenContents>,
}

#[async_trait]
impl ScreenStream for TmuxScreenStream {
    async fn pull(&mut self) -> Result<ScreenContents, BackendError> {
        loop {
            self.interval.tick().await;
            let contents = self.runner.capture(&self.pane_id).await?;
            if self.last.as_ref() != Some(&contents) {
                self.last = Some(contents.clone());
                return Ok(contents);
            }
        }
    }

    async fn close(self: Box<Self>) {
        tracing::trace!(pane_id = %self.pane_id, "Closed tmux screen stream");
    }
}

/// Format string backing a session variable
fn variable_format(name: &str) -> Option<&'static str> {
    match name {
        "session.name" => Some("#{pane_title}"),
        "session.path" => Some("#{pane_current_path}"),
        "session.command" => Some("#{pane_current_command}"),
        "session.pid" => Some("#{pane_pid}"),
        _ => None,
    }
}

/// Map tmux stderr onto the backend error kinds
fn classify_tmux_error(stderr: &str) -> BackendError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    if lower.contains("no server running")
        || lower.contains("failed to connect")
        || lower.contains("error connecting")
        || lower.contains("server exited")
    {
        BackendError::Connectivity(message)
    } else if lower.contains("can't find") {
        BackendError::NotFound(message)
    } else {
        BackendError::Rejected(message)
    }
}

fn unexpected_output(output: &str) -> BackendError {
    BackendError::Rejected(format!("unexpected tmux output: {:?}", output))
}

/// Parse `"<a> <b>"` as two numbers
fn parse_pair(output: &str) -> Result<(u16, u16), BackendError> {
    let mut parts = output.split_whitespace();
    match (
        parts.next().and_then(|p| p.parse().ok()),
        parts.next().and_then(|p| p.parse().ok()),
    ) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(unexpected_output(output)),
    }
}

/// Group the flat pane listing into windows and tabs, keeping tmux order
fn parse_pane_tree(output: &str) -> Vec<Window> {
    let mut windows: Vec<Window> = Vec::new();

    for line in output.lines() {
        let parts: Vec<&str> = line.splitn(5, '\t').collect();
        if parts.len() < 5 {
            tracing::warn!(line, "Skipping malformed tmux pane line");
            continue;
        }
        let (session_id, window_id, pane_id, session_name, window_name) =
            (parts[0], parts[1], parts[2], parts[3], parts[4]);

        let window_idx = match windows.iter().position(|w| w.id == session_id) {
            Some(idx) => idx,
            None => {
                windows.push(Window {
                    id: session_id.to_string(),
                    title: session_name.to_string(),
                    tabs: Vec::new(),
                });
                windows.len() - 1
            }
        };
        let window = &mut windows[window_idx];

        let tab_idx = match window.tabs.iter().position(|t| t.id == window_id) {
            Some(idx) => idx,
            None => {
                window.tabs.push(Tab {
                    id: window_id.to_string(),
                    title: window_name.to_string(),
                    sessions: Vec::new(),
                });
                window.tabs.len() - 1
            }
        };
        let tab = &mut window.tabs[tab_idx];

        tab.sessions.push(SessionRef::new(pane_id));
    }

    windows
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum KeyInput {
    Literal(String),
    Enter,
}

/// Split text into literal chunks and Enter presses
///
/// `send-keys -l` would type a bare newline as a literal character, so line
/// breaks are delivered as explicit Enter keys.
fn key_inputs(text: &str) -> Vec<KeyInput> {
    let mut inputs = Vec::new();
    for (idx, chunk) in text.split('\n').enumerate() {
        if idx > 0 {
            inputs.push(KeyInput::Enter);
        }
        if !chunk.is_empty() {
            inputs.push(KeyInput::Literal(chunk.to_string()));
        }
    }
    inputs
}

/// Escape a literal chunk for tmux's argument parser
///
/// tmux takes an argument ending in `;` as a command separator and turns a
/// trailing `\;` into `;`. It strips exactly one backslash before the final
/// `;`, so prefixing that `;` with a backslash round-trips every input.
fn literal_arg(chunk: &str) -> Cow<'_, str> {
    match chunk.strip_suffix(';') {
        Some(head) => Cow::Owned(format!("{}\\;", head)),
        None => Cow::Borrowed(chunk),
    }
}
