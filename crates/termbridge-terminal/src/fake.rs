//! In-memory backend for tests
//!
//! Holds a scripted window/tab/session tree. Screen streams are fed by hand
//! with [`FakeBackend::push_screen`] and [`FakeBackend::fail_stream`], and the
//! backend counts how many streams were opened and closed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use termbridge_types::CursorPosition;
use tokio::sync::mpsc;

use crate::backend::{
    BackendError, GridSize, LineInfo, ScreenContents, ScreenStream, SessionRef, Tab, TerminalBackend, Window,
};

type StreamFeed = mpsc::UnboundedSender<Result<ScreenContents, BackendError>>;

pub struct FakeBackend {
    windows: Mutex<Vec<Window>>,
    broken: Mutex<HashSet<String>>,
    screens: Mutex<HashMap<String, ScreenContents>>,
    overflow: Mutex<HashMap<String, u64>>,
    sent: Mutex<Vec<(String, String)>>,
    send_error: Mutex<Option<BackendError>>,
    reachable: AtomicBool,
    connected: AtomicBool,
    feeds: Mutex<HashMap<String, StreamFeed>>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    /// Reachable, connected backend with an empty tree
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(Vec::new()),
            broken: Mutex::new(HashSet::new()),
            screens: Mutex::new(HashMap::new()),
            overflow: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            send_error: Mutex::new(None),
            reachable: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            feeds: Mutex::new(HashMap::new()),
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Add a window; each tab is `(id, title, session ids)`
    pub fn with_window(self, id: &str, title: &str, tabs: Vec<(&str, &str, Vec<&str>)>) -> Self {
        let window = Window {
            id: id.to_string(),
            title: title.to_string(),
            tabs: tabs
                .into_iter()
                .map(|(tab_id, tab_title, sessions)| Tab {
                    id: tab_id.to_string(),
                    title: tab_title.to_string(),
                    sessions: sessions.into_iter().map(SessionRef::new).collect(),
                })
                .collect(),
        };
        self.windows.lock().unwrap().push(window);
        self
    }

    /// Metadata reads for this session fail
    pub fn with_broken_session(self, id: &str) -> Self {
        self.broken.lock().unwrap().insert(id.to_string());
        self
    }

    pub fn with_screen(self, id: &str, lines: &[&str], cursor: CursorPosition) -> Self {
        self.screens
            .lock()
            .unwrap()
            .insert(id.to_string(), screen(lines, cursor));
        self
    }

    pub fn with_overflow(self, id: &str, overflow: u64) -> Self {
        self.overflow.lock().unwrap().insert(id.to_string(), overflow);
        self
    }

    /// Start disconnected; `connect` succeeds while the backend is reachable
    pub fn disconnected(self) -> Self {
        self.connected.store(false, Ordering::SeqCst);
        self
    }

    /// An unreachable backend fails `connect` and every tree walk
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Make every `send_text` fail with `error`
    pub fn fail_sends(&self, error: BackendError) {
        *self.send_error.lock().unwrap() = Some(error);
    }

    /// Drop a session from the tree, as if it was closed
    pub fn remove_session(&self, id: &str) {
        for window in self.windows.lock().unwrap().iter_mut() {
            for tab in window.tabs.iter_mut() {
                tab.sessions.retain(|s| s.id != id);
            }
        }
    }

    /// Texts delivered with `send_text`, as `(session id, text)`
    pub fn sent_texts(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Feed a screen update to the open stream of a session, if any
    pub fn push_screen(&self, id: &str, lines: &[&str]) {
        let cursor = CursorPosition {
            x: lines.last().map(|l| l.len() as u16).unwrap_or(0),
            y: lines.len().saturating_sub(1) as u16,
        };
        if let Some(feed) = self.feeds.lock().unwrap().get(id) {
            let _ = feed.send(Ok(screen(lines, cursor)));
        }
    }

    /// Make the next pull on a session's stream fail
    pub fn fail_stream(&self, id: &str, error: BackendError) {
        if let Some(feed) = self.feeds.lock().unwrap().get(id) {
            let _ = feed.send(Err(error));
        }
    }

    pub fn streams_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn streams_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn wait_for_open_streams(&self, count: usize) {
        wait_until(|| self.streams_opened() >= count).await;
    }

    pub async fn wait_for_closed_streams(&self, count: usize) {
        wait_until(|| self.streams_closed() >= count).await;
    }

    fn exists(&self, id: &str) -> bool {
        self.windows
            .lock()
            .unwrap()
            .iter()
            .flat_map(|w| w.tabs.iter())
            .flat_map(|t| t.sessions.iter())
            .any(|s| s.id == id)
    }

    fn check_session(&self, session: &SessionRef) -> Result<(), BackendError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BackendError::Connectivity("fake backend unreachable".to_string()));
        }
        if !self.exists(&session.id) {
            return Err(BackendError::NotFound(format!("can't find session: {}", session.id)));
        }
        Ok(())
    }

    fn check_metadata(&self, session: &SessionRef) -> Result<(), BackendError> {
        self.check_session(session)?;
        if self.broken.lock().unwrap().contains(&session.id) {
            return Err(BackendError::Rejected(format!("metadata unavailable for {}", session.id)));
        }
        Ok(())
    }
}

fn screen(lines: &[&str], cursor: CursorPosition) -> ScreenContents {
    ScreenContents::new(lines.iter().map(|l| l.to_string()).collect(), cursor)
}

async fn wait_until(condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "fake backend condition not reached in time");
}

#[async_trait]
impl TerminalBackend for FakeBackend {
    async fn connect(&self) -> Result<(), BackendError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BackendError::Connectivity("fake backend unreachable".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list_windows(&self) -> Result<Vec<Window>, BackendError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BackendError::Connectivity("fake backend unreachable".to_string()));
        }
        Ok(self.windows.lock().unwrap().clone())
    }

    async fn get_variable(&self, session: &SessionRef, name: &str) -> Result<Option<String>, BackendError> {
        self.check_metadata(session)?;
        Ok(match name {
            "session.name" => Some(format!("pane {}", session.id)),
            "session.path" => Some("/home/test".to_string()),
            "session.command" => Some("zsh".to_string()),
            "session.pid" => Some("4242".to_string()),
            _ => None,
        })
    }

    async fn get_grid_size(&self, session: &SessionRef) -> Result<GridSize, BackendError> {
        self.check_metadata(session)?;
        Ok(GridSize { width: 80, height: 24 })
    }

    async fn get_screen_contents(&self, session: &SessionRef) -> Result<ScreenContents, BackendError> {
        self.check_session(session)?;
        Ok(self
            .screens
            .lock()
            .unwrap()
            .get(&session.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_line_info(&self, session: &SessionRef) -> Result<LineInfo, BackendError> {
        self.check_session(session)?;
        let overflow = self.overflow.lock().unwrap().get(&session.id).copied().unwrap_or(0);
        Ok(LineInfo { overflow })
    }

    async fn send_text(&self, session: &SessionRef, text: &str) -> Result<(), BackendError> {
        self.check_session(session)?;
        if let Some(err) = self.send_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.sent
            .lock()
            .unwrap()
            .push((session.id.clone(), text.to_string()));
        Ok(())
    }

    async fn open_screen_stream(&self, session: &SessionRef) -> Result<Box<dyn ScreenStream>, BackendError> {
        self.check_session(session)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().insert(session.id.clone(), tx);
        self.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FakeStream {
            rx,
            closed: Arc::clone(&self.closed),
        }))
    }

    fn backend_name(&self) -> &str {
        "fake"
    }
}

struct FakeStream {
    rx: mpsc::UnboundedReceiver<Result<ScreenContents, BackendError>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl ScreenStream for FakeStream {
    async fn pull(&mut self) -> Result<ScreenContents, BackendError> {
        match self.rx.recv().await {
            Some(next) => next,
            None => Err(BackendError::Connectivity("stream feed dropped".to_string())),
        }
    }

    async fn close(self: Box<Self>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
