use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use termbridge_types::{
    CommandOutcome, ContentSnapshot, Session, UpdateEvent, DEFAULT_SESSION_NAME, DEFAULT_WORKING_DIRECTORY,
    SESSION_NOT_FOUND,
};
use tokio::sync::mpsc;

use super::backend::{BackendError, SessionRef, TerminalBackend, Window};
use super::registry::{StreamRegistry, StreamTicket, Subscription};

/// Session directory and update broadcaster over a single backend
///
/// Listing, content capture and command delivery go straight to the backend;
/// the only state kept here is the registry of per-session delivery tasks.
pub struct TerminalManager {
    backend: Arc<dyn TerminalBackend>,
    streams: StreamRegistry,
}

impl std::fmt::Debug for TerminalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalManager")
            .field("backend", &self.backend.backend_name())
            .field("active_streams", &self.streams.len())
            .finish()
    }
}

impl TerminalManager {
    pub fn new(backend: Arc<dyn TerminalBackend>) -> Self {
        Self {
            backend,
            streams: StreamRegistry::new(),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.backend_name()
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_connected()
    }

    pub async fn connect(&self) -> Result<(), BackendError> {
        self.backend.connect().await?;
        tracing::info!(backend = self.backend.backend_name(), "Connected to terminal backend");
        Ok(())
    }

    /// Reconnect if the backend reports it is not connected
    ///
    /// This is the only reconnection path: it runs when a request arrives,
    /// never in the background.
    pub async fn ensure_connected(&self) -> Result<(), BackendError> {
        if self.backend.is_connected() {
            return Ok(());
        }
        self.connect().await.map_err(|e| {
            tracing::warn!(backend = self.backend.backend_name(), "Backend reconnection failed: {}", e);
            e
        })
    }

    /// Every session across all windows and tabs, in backend order
    ///
    /// A session whose metadata cannot be read is skipped; it never aborts the
    /// rest of the listing.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, BackendError> {
        let windows = self.backend.list_windows().await?;
        let mut seen = HashSet::new();
        let mut sessions = Vec::new();

        for window in &windows {
            for tab in &window.tabs {
                for session_ref in &tab.sessions {
                    if !seen.insert(session_ref.id.clone()) {
                        tracing::warn!(session_id = %session_ref.id, "Backend reported duplicate session, skipping");
                        continue;
                    }

                    match self.describe(window, &tab.id, &tab.title, session_ref).await {
                        Ok(session) => sessions.push(session),
                        Err(e) => {
                            tracing::error!(session_id = %session_ref.id, "Error getting session info: {}", e);
                        }
                    }
                }
            }
        }

        Ok(sessions)
    }

    async fn describe(
        &self,
        window: &Window,
        tab_id: &str,
        tab_title: &str,
        session_ref: &SessionRef,
    ) -> Result<Session, BackendError> {
        let name = self.backend.get_variable(session_ref, "session.name").await?;
        let cwd = self.backend.get_variable(session_ref, "session.path").await?;
        let command = self.backend.get_variable(session_ref, "session.command").await?;
        let pid = self.backend.get_variable(session_ref, "session.pid").await?;
        let grid = self.backend.get_grid_size(session_ref).await?;
        let now = Utc::now();

        Ok(Session {
            id: session_ref.id.clone(),
            name: name.unwrap_or_else(|| DEFAULT_SESSION_NAME.to_string()),
            window_id: window.id.clone(),
            window_title: window.title.clone(),
            tab_id: tab_id.to_string(),
            tab_title: tab_title.to_string(),
            current_directory: cwd.unwrap_or_else(|| DEFAULT_WORKING_DIRECTORY.to_string()),
            command,
            pid: pid.and_then(|p| p.trim().parse().ok()),
            rows: grid.height,
            columns: grid.width,
            created_at: now,
            last_activity: now,
            is_active: true,
        })
    }

    /// Find a session by id with a linear scan of the current tree
    async fn resolve(&self, session_id: &str) -> Result<Option<SessionRef>, BackendError> {
        let windows = self.backend.list_windows().await?;
        Ok(windows
            .into_iter()
            .flat_map(|w| w.tabs)
            .flat_map(|t| t.sessions)
            .find(|s| s.id == session_id))
    }

    /// Current screen of a session; `None` once the session is gone
    pub async fn get_content(&self, session_id: &str) -> Result<Option<ContentSnapshot>, BackendError> {
        let Some(session) = self.resolve(session_id).await? else {
            return Ok(None);
        };

        let captured = async {
            let contents = self.backend.get_screen_contents(&session).await?;
            let line_info = self.backend.get_line_info(&session).await?;
            Ok::<_, BackendError>((contents, line_info))
        }
        .await;

        match captured {
            Ok((contents, line_info)) => Ok(Some(ContentSnapshot::new(
                session_id,
                contents.text(),
                contents.cursor,
                line_info.overflow > 0,
            ))),
            Err(e) if e.is_connectivity() => Err(e),
            Err(e) => {
                tracing::error!(session_id, "Error getting terminal content: {}", e);
                Ok(None)
            }
        }
    }

    /// Type a command into a session
    ///
    /// Never fails: an unknown session or a backend error comes back as an
    /// unsuccessful outcome. Commands are not idempotent, so nothing retries.
    pub async fn send_command(&self, session_id: &str, command: &str, newline: bool) -> CommandOutcome {
        let session = match self.resolve(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return CommandOutcome::failure(session_id, command, SESSION_NOT_FOUND),
            Err(e) => {
                tracing::error!(session_id, "Error resolving session for command: {}", e);
                return CommandOutcome::failure(session_id, command, e.to_string());
            }
        };

        let text = termbridge_types::command_payload(command, newline);
        match self.backend.send_text(&session, &text).await {
            Ok(()) => {
                tracing::debug!(session_id, newline, "Sent command");
                CommandOutcome::success(session_id, command)
            }
            Err(e) => {
                tracing::error!(session_id, "Error sending command: {}", e);
                CommandOutcome::failure(session_id, command, e.to_string())
            }
        }
    }

    /// Start forwarding screen updates of a session into `listener`
    ///
    /// At most one delivery task runs per session; subscribing again while one
    /// is active changes nothing and reports [`Subscription::AlreadyActive`].
    pub async fn subscribe(
        &self,
        session_id: &str,
        listener: mpsc::Sender<UpdateEvent>,
    ) -> Result<Subscription, BackendError> {
        if let Some(ticket) = self.streams.active(session_id) {
            return Ok(Subscription::AlreadyActive(ticket));
        }

        let session = self
            .resolve(session_id)
            .await?
            .ok_or_else(|| BackendError::NotFound(session_id.to_string()))?;

        let subscription = self.streams.start(self.backend.clone(), session, listener)?;
        if subscription.is_started() {
            tracing::info!(session_id, "Started screen stream");
        }
        Ok(subscription)
    }

    /// Stop the delivery task of a session; `false` if none was running
    pub async fn unsubscribe(&self, session_id: &str) -> bool {
        self.streams.stop(session_id).await
    }

    /// Stop the delivery task a subscriber started, and nothing newer
    pub async fn unsubscribe_ticket(&self, ticket: &StreamTicket) -> bool {
        self.streams.stop_ticket(ticket).await
    }

    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.streams.contains(session_id)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.streams.len()
    }

    /// Stop every delivery task, then let go of the backend
    pub async fn shutdown(&self) {
        self.streams.close().await;
        self.backend.disconnect().await;
        tracing::info!(backend = self.backend.backend_name(), "Disconnected from terminal backend");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeBackend;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use termbridge_types::{CursorPosition, UpdateKind};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn manager_with(backend: FakeBackend) -> (TerminalManager, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        (TerminalManager::new(backend.clone()), backend)
    }

    fn two_windows() -> FakeBackend {
        FakeBackend::new()
            .with_window("w0", "main", vec![("t0", "shell", vec!["s1", "s2"]), ("t1", "editor", vec!["s3"])])
            .with_window("w1", "logs", vec![("t2", "tail", vec!["s4"])])
    }

    #[tokio::test]
    async fn test_list_sessions_flattens_in_backend_order() {
        let (manager, _) = manager_with(two_windows());
        let sessions = manager.list_sessions().await.unwrap();

        let ids: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3", "s4"]);

        let s3 = &sessions[2];
        assert_eq!(s3.window_id, "w0");
        assert_eq!(s3.window_title, "main");
        assert_eq!(s3.tab_id, "t1");
        assert_eq!(s3.tab_title, "editor");
        assert_eq!(s3.name, "pane s3");
        assert_eq!(s3.current_directory, "/home/test");
        assert_eq!(s3.command.as_deref(), Some("zsh"));
        assert_eq!(s3.pid, Some(4242));
        assert_eq!((s3.rows, s3.columns), (24, 80));
        assert!(s3.is_active);
    }

    #[tokio::test]
    async fn test_list_sessions_skips_broken_session() {
        let (manager, _) = manager_with(
            FakeBackend::new()
                .with_window("w0", "main", vec![("t0", "shell", vec!["a", "b", "c"])])
                .with_broken_session("b"),
        );
        let sessions = manager.list_sessions().await.unwrap();

        let ids: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_list_sessions_drops_duplicate_ids() {
        let (manager, _) = manager_with(
            FakeBackend::new()
                .with_window("w0", "main", vec![("t0", "shell", vec!["a", "b"])])
                .with_window("w1", "other", vec![("t1", "shell", vec!["a"])]),
        );
        let sessions = manager.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].window_id, "w0");
    }

    #[tokio::test]
    async fn test_list_sessions_unreachable_backend_errors() {
        let (manager, backend) = manager_with(two_windows());
        backend.set_reachable(false);
        let err = manager.list_sessions().await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_get_content() {
        let (manager, _) = manager_with(
            two_windows()
                .with_screen("s2", &["$ ls", "Cargo.toml", "$ "], CursorPosition { x: 2, y: 2 })
                .with_overflow("s2", 12),
        );
        let snapshot = manager.get_content("s2").await.unwrap().unwrap();

        assert_eq!(snapshot.terminal_id, "s2");
        assert_eq!(snapshot.content, "$ ls\nCargo.toml\n$ ");
        assert_eq!(snapshot.visible_content, snapshot.content);
        assert_eq!(snapshot.cursor_position, CursorPosition { x: 2, y: 2 });
        assert!(snapshot.has_more_history);
    }

    #[tokio::test]
    async fn test_get_content_unknown_is_none() {
        let (manager, backend) = manager_with(two_windows());
        assert!(manager.get_content("nope").await.unwrap().is_none());

        backend.remove_session("s1");
        assert!(manager.get_content("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_command_appends_newline() {
        let (manager, backend) = manager_with(two_windows());

        let outcome = manager.send_command("s1", "echo hi", true).await;
        assert!(outcome.success);
        assert_eq!(outcome.command, "echo hi");

        let outcome = manager.send_command("s1", "echo hi", false).await;
        assert!(outcome.success);

        assert_eq!(
            backend.sent_texts(),
            vec![
                ("s1".to_string(), "echo hi\n".to_string()),
                ("s1".to_string(), "echo hi".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_send_command_unknown_session_fails_softly() {
        let (manager, backend) = manager_with(two_windows());
        let outcome = manager.send_command("gone", "ls", true).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some(SESSION_NOT_FOUND));
        assert!(backend.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn test_send_command_backend_error_is_reported() {
        let (manager, backend) = manager_with(two_windows());
        backend.fail_sends(BackendError::Rejected("pane is dead".to_string()));

        let outcome = manager.send_command("s1", "ls", true).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("pane is dead"));
    }

    #[tokio::test]
    async fn test_subscribe_twice_one_task() {
        let (manager, backend) = manager_with(two_windows());
        let (tx, _rx) = mpsc::channel(8);

        let first = manager.subscribe("s1", tx.clone()).await.unwrap();
        assert!(first.is_started());
        assert_eq!(
            manager.subscribe("s1", tx).await.unwrap(),
            Subscription::AlreadyActive(first.ticket().clone())
        );
        assert_eq!(manager.active_subscriptions(), 1);

        backend.wait_for_open_streams(1).await;
        assert_eq!(backend.streams_opened(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscribe_unknown_session() {
        let (manager, _) = manager_with(two_windows());
        let (tx, _rx) = mpsc::channel(8);

        let err = manager.subscribe("missing", tx).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!manager.is_subscribed("missing"));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (manager, backend) = manager_with(two_windows());
        let (tx, _rx) = mpsc::channel(8);

        assert!(!manager.unsubscribe("s1").await);

        manager.subscribe("s1", tx).await.unwrap();
        backend.wait_for_open_streams(1).await;
        assert!(manager.unsubscribe("s1").await);
        assert!(!manager.is_subscribed("s1"));
        assert_eq!(backend.streams_closed(), 1);

        assert!(!manager.unsubscribe("s1").await);
    }

    #[tokio::test]
    async fn test_unsubscribe_ticket_after_resubscribe() {
        let (manager, backend) = manager_with(two_windows());
        let (tx, _rx) = mpsc::channel(8);

        let stale = manager.subscribe("s1", tx.clone()).await.unwrap();
        backend.wait_for_open_streams(1).await;
        backend.fail_stream("s1", BackendError::NotFound("pane gone".to_string()));
        timeout(WAIT, stale.ticket().ended()).await.unwrap();

        let current = manager.subscribe("s1", tx).await.unwrap();
        assert!(current.is_started());

        assert!(!manager.unsubscribe_ticket(stale.ticket()).await);
        assert!(manager.is_subscribed("s1"));

        assert!(manager.unsubscribe_ticket(current.ticket()).await);
        assert!(!manager.is_subscribed("s1"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_deliveries() {
        let (manager, backend) = manager_with(two_windows());
        let (tx, mut rx) = mpsc::channel(8);

        manager.subscribe("s1", tx.clone()).await.unwrap();
        manager.subscribe("s4", tx.clone()).await.unwrap();
        backend.wait_for_open_streams(2).await;

        backend.push_screen("s4", &["before"]);
        let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.event_type, UpdateKind::Output);

        manager.shutdown().await;
        assert_eq!(manager.active_subscriptions(), 0);
        assert_eq!(backend.streams_closed(), 2);
        assert!(!manager.is_connected());

        backend.push_screen("s1", &["after"]);
        backend.push_screen("s4", &["after"]);
        drop(tx);
        assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ensure_connected_reconnects_on_demand() {
        let (manager, backend) = manager_with(two_windows().disconnected());
        assert!(!manager.is_connected());

        manager.ensure_connected().await.unwrap();
        assert!(manager.is_connected());

        backend.set_reachable(false);
        assert!(manager.ensure_connected().await.unwrap_err().is_connectivity());
    }
}
