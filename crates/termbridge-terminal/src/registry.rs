//! Per-session delivery tasks and the registry that tracks them.
//!
//! Each subscribed session gets exactly one task. The task owns the backend
//! screen stream, pulls updates in backend order and forwards them into the
//! listener channel. The registry map is the only shared mutable state; its
//! lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use termbridge_types::UpdateEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backend::{BackendError, SessionRef, TerminalBackend};

/// Names one delivery task
///
/// Session ids are reused once a task ends, so stopping by ticket only ever
/// touches the task the ticket was issued for.
#[derive(Debug, Clone)]
pub struct StreamTicket {
    session_id: String,
    generation: u64,
    ended: CancellationToken,
}

impl StreamTicket {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Resolves once the delivery task has finished, however it ended
    pub async fn ended(&self) {
        self.ended.cancelled().await
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }
}

impl PartialEq for StreamTicket {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation && self.session_id == other.session_id
    }
}

impl Eq for StreamTicket {}

/// Result of a subscribe request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// A new delivery task was started for the listener
    Started(StreamTicket),
    /// The session already has a delivery task; nothing changed
    AlreadyActive(StreamTicket),
}

impl Subscription {
    pub fn ticket(&self) -> &StreamTicket {
        match self {
            Subscription::Started(ticket) | Subscription::AlreadyActive(ticket) => ticket,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, Subscription::Started(_))
    }
}

/// Running delivery task
struct StreamHandle {
    generation: u64,
    cancel: CancellationToken,
    ended: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamHandle {
    fn ticket(&self, session_id: &str) -> StreamTicket {
        StreamTicket {
            session_id: session_id.to_string(),
            generation: self.generation,
            ended: self.ended.clone(),
        }
    }

    /// Cancel the task and wait until it has released its stream
    async fn stop(self, session_id: &str) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!(session_id, "Delivery task panicked: {}", e);
            }
        }
    }
}

type HandleMap = HashMap<String, StreamHandle>;

/// Guarded map from session id to its delivery task
#[derive(Clone, Default)]
pub struct StreamRegistry {
    handles: Arc<Mutex<HandleMap>>,
    next_generation: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HandleMap> {
        // Every critical section is a single map operation, so poison is harmless
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Ticket of the running task for a session, if any
    pub fn active(&self, session_id: &str) -> Option<StreamTicket> {
        self.lock().get(session_id).map(|handle| handle.ticket(session_id))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start a delivery task for `session` unless one is already registered
    pub fn start(
        &self,
        backend: Arc<dyn TerminalBackend>,
        session: SessionRef,
        listener: mpsc::Sender<UpdateEvent>,
    ) -> Result<Subscription, BackendError> {
        let mut handles = self.lock();
        // Checked under the lock so shutdown's drain cannot miss a late insert
        if self.is_closed() {
            return Err(BackendError::Connectivity("terminal manager is shut down".to_string()));
        }
        if let Some(handle) = handles.get(&session.id) {
            return Ok(Subscription::AlreadyActive(handle.ticket(&session.id)));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let ended = CancellationToken::new();
        let task = tokio::spawn(deliver(
            backend,
            session.clone(),
            listener,
            Lifecycle {
                session_id: session.id.clone(),
                generation,
                cancel: cancel.clone(),
                ended: ended.clone(),
                registry: self.clone(),
            },
        ));

        let handle = StreamHandle {
            generation,
            cancel,
            ended,
            task,
        };
        let ticket = handle.ticket(&session.id);
        handles.insert(session.id, handle);
        Ok(Subscription::Started(ticket))
    }

    /// Stop the delivery task for a session; `false` if there was none
    pub async fn stop(&self, session_id: &str) -> bool {
        let handle = self.lock().remove(session_id);
        match handle {
            Some(handle) => {
                handle.stop(session_id).await;
                tracing::debug!(session_id, "Stopped screen stream");
                true
            }
            None => false,
        }
    }

    /// Stop the task a ticket was issued for
    ///
    /// `false` when that task already ended; a newer task for the same
    /// session is left alone.
    pub async fn stop_ticket(&self, ticket: &StreamTicket) -> bool {
        let handle = {
            let mut handles = self.lock();
            let owned = handles.get(&ticket.session_id).map(|h| h.generation) == Some(ticket.generation);
            if owned {
                handles.remove(&ticket.session_id)
            } else {
                None
            }
        };
        match handle {
            Some(handle) => {
                handle.stop(&ticket.session_id).await;
                tracing::debug!(session_id = %ticket.session_id, "Stopped screen stream");
                true
            }
            None => false,
        }
    }

    /// Stop every task and refuse new ones
    pub async fn close(&self) {
        let drained: Vec<(String, StreamHandle)> = {
            let mut handles = self.lock();
            self.closed.store(true, Ordering::SeqCst);
            handles.drain().collect()
        };

        let count = drained.len();
        futures::future::join_all(
            drained
                .into_iter()
                .map(|(session_id, handle)| async move { handle.stop(&session_id).await }),
        )
        .await;

        if count > 0 {
            tracing::info!(count, "Stopped all screen streams");
        }
    }

    /// Called by a task that ended on its own; only removes its own entry
    fn release(&self, session_id: &str, generation: u64) {
        let mut handles = self.lock();
        if handles.get(session_id).map(|h| h.generation) == Some(generation) {
            handles.remove(session_id);
        }
    }
}

/// Registry bookkeeping owned by a delivery task
///
/// Dropped on every exit path, panics included: the task's own entry is
/// released first, then ticket holders are told the task ended.
struct Lifecycle {
    session_id: String,
    generation: u64,
    cancel: CancellationToken,
    ended: CancellationToken,
    registry: StreamRegistry,
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.registry.release(&self.session_id, self.generation);
        self.ended.cancel();
    }
}

/// Body of a delivery task
async fn deliver(
    backend: Arc<dyn TerminalBackend>,
    session: SessionRef,
    listener: mpsc::Sender<UpdateEvent>,
    lifecycle: Lifecycle,
) {
    let session_id = session.id.clone();
    let cancel = lifecycle.cancel.clone();

    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = backend.open_screen_stream(&session) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(session_id = %session_id, "Failed to open screen stream: {}", e);
            let _ = listener.try_send(UpdateEvent::closed(&session_id, e.to_string()));
            return;
        }
    };
    tracing::debug!(session_id = %session_id, "Screen stream opened");

    loop {
        let pulled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            pulled = stream.pull() => pulled,
        };

        let contents = match pulled {
            Ok(contents) => contents,
            Err(e) => {
                tracing::error!(session_id = %session_id, "Screen stream failed: {}", e);
                let _ = listener.try_send(UpdateEvent::closed(&session_id, e.to_string()));
                break;
            }
        };

        let event = UpdateEvent::output(&session_id, &contents.text(), contents.cursor);
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = listener.send(event) => sent,
        };
        if sent.is_err() {
            tracing::debug!(session_id = %session_id, "Listener went away");
            break;
        }
    }

    stream.close().await;
    drop(lifecycle);
}
