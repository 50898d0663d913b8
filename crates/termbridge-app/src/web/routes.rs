use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use termbridge_terminal::{BackendError, StreamTicket, Subscription, TerminalManager};
use termbridge_types::{CommandOutcome, CommandRequest, ContentSnapshot, Session, UpdateEvent};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::web::protocol::DirectoryMessage;

/// Application state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TerminalManager>,
    /// Idle time after which `/ws/terminals` pushes a fresh list
    pub list_refresh: Duration,
    /// Per-listener update buffer for `/ws/terminals/:id`
    pub update_buffer: usize,
    /// Cancelled when the server shuts down so open sockets wind down
    pub shutdown: CancellationToken,
}

/// Create router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // API routes
        .route("/api/terminals", get(list_terminals))
        .route("/api/terminals/:id/content", get(get_terminal_content))
        .route("/api/terminals/:id/command", post(send_command))
        // WebSocket endpoints
        .route("/ws/terminals", get(terminals_websocket))
        .route("/ws/terminals/:id", get(terminal_websocket))
        .with_state(state)
}

/// GET /health - Service and backend status
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "backend": state.manager.backend_name(),
        "backend_connected": state.manager.is_connected(),
        "active_streams": state.manager.active_subscriptions(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /api/terminals - List all terminal sessions
async fn list_terminals(State(state): State<AppState>) -> Result<Json<Vec<Session>>, AppError> {
    state.manager.ensure_connected().await?;
    let sessions = state.manager.list_sessions().await.map_err(|e| {
        tracing::error!("Error getting terminals: {}", e);
        AppError::from(e)
    })?;
    Ok(Json(sessions))
}

/// GET /api/terminals/:id/content - Current screen of one session
async fn get_terminal_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContentSnapshot>, AppError> {
    state.manager.ensure_connected().await?;
    let content = state
        .manager
        .get_content(&id)
        .await?
        .ok_or_else(|| AppError::NotFound("Terminal not found".into()))?;

    Ok(Json(content))
}

/// POST /api/terminals/:id/command - Type a command into a session
async fn send_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<CommandOutcome>, AppError> {
    let Json(request) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    state.manager.ensure_connected().await?;

    let outcome = state
        .manager
        .send_command(&id, &request.command, request.newline)
        .await;

    if !outcome.success {
        let reason = outcome.error.unwrap_or_else(|| "Command failed".to_string());
        return Err(AppError::BadRequest(reason));
    }
    Ok(Json(outcome))
}

/// GET /ws/terminals/:id - Live screen updates for one session
async fn terminal_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| {
        let span = tracing::info_span!("ws_terminal", connection_id = %Uuid::new_v4(), session_id = %id);
        handle_terminal_socket(socket, state, id).instrument(span)
    })
}

/// Subscribe for the lifetime of the socket
///
/// Only the connection that started the subscription tears it down again,
/// and only the delivery task it started. A connection that found the
/// session already streaming gets no output; it is sent a `closed` event
/// once the owning stream ends.
async fn handle_terminal_socket(socket: WebSocket, state: AppState, terminal_id: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<UpdateEvent>(state.update_buffer);

    let mut owned: Option<StreamTicket> = None;
    let mut watched: Option<StreamTicket> = None;
    match subscribe(&state, &terminal_id, tx.clone()).await {
        Ok(Subscription::Started(ticket)) => owned = Some(ticket),
        Ok(Subscription::AlreadyActive(ticket)) => {
            tracing::info!("Session already streams to another connection");
            let _ = tx.try_send(UpdateEvent::status(&terminal_id, "already_streaming"));
            watched = Some(ticket);
        }
        Err(e) => {
            tracing::warn!("Cannot stream session: {}", e);
            let _ = tx.try_send(UpdateEvent::closed(&terminal_id, e.to_string()));
        }
    }

    let send_task = tokio::spawn(
        async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_sink.send(WsMessage::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!("Failed to encode update: {}", e),
                }
            }
        }
        .in_current_span(),
    );

    // Inbound messages carry no meaning here; read until the client goes away
    let mut owner_gone = false;
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = stream_ended(watched.as_ref()), if !owner_gone => {
                owner_gone = true;
                tracing::info!("Owning connection's stream ended");
                let _ = tx.try_send(UpdateEvent::closed(&terminal_id, "stream ended"));
            }
            msg = ws_stream.next() => match msg {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    if let Some(ticket) = owned {
        state.manager.unsubscribe_ticket(&ticket).await;
    }
    send_task.abort();
    tracing::debug!("Terminal socket closed");
}

/// Resolves when the watched delivery task ends; never without one
async fn stream_ended(ticket: Option<&StreamTicket>) {
    match ticket {
        Some(ticket) => ticket.ended().await,
        None => std::future::pending().await,
    }
}

async fn subscribe(
    state: &AppState,
    terminal_id: &str,
    listener: mpsc::Sender<UpdateEvent>,
) -> Result<Subscription, BackendError> {
    state.manager.ensure_connected().await?;
    state.manager.subscribe(terminal_id, listener).await
}

/// GET /ws/terminals - Session directory pushes
async fn terminals_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| {
        let span = tracing::info_span!("ws_directory", connection_id = %Uuid::new_v4());
        handle_directory_socket(socket, state).instrument(span)
    })
}

/// Push the list on connect, after every idle period and on any client message
async fn handle_directory_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    if send_directory(&state, &mut ws_sink).await.is_err() {
        return;
    }

    let mut deadline = Instant::now() + state.list_refresh;
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
            msg = ws_stream.next() => match msg {
                Some(Ok(WsMessage::Text(_))) | Some(Ok(WsMessage::Binary(_))) => {}
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                // Ping/pong frames don't count as client activity
                Some(Ok(_)) => continue,
            },
        }

        if send_directory(&state, &mut ws_sink).await.is_err() {
            break;
        }
        deadline = Instant::now() + state.list_refresh;
    }

    tracing::debug!("Directory socket closed");
}

async fn send_directory(
    state: &AppState,
    ws_sink: &mut SplitSink<WebSocket, WsMessage>,
) -> Result<(), axum::Error> {
    let listing = match state.manager.ensure_connected().await {
        Ok(()) => state.manager.list_sessions().await,
        Err(e) => Err(e),
    };

    let message = match listing {
        Ok(sessions) => DirectoryMessage::Terminals(sessions),
        Err(e) => {
            tracing::error!("Error getting terminals: {}", e);
            DirectoryMessage::Error { message: e.to_string() }
        }
    };

    let json = match serde_json::to_string(&message) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to encode terminal list: {}", e);
            return Ok(());
        }
    };
    ws_sink.send(WsMessage::Text(json)).await
}

/// Error handling
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Connectivity(_) => AppError::Unavailable("Terminal backend not connected".into()),
            BackendError::NotFound(_) => AppError::NotFound("Terminal not found".into()),
            BackendError::Rejected(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({
            "detail": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
