//! WebSocket handlers
//!
//! Three upgrade points: the agent terminal of one session, the shell
//! terminal of one session, and the hub-wide lifecycle event stream.
//! Each socket gets a forwarding task that drains its gateway queue; the
//! read half routes client frames into the orchestrator.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use berth_core::types::SessionId;

use super::events::{ChannelKind, ClientFrame, ServerFrame, SessionSnapshot};
use crate::state::HubState;

/// Build the realtime router
pub fn router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/ws/events", get(events_handler))
        .route("/ws/sessions/:id", get(agent_handler))
        .route("/ws/sessions/:id/shell", get(shell_handler))
        .with_state(state)
}

async fn agent_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal(socket, state, SessionId::from(id), ChannelKind::AgentTerminal))
}

async fn shell_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal(socket, state, SessionId::from(id), ChannelKind::ShellTerminal))
}

async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events(socket, state))
}

/// One terminal viewer (agent or shell channel)
async fn handle_terminal(
    socket: WebSocket,
    state: Arc<HubState>,
    session_id: SessionId,
    kind: ChannelKind,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Unknown session: one error frame, then close.
    let session = match state.repo.get_session(&session_id).await {
        Ok(Some(session)) => session,
        _ => {
            let frame = ServerFrame::Error {
                message: format!("session not found: {}", session_id),
            };
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = ws_tx.send(Message::Text(json)).await;
            }
            return;
        }
    };

    // Snapshot-first ordering: the attach enqueues these ahead of any
    // live output. The shell channel replays its scrollback instead.
    let initial = match kind {
        ChannelKind::AgentTerminal => vec![ServerFrame::SessionStatus {
            session: SessionSnapshot::from(&session),
        }],
        ChannelKind::ShellTerminal => {
            let scrollback = state.shells.read_scrollback(&session_id).await;
            if scrollback.is_empty() {
                vec![]
            } else {
                vec![ServerFrame::output(&scrollback)]
            }
        }
    };

    let (client_id, mut frames) = state.gateway.attach(session_id.clone(), kind, initial);
    tracing::info!("Viewer {} attached to {:?} of {}", client_id, kind, session_id);

    // Request-level errors from the read half travel through their own
    // queue so the single writer task owns the socket sink.
    let (error_tx, mut error_rx) = mpsc::channel::<ServerFrame>(16);

    let send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = frames.recv() => frame,
                frame = error_rx.recv() => frame,
            };
            let Some(frame) = frame else { break };
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("Frame serialization failed: {}", e),
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = error_tx
                    .send(ServerFrame::Error {
                        message: format!("bad frame: {}", e),
                    })
                    .await;
                continue;
            }
        };

        let result = match (kind, frame) {
            (ChannelKind::AgentTerminal, ClientFrame::Input { data }) => {
                state.orchestrator.send_input(&session_id, &data).await
            }
            (ChannelKind::AgentTerminal, ClientFrame::Resize { cols, rows }) => {
                state.orchestrator.resize_session(&session_id, cols, rows).await
            }
            (ChannelKind::AgentTerminal, ClientFrame::Kill) => {
                state.orchestrator.kill_session(&session_id).await
            }
            (ChannelKind::ShellTerminal, ClientFrame::Input { data }) => {
                state.shells.shell_input(&session_id, &data).await
            }
            (ChannelKind::ShellTerminal, ClientFrame::Resize { cols, rows }) => {
                state.shells.shell_resize(&session_id, cols, rows).await
            }
            (ChannelKind::ShellTerminal, ClientFrame::Kill) => {
                state.shells.close_shell(&session_id).await
            }
        };

        if let Err(e) = result {
            let _ = error_tx
                .send(ServerFrame::Error {
                    message: e.to_string(),
                })
                .await;
        }
    }

    state.gateway.detach(&session_id, kind, client_id);
    send_task.abort();
    tracing::info!("Viewer {} left {:?} of {}", client_id, kind, session_id);
}

/// Hub-wide lifecycle event stream
async fn handle_events(socket: WebSocket, state: Arc<HubState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = state.gateway.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&event) else { continue };
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Events viewer lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
