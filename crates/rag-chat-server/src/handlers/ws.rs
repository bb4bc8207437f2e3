use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::chat::{
    AckPayload, ChatMessagePayload, ClientFrame, ConnectionId, ServerFrame, SessionId,
};
use crate::services::{ConversationLog, Orchestrator, SessionStore};

pub const SESSION_COOKIE: &str = "sessionId";

/// Real-time channel endpoint. One upgrade per browser tab; the
/// session is resolved from the `sessionId` cookie on the request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Extension(sessions): Extension<Arc<SessionStore>>,
    Extension(log): Extension<Arc<ConversationLog>>,
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
) -> impl IntoResponse {
    let presented = session_cookie(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, presented, sessions, log, orchestrator))
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

async fn handle_socket(
    socket: WebSocket,
    presented: Option<String>,
    sessions: Arc<SessionStore>,
    log: Arc<ConversationLog>,
    orchestrator: Arc<Orchestrator>,
) {
    let (session_id, recognized) = sessions.get_or_create(presented.as_deref());
    let connection_id: ConnectionId = Uuid::new_v4().to_string();

    info!(session = %session_id, connection = %connection_id, "User connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    if !recognized {
        let _ = tx.send(ServerFrame::SetCookie {
            name: SESSION_COOKIE.to_string(),
            value: session_id.clone(),
        });
    } else {
        replay_history(&session_id, &tx, &sessions, &log).await;
    }

    sessions.attach(&session_id, connection_id.clone(), tx.clone());

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer half: drains the queue shared with the session store.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader half. Generation is awaited inline, so frames from one
    // tab are handled in arrival order; a concurrent tab gets the
    // Busy rejection from the admission guard instead of queueing.
    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(connection = %connection_id, "Socket error: {}", e);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                handle_client_frame(
                    text.as_str(),
                    &session_id,
                    &connection_id,
                    &tx,
                    &orchestrator,
                )
                .await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    let evicted = sessions.detach(&session_id, &connection_id);
    writer.abort();
    info!(
        session = %session_id,
        connection = %connection_id,
        evicted,
        "User disconnected"
    );
}

async fn handle_client_frame(
    raw: &str,
    session_id: &SessionId,
    connection_id: &ConnectionId,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    orchestrator: &Orchestrator,
) {
    let frame: ClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(session = %session_id, "Unparseable client frame: {}", e);
            return;
        }
    };

    if frame.event != "chat_message" {
        debug!(session = %session_id, "Ignoring unknown event '{}'", frame.event);
        return;
    }

    let ack_id = frame.ack_id;
    let payload: ChatMessagePayload = match serde_json::from_value(frame.data) {
        Ok(payload) => payload,
        Err(_) => {
            let _ = tx.send(ServerFrame::Ack(AckPayload::rejected(
                ack_id,
                "Invalid message",
            )));
            return;
        }
    };

    let ack = match orchestrator
        .handle_message(session_id, connection_id, &payload.user_message)
        .await
    {
        Ok(sanitized) => AckPayload::accepted(ack_id, sanitized),
        Err(e) => AckPayload::rejected(ack_id, e.to_string()),
    };

    let _ = tx.send(ServerFrame::Ack(ack));
}

/// Replay persisted history into a freshly connected client and pull
/// the memory snapshot back into the live session. Corrupted history
/// leaves the session usable going forward.
async fn replay_history(
    session_id: &SessionId,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    sessions: &SessionStore,
    log: &ConversationLog,
) {
    match log.load_turns(session_id).await {
        Ok(turns) => {
            debug!(session = %session_id, turns = turns.len(), "Replaying conversation");
            let _ = tx.send(ServerFrame::LoadChat(turns));
        }
        Err(e) => {
            warn!(session = %session_id, "Failed to replay conversation: {}", e);
            let _ = tx.send(ServerFrame::LoadChat(Vec::new()));
        }
    }

    if let Err(e) = sessions.recover(session_id).await {
        warn!(session = %session_id, "Failed to recover session memory: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;

    #[test]
    fn test_session_cookie_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            "theme=dark; sessionId=2026-08-06-10-00_abc; lang=en"
                .parse()
                .unwrap(),
        );
        assert_eq!(
            session_cookie(&headers).as_deref(),
            Some("2026-08-06-10-00_abc")
        );
    }

    #[test]
    fn test_session_cookie_absent() {
        let headers = HeaderMap::new();
        assert!(session_cookie(&headers).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "theme=dark".parse().unwrap());
        assert!(session_cookie(&headers).is_none());
    }
}
