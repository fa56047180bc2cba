//! services/api/src/web/ws_handler.rs
//!
//! The connection gateway: authenticates each WebSocket handshake, registers
//! presence, pumps the bidirectional message flow and runs disconnect
//! recovery on teardown.

use crate::web::{
    game,
    protocol::{ClientMessage, ServerMessage},
    state::{AppState, ClientSender},
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use classdare_core::domain::Identity;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// The handshake query string. Clients connect with
/// `/ws?token=Bearer%20<jwt>` (the `Bearer ` prefix is optional).
#[derive(Deserialize)]
pub struct WsAuthQuery {
    token: Option<String>,
}

/// The handler for upgrading HTTP requests to WebSocket connections.
///
/// This is a hard authentication boundary: a missing or invalid credential
/// refuses the upgrade outright, with no handlers attached.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsAuthQuery>,
    State(app): State<AppState>,
) -> Response {
    let raw = match query.token.as_deref() {
        Some(t) => t.strip_prefix("Bearer ").unwrap_or(t),
        None => {
            warn!("WebSocket handshake without a token refused");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };
    match app.verifier.verify(raw) {
        Ok(identity) => ws.on_upgrade(move |socket| handle_socket(socket, app, identity)),
        Err(e) => {
            warn!("WebSocket handshake with an invalid token refused: {e}");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, app: AppState, who: Identity) {
    let conn_id = Uuid::new_v4();
    info!(user = %who.user_id, %conn_id, "WebSocket connection established");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    // Latest connection wins: a reconnect displaces any stale mapping.
    app.presence.register(who.user_id, conn_id, tx.clone()).await;

    // Writer task: drains the outbound queue into the socket.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!("failed to serialize server message: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // The room this connection is in, for disconnect recovery.
    let mut joined_session: Option<Uuid> = None;

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    dispatch(&app, who, client_msg, &tx, &mut joined_session).await;
                }
                Err(e) => {
                    warn!(user = %who.user_id, "failed to deserialize client message: {e}");
                    let _ = tx.send(ServerMessage::Error {
                        message: "malformed message".to_string(),
                    });
                }
            },
            Message::Close(_) => {
                info!(user = %who.user_id, "client sent close message");
                break;
            }
            _ => {}
        }
    }

    // Teardown. Presence is removed only if this connection is still the
    // registered one, so a reconnect that raced us is never knocked offline.
    writer.abort();
    let was_current = app.presence.unregister(who.user_id, conn_id).await;
    if was_current {
        if let Some(session_id) = joined_session {
            game::handle_disconnect(&app, who, session_id).await;
        }
    }
    info!(user = %who.user_id, %conn_id, "WebSocket connection closed");
}

/// Routes one client message to the orchestrator and reports the outcome
/// back on this connection. Gameplay failures never tear the socket down.
async fn dispatch(
    app: &AppState,
    who: Identity,
    msg: ClientMessage,
    tx: &ClientSender,
    joined_session: &mut Option<Uuid>,
) {
    let result = match msg {
        ClientMessage::CreateSession { category_id, title } => {
            game::create_session(app, who, category_id, title)
                .await
                .map(|session| {
                    *joined_session = Some(session.id);
                    Some(ServerMessage::SessionCreated {
                        session_id: session.id,
                    })
                })
        }
        ClientMessage::JoinRoom { session_id } => {
            game::join_room(app, who, session_id).await.map(|()| {
                *joined_session = Some(session_id);
                None
            })
        }
        ClientMessage::StartSession { session_id } => {
            game::start_session(app, who, session_id).await.map(|()| None)
        }
        ClientMessage::SelectPlayer { session_id } => {
            game::select_player(app, who, session_id).await.map(|_| None)
        }
        ClientMessage::DrawPrompt {
            session_id,
            card_type,
        } => game::draw_prompt(app, who, session_id, card_type.into())
            .await
            .map(|()| None),
        ClientMessage::SubmitAnswer { session_id, text } => {
            game::submit_answer(app, who, session_id, text)
                .await
                .map(|()| None)
        }
        ClientMessage::SubmitGrade {
            session_id,
            score,
            feedback,
        } => game::submit_grade(app, who, session_id, score, feedback)
            .await
            .map(|()| None),
        ClientMessage::EndSession { session_id } => {
            game::end_session(app, who, session_id).await.map(|()| None)
        }
    };

    match result {
        Ok(Some(reply)) => {
            let _ = tx.send(reply);
        }
        Ok(None) => {}
        Err(e) => {
            let _ = tx.send(ServerMessage::Error {
                message: e.to_string(),
            });
        }
    }
}
