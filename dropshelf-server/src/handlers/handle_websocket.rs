use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use dropshelf_core::{ClientMessage, DisconnectReason, PushChannel, ShareError};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::handlers::auth::session_cookie;
use crate::infra::app_state::AppState;

/// Close code sent to clients without a valid session.
pub const CLOSE_UNAUTHORIZED: u16 = 4000;
/// Close code a client sends when the user logs out.
pub const CLOSE_LOGOUT: u16 = 4001;

const OUTBOUND_CAPACITY: usize = 100;

/// Handle WebSocket upgrade request
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let token = session_cookie(&headers);
    ws.on_upgrade(move |socket| async move {
        match token {
            Some(token) => handle_socket(socket, state, token).await,
            None => reject(socket).await,
        }
    })
}

async fn reject(mut socket: WebSocket) {
    debug!("websocket rejected: no session cookie");
    let frame = CloseFrame {
        code: CLOSE_UNAUTHORIZED,
        reason: "invalid session".into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Handle an individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState, token: String) {
    let (channel, mut rx) = PushChannel::pair(OUTBOUND_CAPACITY);
    let channel_id = channel.id();

    if let Err(err) = state.hub.connect(&token, channel).await {
        debug!(error = %err, "websocket rejected");
        reject(socket).await;
        return;
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(err) => {
                    error!(error = %err, "failed to encode server message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut reason = DisconnectReason::Transient;
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if !dispatch(&state, &token, serde_json::from_str(text.as_str())).await {
                    break;
                }
            }
            Ok(Message::Binary(bin)) => {
                if !dispatch(&state, &token, serde_json::from_slice(bin.as_ref())).await {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                if frame.is_some_and(|frame| frame.code == CLOSE_LOGOUT) {
                    reason = DisconnectReason::Logout;
                }
                break;
            }
            Err(err) => {
                debug!(error = %err, "websocket error");
                break;
            }
            _ => {}
        }
    }

    writer.abort();
    if let Err(err) = state.hub.disconnect(&token, channel_id, reason).await {
        warn!(error = %err, "failed to release session");
    }
}

/// Returns `false` once the session's login is gone and the socket should
/// close.
async fn dispatch(
    state: &AppState,
    token: &str,
    parsed: Result<ClientMessage, serde_json::Error>,
) -> bool {
    let message = match parsed {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "ignoring malformed client message");
            return true;
        }
    };

    let kind = message_kind(&message);
    match state.hub.handle(token, message).await {
        Ok(()) => true,
        Err(ShareError::Unauthorized) => {
            info!(message = kind, "session revoked; closing websocket");
            false
        }
        Err(err) => {
            info!(message = kind, error = %err, "client request failed");
            true
        }
    }
}

fn message_kind(message: &ClientMessage) -> &'static str {
    match message {
        ClientMessage::RequestUpdate(_) => "REQUEST_UPDATE",
        ClientMessage::SwitchFolder(_) => "SWITCH_FOLDER",
        ClientMessage::RequestShortlink(_) => "REQUEST_SHORTLINK",
        ClientMessage::RequestZip(_) => "REQUEST_ZIP",
        ClientMessage::DeleteFile(_) => "DELETE_FILE",
        ClientMessage::CreateFolder(_) => "CREATE_FOLDER",
        ClientMessage::Rename { .. } => "RENAME",
        ClientMessage::GetUsers => "GET_USERS",
        ClientMessage::UpdateUser { .. } => "UPDATE_USER",
        ClientMessage::GetMime(_) => "GET_MIME",
        ClientMessage::ZeroFiles(_) => "ZERO_FILES",
    }
}
