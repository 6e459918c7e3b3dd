pub mod events;
pub mod heartbeat;
pub mod hub;
pub mod session;
pub mod topics;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::SinkExt;
use tracing::info;

use crate::error::HubError;
use crate::middleware::auth::AuthUser;
use crate::state::AppState;
use events::{close_code, ServerFrame};

pub use hub::{Hub, HubHandle};

/// `GET /ws`. The credential is checked by the `AuthUser` extractor before
/// the upgrade, so only authenticated users ever reach the hub.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    user: AuthUser,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: AuthUser) {
    match state.hub.admit(&user.user_id).await {
        Ok(admission) => session::serve(socket, state.hub.clone(), admission).await,
        Err(e) => reject(socket, &user.user_id, e).await,
    }
}

/// Tell the client why it was turned away, then close.
async fn reject(mut socket: WebSocket, user_id: &str, err: HubError) {
    info!(user_id, reason = %err, "admission rejected");
    let code = match err {
        HubError::LimitExceeded(_) => close_code::LIMIT_EXCEEDED,
        _ => close_code::GOING_AWAY,
    };
    let reason = err.to_string();
    let frame = ServerFrame::Error { reason: &reason }.to_json();

    if socket.send(Message::Text(frame.into())).await.is_ok() {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    }
    let _ = socket.close().await;
}
