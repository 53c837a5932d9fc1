use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::SinkExt;
use serde::Deserialize;

use crate::auth::jwt;
use crate::state::AppState;
use crate::ws::actor;

/// Optional query parameters for the WebSocket handshake.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// WebSocket close codes:
/// 4001 = token expired
/// 4002 = token invalid or missing
const CLOSE_TOKEN_EXPIRED: u16 = 4001;
const CLOSE_TOKEN_INVALID: u16 = 4002;

/// Extract the bearer credential, checked in precedence order:
/// `?token=` query parameter, `Authorization: Bearer` header, `token=` cookie.
fn extract_token(params: &WsAuthQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = &params.token {
        return Some(token.clone());
    }

    if let Some(token) = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }

    headers
        .get("Cookie")
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split("; ")
                .find_map(|cookie| cookie.strip_prefix("token="))
        })
        .map(str::to_string)
}

/// GET /ws/chat
/// WebSocket upgrade endpoint. On auth failure, upgrades then immediately
/// closes with the appropriate close code — no connection object is ever
/// created and the session never reaches the open state.
/// On success, spawns the connection actor.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = extract_token(&params, &headers) else {
        tracing::warn!("WebSocket handshake without credential");
        return ws.on_upgrade(|socket| reject(socket, CLOSE_TOKEN_INVALID, "Missing token"));
    };

    match jwt::validate_token(&state.jwt_secret, &token) {
        Ok(claims) => {
            tracing::info!(
                user_id = claims.sub,
                username = %claims.username,
                "WebSocket handshake authenticated"
            );
            ws.on_upgrade(move |socket| {
                actor::run_connection(socket, state, claims.sub, claims.username)
            })
        }
        Err(err) => {
            let (close_code, reason) = match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    (CLOSE_TOKEN_EXPIRED, "Token expired")
                }
                _ => (CLOSE_TOKEN_INVALID, "Token invalid"),
            };

            tracing::warn!(close_code, reason, "WebSocket handshake rejected");
            ws.on_upgrade(move |socket| reject(socket, close_code, reason))
        }
    }
}

/// Complete the upgrade, then close immediately with the given code.
async fn reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
