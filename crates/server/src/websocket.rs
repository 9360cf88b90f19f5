//! WebSocket streaming for `GET /sessions/{id}/ws`

use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use mdxai_protocol::WebSocketMessage;

use crate::routes::{valid_session_id, ApiError, AppState};
use crate::session_actor::SessionActorHandle;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection outbound queue depth
const SUBSCRIBER_BUFFER: usize = 100;

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(app): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    if !wants_websocket(&headers) {
        return Err(ApiError::bad_request("Expected Upgrade: websocket"));
    }
    if !valid_session_id(&session_id) {
        return Err(ApiError::bad_request("Invalid sessionId"));
    }
    let ws = ws.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;

    let actor = app.registry.get_or_activate(&session_id, None).await?;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, actor))
        .into_response())
}

fn wants_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, actor: SessionActorHandle) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        session_id = %actor.id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sink, mut outbound_rx) = mpsc::channel::<WebSocketMessage>(SUBSCRIBER_BUFFER);

    // Forward broadcaster messages to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!(
                        component = "websocket",
                        event = "ws.send.serialize_failed",
                        connection_id = conn_id,
                        error = %e,
                        "Failed to serialize stream message"
                    );
                    continue;
                }
            };

            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let subscriber_id = match actor.subscribe(sink).await {
        Ok(Some(id)) => id,
        Ok(None) | Err(_) => {
            warn!(
                component = "websocket",
                event = "ws.subscribe.failed",
                connection_id = conn_id,
                session_id = %actor.id,
                "Could not attach subscriber"
            );
            send_task.abort();
            return;
        }
    };

    // Clients have nothing to say; read only to notice close and errors.
    // The send task ends on its own once the actor drops this subscriber.
    loop {
        let result = tokio::select! {
            next = ws_rx.next() => match next {
                Some(result) => result,
                None => break,
            },
            _ = &mut send_task => {
                debug!(
                    component = "websocket",
                    event = "ws.stream.ended",
                    connection_id = conn_id,
                    "Session stream ended, closing connection"
                );
                break;
            }
        };
        match result {
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        }
    }

    actor.unsubscribe(subscriber_id).await;
    send_task.abort();
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        session_id = %actor.id,
        "WebSocket connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn upgrade_header_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        assert!(!wants_websocket(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(wants_websocket(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!wants_websocket(&headers));
    }
}
