//! WebSocket transport
//!
//! Full-duplex JSON-RPC text frames with the same session semantics as
//! Streamable HTTP, plus native server-initiated notifications. Requests on
//! one socket are handled sequentially, preserving per-session response
//! ordering; notifications from the gateway interleave freely.

use axum::Extension;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use mcpgate_core::UserContext;
use mcpgate_protocol::{JsonRpcNotification, JsonRpcRequest};

use crate::handler::{RequestScope, SessionTransport};
use crate::http::HttpTransportState;

/// `GET /ws`: upgrade and serve JSON-RPC frames.
pub async fn ws_handler(
    State(state): State<HttpTransportState>,
    Extension(user): Extension<UserContext>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| ws_session(state, user, headers, socket))
}

async fn ws_session(
    state: HttpTransportState,
    user: UserContext,
    headers: HeaderMap,
    socket: WebSocket,
) {
    let session_id = Uuid::new_v4().to_string();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<String>(64);

    if let Err(e) = state
        .registry
        .register(
            &session_id,
            SessionTransport::WebSocket,
            user.clone(),
            headers.clone(),
            Some(outbound_tx),
        )
        .await
    {
        warn!(session_id = %session_id, error = %e, "websocket session registration failed");
        return;
    }
    debug!(session_id = %session_id, "websocket session opened");

    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let _ = state.registry.touch(&session_id).await;
                        if let Some(reply) = dispatch_frame(
                            &state,
                            &session_id,
                            &user,
                            &headers,
                            text.as_str(),
                        )
                        .await
                            && sink.send(Message::Text(reply.into())).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "websocket read failed");
                        break;
                    }
                }
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Disconnect cancels the session's in-flight runs.
    state.handler.on_disconnect(&session_id).await;
    if let Err(e) = state.registry.unregister(&session_id).await {
        warn!(session_id = %session_id, error = %e, "websocket teardown failed");
    }
    debug!(session_id = %session_id, "websocket session closed");
}

async fn dispatch_frame(
    state: &HttpTransportState,
    session_id: &str,
    user: &UserContext,
    headers: &HeaderMap,
    text: &str,
) -> Option<String> {
    let scope = RequestScope {
        session_id: session_id.to_string(),
        transport: SessionTransport::WebSocket,
        user: user.clone(),
        headers: headers.clone(),
    };

    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(session_id, error = %e, "unparseable websocket frame");
            return None;
        }
    };

    if value.get("id").is_some() {
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                warn!(session_id, error = %e, "malformed websocket request");
                return None;
            }
        };
        let response = state.handler.handle(request, scope).await;
        serde_json::to_string(&response).ok()
    } else {
        if let Ok(note) = serde_json::from_value::<JsonRpcNotification>(value) {
            state.handler.handle_notification(note, scope).await;
        }
        None
    }
}
