//! SSE transport
//!
//! `GET /sse` opens the stream and makes the accepting worker the session
//! owner; the first event names the `POST /message` endpoint carrying the
//! session id. Client messages POSTed to any worker are published on the
//! session's Pub/Sub channel; the owner executes them and writes responses
//! over its stream. The Pub/Sub hop is taken even when the POST lands on the
//! owner itself, keeping one observable code path.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Extension;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::Stream;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use mcpgate_core::UserContext;
use mcpgate_protocol::JsonRpcRequest;

use crate::handler::{RequestScope, RpcHandler, SessionTransport};
use crate::http::{HttpTransportState, error_response};
use crate::session::SessionRegistry;

/// Query parameters of `POST /message`.
#[derive(Debug, Deserialize)]
pub struct MessageParams {
    /// Target SSE session
    pub session_id: String,
}

/// `GET /sse`: open the stream and become the session owner.
pub async fn sse_handler(
    State(state): State<HttpTransportState>,
    Extension(user): Extension<UserContext>,
    headers: HeaderMap,
) -> Response {
    let session_id = Uuid::new_v4().to_string();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<String>(64);

    if let Err(err) = state
        .registry
        .register(
            &session_id,
            SessionTransport::Sse,
            user.clone(),
            headers.clone(),
            Some(outbound_tx),
        )
        .await
    {
        return error_response(&err);
    }

    let inbound = match state.registry.subscribe_session(&session_id).await {
        Ok(sub) => sub,
        Err(err) => {
            let _ = state.registry.unregister(&session_id).await;
            return error_response(&err);
        }
    };

    let dispatch = spawn_dispatch_loop(
        Arc::clone(&state.registry),
        Arc::clone(&state.handler),
        session_id.clone(),
        user,
        headers,
        inbound,
    );

    let guard = SessionGuard {
        registry: Arc::clone(&state.registry),
        handler: Arc::clone(&state.handler),
        session_id: session_id.clone(),
        dispatch,
    };

    debug!(session_id = %session_id, "SSE stream opened");
    let stream = sse_stream(session_id, guard, outbound_rx);
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.keepalive).text("keep-alive"))
        .into_response()
}

fn sse_stream(
    session_id: String,
    guard: SessionGuard,
    mut outbound_rx: tokio::sync::mpsc::Receiver<String>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        // Guard lives inside the stream; dropping the response body tears
        // the session down.
        let _guard = guard;

        // Initial event carries the session id to POST against.
        yield Ok(Event::default()
            .event("endpoint")
            .data(format!("/message?session_id={session_id}")));

        while let Some(frame) = outbound_rx.recv().await {
            yield Ok(Event::default().event("message").data(frame));
        }
    }
}

fn spawn_dispatch_loop(
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn RpcHandler>,
    session_id: String,
    user: UserContext,
    headers: HeaderMap,
    mut inbound: tokio::sync::mpsc::Receiver<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(raw) = inbound.recv().await {
            let _ = registry.touch(&session_id).await;
            let request: JsonRpcRequest = match serde_json::from_str(&raw) {
                Ok(request) => request,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "unparseable SSE message");
                    continue;
                }
            };
            let scope = RequestScope {
                session_id: session_id.clone(),
                transport: SessionTransport::Sse,
                user: user.clone(),
                headers: headers.clone(),
            };
            // Sequential dispatch preserves per-session response ordering.
            let response = handler.handle(request, scope).await;
            match serde_json::to_string(&response) {
                Ok(frame) => {
                    if !registry.deliver_local(&session_id, frame).await {
                        break;
                    }
                }
                Err(e) => warn!(session_id = %session_id, error = %e, "response serialization"),
            }
        }
    })
}

/// Tears the session down when the SSE body is dropped.
struct SessionGuard {
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn RpcHandler>,
    session_id: String,
    dispatch: tokio::task::JoinHandle<()>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.dispatch.abort();
        let registry = Arc::clone(&self.registry);
        let handler = Arc::clone(&self.handler);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            // Client disconnect cancels the session's in-flight runs.
            handler.on_disconnect(&session_id).await;
            if let Err(e) = registry.unregister(&session_id).await {
                warn!(session_id = %session_id, error = %e, "SSE session teardown failed");
            }
            debug!(session_id = %session_id, "SSE session closed");
        });
    }
}

/// `POST /message?session_id=…`: deliver a client message to the owner.
pub async fn message_handler(
    State(state): State<HttpTransportState>,
    Query(params): Query<MessageParams>,
    body: String,
) -> Response {
    match state.registry.lookup(&params.session_id).await {
        Ok(Some(_owner)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                axum::Json(serde_json::json!({"error": "unknown or expired session"})),
            )
                .into_response();
        }
        Err(err) => return error_response(&err),
    }

    if let Err(err) = state
        .registry
        .publish_to_owner(&params.session_id, &body)
        .await
    {
        return error_response(&err);
    }

    (
        StatusCode::ACCEPTED,
        axum::Json(serde_json::json!({"status": "accepted"})),
    )
        .into_response()
}
