//! Streamable HTTP transport
//!
//! Single-POST request/response. The `mcp-session-id` header, assigned
//! during `initialize`, groups requests into a logical session; any worker
//! may answer any request. When session affinity pins the session's upstream
//! state to another worker, the request is forwarded over the cache instead
//! of answered locally.

use axum::Extension;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use mcpgate_core::UserContext;
use mcpgate_protocol::{JsonRpcNotification, JsonRpcRequest, methods};

use crate::handler::{RequestScope, SessionTransport};
use crate::http::{HttpTransportState, error_response};

/// Session id header name.
pub const MCP_SESSION_ID: &str = "mcp-session-id";

/// `POST /mcp`: one JSON-RPC request or notification per call.
pub async fn mcp_handler(
    State(state): State<HttpTransportState>,
    Extension(user): Extension<UserContext>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({"error": format!("malformed JSON-RPC body: {e}")})),
            )
                .into_response();
        }
    };
    let session_header = headers
        .get(MCP_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Notifications get a 202 with no body.
    if value.get("id").is_none() {
        if let Ok(note) = serde_json::from_value::<JsonRpcNotification>(value) {
            let scope = scope_for(
                session_header.clone().unwrap_or_default(),
                user,
                headers.clone(),
            );
            state.handler.handle_notification(note, scope).await;
        }
        return StatusCode::ACCEPTED.into_response();
    }

    let request: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({"error": format!("malformed request: {e}")})),
            )
                .into_response();
        }
    };

    // `initialize` mints the logical session.
    if request.method == methods::INITIALIZE {
        let session_id = Uuid::new_v4().to_string();
        if let Err(err) = state
            .registry
            .register(
                &session_id,
                SessionTransport::StreamableHttp,
                user.clone(),
                headers.clone(),
                None,
            )
            .await
        {
            return error_response(&err);
        }
        let scope = scope_for(session_id.clone(), user, headers);
        let response = state.handler.handle(request, scope).await;
        debug!(session_id = %session_id, "streamable session initialized");
        return (
            StatusCode::OK,
            [(MCP_SESSION_ID, session_id)],
            axum::Json(response),
        )
            .into_response();
    }

    let Some(session_id) = session_header else {
        // Sessionless one-shot; answered locally under an ephemeral id.
        let scope = scope_for(Uuid::new_v4().to_string(), user, headers);
        let response = state.handler.handle(request, scope).await;
        return axum::Json(response).into_response();
    };

    if state.registry.owns(&session_id) {
        let _ = state.registry.touch(&session_id).await;
        let scope = scope_for(session_id, user, headers);
        let response = state.handler.handle(request, scope).await;
        return axum::Json(response).into_response();
    }

    // Not ours: forward to the owner when affinity demands it.
    match state.registry.lookup(&session_id).await {
        Ok(Some(owner)) if state.affinity_enabled => {
            debug!(session_id = %session_id, owner = %owner, "forwarding streamable request");
            match state.forward.forward(&owner, &session_id, &request).await {
                Ok(response) => axum::Json(response).into_response(),
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "forwarded request failed");
                    error_response(&err)
                }
            }
        }
        Ok(_) => {
            // Unknown or expired session, or affinity disabled: any worker
            // may answer.
            let scope = scope_for(session_id, user, headers);
            let response = state.handler.handle(request, scope).await;
            axum::Json(response).into_response()
        }
        Err(err) => error_response(&err),
    }
}

fn scope_for(session_id: String, user: UserContext, headers: HeaderMap) -> RequestScope {
    RequestScope {
        session_id,
        transport: SessionTransport::StreamableHttp,
        user,
        headers,
    }
}
