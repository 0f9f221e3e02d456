//! Stdio transport
//!
//! Newline-delimited JSON-RPC 2.0 over stdin/stdout, the standard framing
//! for subprocess MCP servers. One stream, one logical session, no
//! multiplexing. Logging goes to stderr via `tracing`, never stdout.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use http::header::HeaderMap;
use serde_json::Value;
use tokio::io::BufReader;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};
use uuid::Uuid;

use mcpgate_core::{GatewayError, GatewayResult, UserContext};
use mcpgate_protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

use crate::handler::{RequestScope, RpcHandler, SessionTransport};
use crate::session::SessionRegistry;

/// Serve the gateway over stdin/stdout until EOF.
///
/// The stdio client is a local process with no HTTP credential; it runs
/// under the anonymous identity. Requests are handled strictly in arrival
/// order.
pub async fn serve_stdio(
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn RpcHandler>,
) -> GatewayResult<()> {
    let session_id = Uuid::new_v4().to_string();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<String>(64);
    registry
        .register(
            &session_id,
            SessionTransport::Stdio,
            UserContext::anonymous(),
            HeaderMap::new(),
            Some(outbound_tx.clone()),
        )
        .await?;

    let mut reader = FramedRead::new(BufReader::new(tokio::io::stdin()), LinesCodec::new());
    let mut writer = FramedWrite::new(tokio::io::stdout(), LinesCodec::new());

    debug!(session_id, "stdio transport serving");

    loop {
        tokio::select! {
            line = reader.next() => {
                let Some(line) = line else { break };
                let line = line.map_err(|e| GatewayError::internal(format!("stdio read: {e}")))?;
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(frame) =
                    dispatch_line(&registry, &handler, &session_id, &line).await
                {
                    write_frame(&mut writer, &frame).await?;
                }
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                write_frame(&mut writer, &frame).await?;
            }
        }
    }

    handler.on_disconnect(&session_id).await;
    registry.unregister(&session_id).await?;
    debug!(session_id, "stdio transport closed");
    Ok(())
}

async fn dispatch_line(
    registry: &Arc<SessionRegistry>,
    handler: &Arc<dyn RpcHandler>,
    session_id: &str,
    line: &str,
) -> Option<String> {
    let scope = RequestScope {
        session_id: session_id.to_string(),
        transport: SessionTransport::Stdio,
        user: UserContext::anonymous(),
        headers: HeaderMap::new(),
    };
    let _ = registry.touch(session_id).await;

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "unparseable stdio frame");
            let response = JsonRpcResponse {
                jsonrpc: mcpgate_protocol::JsonRpcVersion,
                payload: mcpgate_protocol::JsonRpcResponsePayload::Error {
                    error: mcpgate_protocol::JsonRpcError::new(-32700, "Parse error"),
                },
                id: mcpgate_protocol::ResponseId::null(),
            };
            return serde_json::to_string(&response).ok();
        }
    };

    if value.get("id").is_some() {
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "malformed stdio request");
                return None;
            }
        };
        let response = handler.handle(request, scope).await;
        serde_json::to_string(&response).ok()
    } else {
        match serde_json::from_value::<JsonRpcNotification>(value) {
            Ok(note) => handler.handle_notification(note, scope).await,
            Err(e) => warn!(error = %e, "malformed stdio notification"),
        }
        None
    }
}

async fn write_frame(
    writer: &mut FramedWrite<tokio::io::Stdout, LinesCodec>,
    frame: &str,
) -> GatewayResult<()> {
    // Per the MCP stdio framing rules, messages must not contain embedded
    // newlines.
    if frame.contains('\n') || frame.contains('\r') {
        return Err(GatewayError::internal(
            "refusing to write frame with embedded newline",
        ));
    }
    writer
        .send(frame.to_string())
        .await
        .map_err(|e| GatewayError::internal(format!("stdio write: {e}")))
}
