//! Upstream MCP client sessions
//!
//! One `UpstreamSession` is one live MCP session against one upstream server,
//! speaking Streamable HTTP, SSE, or child-process stdio. Sessions perform
//! the MCP `initialize` handshake on connect and are owned exclusively by the
//! pool; no handle escapes it.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::StreamExt;
use http::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex as TokioMutex, oneshot};
use tracing::{debug, trace, warn};

use mcpgate_core::dao::TransportKind;
use mcpgate_core::{GatewayError, GatewayResult};
use mcpgate_protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, methods};

/// Parameters for connecting an upstream session.
#[derive(Debug, Clone)]
pub struct UpstreamConnectConfig {
    /// Upstream URL, or the command line for stdio upstreams
    pub url: String,
    /// Transport the upstream speaks
    pub transport: TransportKind,
    /// Sticky headers for the session's life; already scrubbed
    pub headers: HeaderMap,
    /// Connect/read/write bound
    pub timeout: Duration,
}

type PendingMap = Arc<DashMap<String, oneshot::Sender<JsonRpcResponse>>>;

enum Inner {
    StreamableHttp {
        client: reqwest::Client,
        endpoint: String,
        headers: HeaderMap,
        mcp_session_id: Option<String>,
    },
    Sse {
        client: reqwest::Client,
        post_url: String,
        headers: HeaderMap,
        pending: PendingMap,
        reader: tokio::task::JoinHandle<()>,
    },
    Stdio {
        child: tokio::process::Child,
        stdin: TokioMutex<tokio::process::ChildStdin>,
        pending: PendingMap,
        reader: tokio::task::JoinHandle<()>,
    },
}

/// One pooled MCP session to one upstream server.
pub struct UpstreamSession {
    url: String,
    transport: TransportKind,
    timeout: Duration,
    inner: Inner,
    created_at: Instant,
    next_id: AtomicI64,
}

impl std::fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("url", &self.url)
            .field("transport", &self.transport.as_str())
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

impl UpstreamSession {
    /// Connect the transport and perform the MCP `initialize` handshake.
    pub async fn connect(config: UpstreamConnectConfig) -> GatewayResult<Self> {
        let mut session = match config.transport {
            TransportKind::StreamableHttp => Self::connect_streamable(&config)?,
            TransportKind::Sse => Self::connect_sse(&config).await?,
            TransportKind::Stdio => Self::connect_stdio(&config)?,
        };
        session.initialize().await?;
        Ok(session)
    }

    /// Upstream session id assigned during `initialize`, when the transport
    /// carries one.
    #[must_use]
    pub fn mcp_session_id(&self) -> Option<&str> {
        match &self.inner {
            Inner::StreamableHttp { mcp_session_id, .. } => mcp_session_id.as_deref(),
            _ => None,
        }
    }

    /// Age of the session since creation.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Upstream URL this session is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn connect_streamable(config: &UpstreamConnectConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::internal(format!("http client: {e}")))?;
        Ok(Self {
            url: config.url.clone(),
            transport: config.transport,
            timeout: config.timeout,
            inner: Inner::StreamableHttp {
                client,
                endpoint: config.url.clone(),
                headers: config.headers.clone(),
                mcp_session_id: None,
            },
            created_at: Instant::now(),
            next_id: AtomicI64::new(1),
        })
    }

    async fn connect_sse(config: &UpstreamConnectConfig) -> GatewayResult<Self> {
        // The SSE stream must outlive individual requests; only the connect
        // phase is bounded.
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::internal(format!("http client: {e}")))?;

        let response = client
            .get(&config.url)
            .headers(config.headers.clone())
            .header(http::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if !response.status().is_success() {
            return Err(GatewayError::upstream_with_status(
                format!("SSE connect to {} failed", config.url),
                response.status().as_u16(),
            ));
        }

        let mut events = SseEventStream::new(response.bytes_stream().boxed());

        // MCP SSE handshake: the first event names the POST endpoint.
        let endpoint_event = tokio::time::timeout(config.timeout, events.next_event())
            .await
            .map_err(|_| GatewayError::timeout("sse endpoint handshake", config.timeout.as_millis() as u64))?
            .ok_or_else(|| GatewayError::unavailable("SSE stream closed during handshake"))?;
        if endpoint_event.name != "endpoint" {
            return Err(GatewayError::upstream(format!(
                "expected endpoint event, got '{}'",
                endpoint_event.name
            )));
        }
        let post_url = resolve_endpoint(&config.url, endpoint_event.data.trim())?;

        let pending: PendingMap = Arc::new(DashMap::new());
        let reader_pending = Arc::clone(&pending);
        let url = config.url.clone();
        let reader = tokio::spawn(async move {
            while let Some(event) = events.next_event().await {
                if event.name != "message" {
                    trace!(event = %event.name, "ignoring non-message SSE event");
                    continue;
                }
                route_response(&reader_pending, &url, &event.data);
            }
            debug!(url = %url, "upstream SSE stream ended");
        });

        Ok(Self {
            url: config.url.clone(),
            transport: config.transport,
            timeout: config.timeout,
            inner: Inner::Sse {
                client,
                post_url,
                headers: config.headers.clone(),
                pending,
                reader,
            },
            created_at: Instant::now(),
            next_id: AtomicI64::new(1),
        })
    }

    fn connect_stdio(config: &UpstreamConnectConfig) -> GatewayResult<Self> {
        let mut parts = config.url.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| GatewayError::invalid_request("empty stdio command"))?;
        let mut child = tokio::process::Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::unavailable(format!("spawn '{program}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::internal("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::internal("child stdout unavailable"))?;

        let pending: PendingMap = Arc::new(DashMap::new());
        let reader_pending = Arc::clone(&pending);
        let url = config.url.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => route_response(&reader_pending, &url, &line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(url = %url, error = %e, "stdio upstream read failed");
                        break;
                    }
                }
            }
            debug!(url = %url, "stdio upstream closed");
        });

        Ok(Self {
            url: config.url.clone(),
            transport: config.transport,
            timeout: config.timeout,
            inner: Inner::Stdio {
                child,
                stdin: TokioMutex::new(stdin),
                pending,
                reader,
            },
            created_at: Instant::now(),
            next_id: AtomicI64::new(1),
        })
    }

    async fn initialize(&mut self) -> GatewayResult<()> {
        let params = json!({
            "protocolVersion": methods::PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "mcpgate",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let request = JsonRpcRequest::new(self.next_request_id(), methods::INITIALIZE, Some(params));

        match &mut self.inner {
            Inner::StreamableHttp {
                client,
                endpoint,
                headers,
                mcp_session_id,
            } => {
                let response = client
                    .post(endpoint.as_str())
                    .headers(headers.clone())
                    .header(http::header::ACCEPT, "application/json, text/event-stream")
                    .header("MCP-Protocol-Version", methods::PROTOCOL_VERSION)
                    .json(&request)
                    .send()
                    .await
                    .map_err(map_reqwest_error)?;
                if let Some(id) = response
                    .headers()
                    .get("mcp-session-id")
                    .and_then(|v| v.to_str().ok())
                {
                    *mcp_session_id = Some(id.to_string());
                }
                let rpc = decode_http_response(response, &request.id.as_key()).await?;
                rpc.into_result()
                    .map_err(|e| GatewayError::upstream(format!("initialize rejected: {e}")))?;
            }
            _ => {
                let id_key = request.id.as_key();
                let rx = self.register_pending(&id_key);
                self.send_raw(&serde_json::to_string(&request)?).await?;
                let response = self.await_response(rx, &id_key).await?;
                response
                    .into_result()
                    .map_err(|e| GatewayError::upstream(format!("initialize rejected: {e}")))?;
            }
        }

        self.notify(methods::NOTIFICATIONS_INITIALIZED, None).await?;
        debug!(url = %self.url, transport = self.transport.as_str(), "upstream session initialized");
        Ok(())
    }

    /// Invoke a method and await its result.
    pub async fn call(&self, method: &str, params: Option<Value>) -> GatewayResult<Value> {
        let request = JsonRpcRequest::new(self.next_request_id(), method, params);
        let id_key = request.id.as_key();

        let response = match &self.inner {
            Inner::StreamableHttp {
                client,
                endpoint,
                headers,
                mcp_session_id,
            } => {
                let mut builder = client
                    .post(endpoint.as_str())
                    .headers(headers.clone())
                    .header(http::header::ACCEPT, "application/json, text/event-stream")
                    .header("MCP-Protocol-Version", methods::PROTOCOL_VERSION)
                    .json(&request);
                if let Some(id) = mcp_session_id {
                    builder = builder.header("mcp-session-id", id);
                }
                let response = builder.send().await.map_err(map_reqwest_error)?;
                decode_http_response(response, &id_key).await?
            }
            Inner::Sse { .. } | Inner::Stdio { .. } => {
                let rx = self.register_pending(&id_key);
                self.send_raw(&serde_json::to_string(&request)?).await?;
                self.await_response(rx, &id_key).await?
            }
        };

        response.into_result().map_err(|e| {
            GatewayError::UpstreamError {
                message: format!("{method}: {}", e.message),
                status: None,
            }
        })
    }

    /// Send a notification; no response expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> GatewayResult<()> {
        let note = JsonRpcNotification::new(method, params);
        match &self.inner {
            Inner::StreamableHttp {
                client,
                endpoint,
                headers,
                mcp_session_id,
            } => {
                let mut builder = client
                    .post(endpoint.as_str())
                    .headers(headers.clone())
                    .header(http::header::ACCEPT, "application/json, text/event-stream")
                    .json(&note);
                if let Some(id) = mcp_session_id {
                    builder = builder.header("mcp-session-id", id);
                }
                builder.send().await.map_err(map_reqwest_error)?;
            }
            _ => {
                self.send_raw(&serde_json::to_string(&note)?).await?;
            }
        }
        Ok(())
    }

    /// Cheap health probe: a bounded `tools/list`.
    pub async fn probe(&self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.call(methods::TOOLS_LIST, Some(json!({})))).await,
            Ok(Ok(_))
        )
    }

    /// Tear the session down, aborting reader tasks and killing any child.
    pub fn close(mut self) {
        match &mut self.inner {
            Inner::StreamableHttp { .. } => {}
            Inner::Sse { reader, .. } => reader.abort(),
            Inner::Stdio { child, reader, .. } => {
                reader.abort();
                if let Err(e) = child.start_kill() {
                    trace!(url = %self.url, error = %e, "stdio child already gone");
                }
            }
        }
        debug!(url = %self.url, "upstream session closed");
    }

    fn next_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register_pending(&self, id_key: &str) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        match &self.inner {
            Inner::Sse { pending, .. } | Inner::Stdio { pending, .. } => {
                pending.insert(id_key.to_string(), tx);
            }
            Inner::StreamableHttp { .. } => unreachable!("streamable http has no pending map"),
        }
        rx
    }

    async fn send_raw(&self, line: &str) -> GatewayResult<()> {
        if line.contains('\n') || line.contains('\r') {
            return Err(GatewayError::invalid_request(
                "JSON-RPC messages must not contain embedded newlines",
            ));
        }
        match &self.inner {
            Inner::Sse {
                client,
                post_url,
                headers,
                ..
            } => {
                let response = client
                    .post(post_url.as_str())
                    .headers(headers.clone())
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(line.to_string())
                    .send()
                    .await
                    .map_err(map_reqwest_error)?;
                if !response.status().is_success() {
                    return Err(GatewayError::upstream_with_status(
                        "SSE message post rejected",
                        response.status().as_u16(),
                    ));
                }
                Ok(())
            }
            Inner::Stdio { stdin, .. } => {
                let mut stdin = stdin.lock().await;
                stdin
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| GatewayError::unavailable(format!("stdio write: {e}")))?;
                stdin
                    .write_all(b"\n")
                    .await
                    .map_err(|e| GatewayError::unavailable(format!("stdio write: {e}")))?;
                stdin
                    .flush()
                    .await
                    .map_err(|e| GatewayError::unavailable(format!("stdio flush: {e}")))?;
                Ok(())
            }
            Inner::StreamableHttp { .. } => unreachable!("streamable http sends typed requests"),
        }
    }

    async fn await_response(
        &self,
        rx: oneshot::Receiver<JsonRpcResponse>,
        id_key: &str,
    ) -> GatewayResult<JsonRpcResponse> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.forget_pending(id_key);
                Err(GatewayError::unavailable("upstream session dropped"))
            }
            Err(_) => {
                self.forget_pending(id_key);
                Err(GatewayError::timeout(
                    "upstream call",
                    self.timeout.as_millis() as u64,
                ))
            }
        }
    }

    fn forget_pending(&self, id_key: &str) {
        if let Inner::Sse { pending, .. } | Inner::Stdio { pending, .. } = &self.inner {
            pending.remove(id_key);
        }
    }
}

fn route_response(pending: &PendingMap, url: &str, raw: &str) {
    let raw = raw.trim();
    if raw.is_empty() {
        return;
    }
    match serde_json::from_str::<JsonRpcResponse>(raw) {
        Ok(response) => {
            let Some(id) = response.id.0.as_ref().map(|id| id.as_key()) else {
                return;
            };
            if let Some((_, tx)) = pending.remove(&id) {
                let _ = tx.send(response);
            } else {
                trace!(url = %url, id = %id, "response with no pending request");
            }
        }
        Err(_) => {
            // Server-initiated requests and notifications are outside this
            // gateway's upstream contract.
            trace!(url = %url, "ignoring non-response upstream message");
        }
    }
}

fn resolve_endpoint(base: &str, endpoint: &str) -> GatewayResult<String> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(endpoint.to_string());
    }
    let base = url::Url::parse(base)
        .map_err(|e| GatewayError::internal(format!("upstream url: {e}")))?;
    base.join(endpoint)
        .map(|u| u.to_string())
        .map_err(|e| GatewayError::upstream(format!("bad endpoint event: {e}")))
}

async fn decode_http_response(
    response: reqwest::Response,
    id_key: &str,
) -> GatewayResult<JsonRpcResponse> {
    let status = response.status();
    if !status.is_success() {
        return Err(GatewayError::upstream_with_status(
            "upstream rejected request",
            status.as_u16(),
        ));
    }
    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = response.text().await.map_err(map_reqwest_error)?;

    if content_type.starts_with("text/event-stream") {
        // A streamed response body: the matching response rides in a data
        // line.
        for block in body.split("\n\n") {
            for line in block.lines() {
                if let Some(data) = line.strip_prefix("data:") {
                    if let Ok(rpc) = serde_json::from_str::<JsonRpcResponse>(data.trim())
                        && rpc.id.0.as_ref().map(|id| id.as_key()).as_deref() == Some(id_key)
                    {
                        return Ok(rpc);
                    }
                }
            }
        }
        return Err(GatewayError::upstream(
            "streamed response ended without a matching message",
        ));
    }

    serde_json::from_str(&body)
        .map_err(|e| GatewayError::upstream(format!("undecodable upstream response: {e}")))
}

fn map_reqwest_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::timeout("upstream http", 0)
    } else if err.is_connect() {
        GatewayError::unavailable(format!("connect failed: {err}"))
    } else {
        GatewayError::upstream(err.to_string())
    }
}

/// One parsed server-sent event.
struct SseEvent {
    name: String,
    data: String,
}

/// Incremental parser over an SSE byte stream.
struct SseEventStream<S> {
    stream: S,
    buffer: String,
}

impl<S> SseEventStream<S>
where
    S: futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: String::new(),
        }
    }

    async fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            if let Some(event) = self.pop_event() {
                return Some(event);
            }
            match self.stream.next().await? {
                Ok(chunk) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                Err(e) => {
                    warn!(error = %e, "SSE stream error");
                    return None;
                }
            }
        }
    }

    fn pop_event(&mut self) -> Option<SseEvent> {
        loop {
            let boundary = self.buffer.find("\n\n")?;
            let block: String = self.buffer.drain(..boundary + 2).collect();
            let mut name = "message".to_string();
            let mut data_lines = Vec::new();
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    name = value.trim().to_string();
                } else if let Some(value) = line.strip_prefix("data:") {
                    data_lines.push(value.trim().to_string());
                }
                // Comment lines (leading ':') are keep-alives; skip.
            }
            if data_lines.is_empty() && name == "message" {
                continue;
            }
            return Some(SseEvent {
                name,
                data: data_lines.join("\n"),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunked(parts: &[&str]) -> impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin {
        let items: Vec<Result<bytes::Bytes, reqwest::Error>> = parts
            .iter()
            .map(|p| Ok(bytes::Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        stream::iter(items)
    }

    #[tokio::test]
    async fn sse_parser_handles_split_chunks() {
        let mut events = SseEventStream::new(chunked(&[
            "event: endpoint\ndata: /message?sess",
            "ion_id=s1\n\n",
            "data: {\"jsonrpc\":\"2.0\",\"result\":{},\"id\":1}\n\n",
        ]));

        let first = events.next_event().await.unwrap();
        assert_eq!(first.name, "endpoint");
        assert_eq!(first.data, "/message?session_id=s1");

        let second = events.next_event().await.unwrap();
        assert_eq!(second.name, "message");
        assert!(second.data.contains("\"jsonrpc\""));

        assert!(events.next_event().await.is_none());
    }

    #[tokio::test]
    async fn sse_parser_skips_keepalive_comments() {
        let mut events = SseEventStream::new(chunked(&[": keep-alive\n\n", "data: x\n\n"]));
        let event = events.next_event().await.unwrap();
        assert_eq!(event.data, "x");
    }

    #[test]
    fn endpoint_resolution() {
        assert_eq!(
            resolve_endpoint("http://up.example/sse", "/message?session_id=1").unwrap(),
            "http://up.example/message?session_id=1"
        );
        assert_eq!(
            resolve_endpoint("http://up.example/sse", "https://other.example/m").unwrap(),
            "https://other.example/m"
        );
    }

    #[test]
    fn route_response_matches_pending_by_id() {
        let pending: PendingMap = Arc::new(DashMap::new());
        let (tx, mut rx) = oneshot::channel();
        pending.insert("1".to_string(), tx);
        route_response(
            &pending,
            "http://up.example",
            r#"{"jsonrpc":"2.0","result":{"ok":true},"id":1}"#,
        );
        let response = rx.try_recv().unwrap();
        assert!(matches!(
            response.payload,
            mcpgate_protocol::JsonRpcResponsePayload::Success { .. }
        ));
        assert!(pending.is_empty());
    }
}
