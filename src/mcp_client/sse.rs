//! Server-sent events: the decoder shared by both HTTP transports, and the
//! legacy HTTP+SSE transport.
//!
//! The legacy transport opens a long-lived `GET` event stream. The server
//! first sends an `endpoint` event naming the URL to POST requests to;
//! responses then arrive on the stream as `message` events and are matched
//! to waiting callers by JSON-RPC id.

use std::collections::HashMap;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{Client as HttpClient, Url};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::http::{check_status, HttpClients};
use super::sync::lock;
use super::transport::{next_request_id, McpTransport};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, TransportKind};

// ─── Event decoding ──────────────────────────────────────────────────────────

/// One decoded server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Event type, defaulting to `message` as the SSE format does.
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Boxed stream of decoded events. Errors are stream read failures.
pub type SseEventStream = Pin<Box<dyn Stream<Item = Result<SseEvent, String>> + Send>>;

/// Parse one event block (the text between blank lines).
///
/// Returns `None` for keep-alives and comment-only blocks.
pub fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data_lines: Vec<&str> = Vec::new();
    let mut saw_field = false;

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => {
                event.event = Some(value.to_string());
                saw_field = true;
            }
            "data" => {
                data_lines.push(value);
                saw_field = true;
            }
            "id" => event.id = Some(value.to_string()),
            _ => {}
        }
    }

    if !saw_field {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

/// Decode a byte stream into server-sent events.
///
/// Splits on blank lines across chunk boundaries; carriage returns are
/// dropped so CRLF streams decode the same as LF streams.
pub fn sse_events<S, B, E>(bytes: S) -> SseEventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(stream::unfold(
        (Box::pin(bytes), String::new(), false),
        |(mut bytes, mut buffer, mut done)| async move {
            loop {
                if let Some(end) = buffer.find("\n\n") {
                    let block: String = buffer.drain(..end + 2).collect();
                    match parse_event(&block) {
                        Some(event) => return Some((Ok(event), (bytes, buffer, done))),
                        None => continue,
                    }
                }

                if done {
                    // Flush a trailing event that lacked its blank line.
                    let rest = std::mem::take(&mut buffer);
                    return parse_event(&rest).map(|event| (Ok(event), (bytes, buffer, true)));
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        let text = String::from_utf8_lossy(chunk.as_ref()).replace('\r', "");
                        buffer.push_str(&text);
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(format!("stream read error: {e}")),
                            (bytes, buffer, true),
                        ));
                    }
                    None => done = true,
                }
            }
        },
    ))
}

// ─── SSE Transport ───────────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Removes a pending entry when the waiting request finishes or is dropped
/// (for instance by a session timeout).
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

/// Legacy HTTP+SSE transport.
pub struct SseTransport {
    service: String,
    http: HttpClient,
    headers: HeaderMap,
    endpoint: Url,
    pending: PendingMap,
    reader: JoinHandle<()>,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event.
    pub async fn connect(
        service: &str,
        url: &str,
        headers: HeaderMap,
        clients: &HttpClients,
    ) -> Result<Self, McpError> {
        let response = clients
            .stream
            .get(url)
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::TransportError {
                service: service.to_string(),
                reason: format!("GET {url} failed: {e}"),
            })?;
        let response = check_status(service, response).await?;
        let base = response.url().clone();

        let mut events = sse_events(response.bytes_stream());
        let endpoint = tokio::time::timeout(clients.connect_timeout, wait_for_endpoint(&mut events))
            .await
            .map_err(|_| McpError::Timeout {
                service: service.to_string(),
                operation: "sse endpoint event".into(),
                timeout_ms: clients.connect_timeout.as_millis() as u64,
            })?
            .map_err(|reason| McpError::TransportError {
                service: service.to_string(),
                reason,
            })?;

        let endpoint = base
            .join(endpoint.trim())
            .map_err(|e| McpError::TransportError {
                service: service.to_string(),
                reason: format!("invalid endpoint '{endpoint}': {e}"),
            })?;
        // Requests carry the service credentials, so they stay on the stream's origin.
        if endpoint.origin() != base.origin() {
            return Err(McpError::TransportError {
                service: service.to_string(),
                reason: format!("endpoint {endpoint} is not on the origin of {base}"),
            });
        }
        tracing::debug!(service, endpoint = %endpoint, "sse endpoint announced");

        let pending: PendingMap = Arc::default();
        let reader = tokio::spawn(read_messages(
            service.to_string(),
            events,
            pending.clone(),
        ));

        Ok(Self {
            service: service.to_string(),
            http: clients.request.clone(),
            headers,
            endpoint,
            pending,
            reader,
        })
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<(), McpError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| McpError::TransportError {
                service: self.service.clone(),
                reason: format!("POST {} failed: {e}", self.endpoint),
            })?;
        check_status(&self.service, response).await.map(|_| ())
    }
}

async fn wait_for_endpoint(events: &mut SseEventStream) -> Result<String, String> {
    while let Some(event) = events.next().await {
        let event = event?;
        if event.name() == "endpoint" {
            return Ok(event.data);
        }
    }
    Err("event stream closed before the endpoint event".into())
}

/// Route `message` events to their waiting requests until the stream ends.
async fn read_messages(service: String, mut events: SseEventStream, pending: PendingMap) {
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(service = %service, error = %e, "sse stream failed");
                break;
            }
        };
        if event.name() != "message" {
            continue;
        }
        match serde_json::from_str::<JsonRpcResponse>(&event.data) {
            Ok(resp) => {
                if let Some(tx) = lock(&pending).remove(&resp.id) {
                    let _ = tx.send(resp);
                }
            }
            Err(_) => tracing::trace!(service = %service, "ignoring non-response sse message"),
        }
    }
    tracing::debug!(service = %service, "sse stream closed");
    // Dropping the senders wakes every waiter with an error.
    lock(&pending).clear();
}

#[async_trait]
impl McpTransport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.reader.is_finished() {
            return Err(McpError::TransportError {
                service: self.service.clone(),
                reason: "event stream closed".into(),
            });
        }

        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        self.post(&JsonRpcRequest::new(id, method, params)).await?;

        rx.await.map_err(|_| McpError::TransportError {
            service: self.service.clone(),
            reason: "event stream closed before the response arrived".into(),
        })
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.post(&JsonRpcNotification::new(method, params)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.reader.abort();
        lock(&self.pending).clear();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn chunks(parts: &[&'static str]) -> SseEventStream {
        let items: Vec<Result<&'static [u8], std::io::Error>> =
            parts.iter().map(|p| Ok(p.as_bytes())).collect();
        sse_events(stream::iter(items))
    }

    #[tokio::test]
    async fn test_event_split_across_chunks() {
        let mut events = chunks(&["event: endpoint\nda", "ta: /messages?session=1\n\n"]);
        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.name(), "endpoint");
        assert_eq!(event.data, "/messages?session=1");
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_crlf_and_keepalive_comments() {
        let mut events = chunks(&[": ping\r\n\r\n", "data: {\"a\":1}\r\n\r\n"]);
        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.name(), "message");
        assert_eq!(event.data, "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_multiline_data_and_trailing_event() {
        let mut events = chunks(&["data: line one\ndata: line two\nid: 7"]);
        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.data, "line one\nline two");
        assert_eq!(event.id.as_deref(), Some("7"));
    }

    /// Serve an event stream whose only event announces `endpoint`.
    async fn announcing(endpoint: String) -> String {
        use axum::routing::get;

        let router = axum::Router::new().route(
            "/sse",
            get(move || {
                let endpoint = endpoint.clone();
                async move {
                    (
                        [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                        format!("event: endpoint\ndata: {endpoint}\n\n"),
                    )
                }
            }),
        );
        format!("{}/sse", crate::test_support::serve(router).await)
    }

    fn clients() -> HttpClients {
        HttpClients::new(Duration::from_secs(2), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_cross_origin_endpoint_is_rejected() {
        let url = announcing("http://evil.example/steal".into()).await;
        let result = SseTransport::connect("remote", &url, HeaderMap::new(), &clients()).await;
        let Err(err) = result else {
            panic!("cross-origin endpoint was accepted");
        };
        assert!(matches!(err, McpError::TransportError { .. }), "{err:?}");
        assert!(err.to_string().contains("evil.example"));
    }

    #[tokio::test]
    async fn test_absolute_same_origin_endpoint_is_accepted() {
        let (listener, base) = crate::test_support::bind().await;
        let endpoint = format!("{base}/messages?sessionId=1");
        let router = axum::Router::new().route(
            "/sse",
            axum::routing::get(move || {
                let endpoint = endpoint.clone();
                async move {
                    (
                        [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                        format!("event: endpoint\ndata: {endpoint}\n\n"),
                    )
                }
            }),
        );
        crate::test_support::serve_on(listener, router);

        let transport = SseTransport::connect("remote", &format!("{base}/sse"), HeaderMap::new(), &clients())
            .await
            .map_err(|e| e.to_string())
            .unwrap();
        assert_eq!(transport.endpoint.path(), "/messages");
    }

    #[test]
    fn test_comment_only_block_is_skipped() {
        assert!(parse_event(": keep-alive\n").is_none());
    }
}
