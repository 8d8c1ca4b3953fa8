//! Streamable HTTP transport.
//!
//! Each JSON-RPC message is POSTed to the single MCP endpoint. The server
//! answers with either a JSON body or an event stream that carries the
//! response. A session id handed out in the `Mcp-Session-Id` response header
//! is replayed on every later request.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client as HttpClient, Response, StatusCode};

use super::errors::McpError;
use super::sse::sse_events;
use super::sync::lock;
use super::transport::{next_request_id, McpTransport};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, TransportKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Session id header defined by the streamable HTTP transport.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Accept header for POSTs: servers may answer with either form.
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 500;

// ─── Clients ─────────────────────────────────────────────────────────────────

/// The two HTTP clients every remote transport needs.
///
/// `request` carries a total timeout; `stream` only bounds connecting, since
/// an SSE stream stays open for the life of the session.
#[derive(Debug, Clone)]
pub struct HttpClients {
    pub request: HttpClient,
    pub stream: HttpClient,
    pub connect_timeout: Duration,
}

impl HttpClients {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let request = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        let stream = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            request,
            stream,
            connect_timeout,
        })
    }
}

/// Turn a non-2xx response into the matching error.
///
/// 401 keeps the `WWW-Authenticate` header so the caller can start OAuth
/// discovery from it.
pub(crate) async fn check_status(service: &str, response: Response) -> Result<Response, McpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::UNAUTHORIZED {
        let www_authenticate = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        return Err(McpError::Unauthorized {
            service: service.to_string(),
            www_authenticate,
        });
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(McpError::HttpStatus {
        service: service.to_string(),
        status: status.as_u16(),
        body,
    })
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Streamable HTTP transport for one remote MCP endpoint.
pub struct StreamableHttpTransport {
    service: String,
    url: String,
    http: HttpClient,
    headers: HeaderMap,
    session_id: Mutex<Option<String>>,
}

impl StreamableHttpTransport {
    pub fn new(service: &str, url: &str, headers: HeaderMap, clients: &HttpClients) -> Self {
        Self {
            service: service.to_string(),
            url: url.to_string(),
            http: clients.request.clone(),
            headers,
            session_id: Mutex::new(None),
        }
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        lock(&self.session_id).clone()
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            service: self.service.clone(),
            reason,
        }
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<Response, McpError> {
        let mut req = self
            .http
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, ACCEPT_BOTH)
            .json(body);
        let sent_session = self.session_id();
        if let Some(session_id) = &sent_session {
            req = req.header(SESSION_HEADER, session_id);
        }

        let response = req
            .send()
            .await
            .map_err(|e| self.transport_error(format!("POST {} failed: {e}", self.url)))?;

        // 404 against a session id: the server no longer knows the session.
        if response.status() == StatusCode::NOT_FOUND {
            if let Some(session_id) = sent_session {
                *lock(&self.session_id) = None;
                return Err(McpError::SessionExpired {
                    service: self.service.clone(),
                    session_id,
                });
            }
        }

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *lock(&self.session_id) = Some(session_id.to_string());
        }

        check_status(&self.service, response).await
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let response = self.post(&JsonRpcRequest::new(id, method, params)).await?;

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_stream {
            let mut events = sse_events(response.bytes_stream());
            while let Some(event) = events.next().await {
                let event = event.map_err(|reason| self.transport_error(reason))?;
                match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    Ok(resp) if resp.id == id => return Ok(resp),
                    // Server notifications or requests interleaved on the stream.
                    _ => continue,
                }
            }
            return Err(self.transport_error(format!(
                "event stream ended before the response to '{method}'"
            )));
        }

        let resp: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(format!("invalid JSON-RPC response: {e}")))?;
        if resp.id != id {
            return Err(self.transport_error(format!(
                "response id {} does not match request id {id}",
                resp.id
            )));
        }
        Ok(resp)
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.post(&JsonRpcNotification::new(method, params))
            .await
            .map(|_| ())
    }

    async fn close(&self) -> Result<(), McpError> {
        let Some(session_id) = lock(&self.session_id).take() else {
            return Ok(());
        };
        // Best-effort: servers may not support explicit termination.
        let result = self
            .http
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session_id)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(service = %self.service, error = %e, "session DELETE failed");
        }
        Ok(())
    }
}
