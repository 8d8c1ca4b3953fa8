//! In-process fixtures shared by the unit tests: axum mock servers for the
//! HTTP transports, and a shell script that speaks MCP over stdio.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::service::{LocalCommand, Service};

// ─── Serving ─────────────────────────────────────────────────────────────────

/// Bind an ephemeral local port. Returns the listener and its base URL.
pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    (listener, base)
}

pub fn serve_on(listener: TcpListener, router: Router) {
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
}

/// Serve a router on an ephemeral port and return its base URL.
pub async fn serve(router: Router) -> String {
    let (listener, base) = bind().await;
    serve_on(listener, router);
    base
}

// ─── MCP responses ───────────────────────────────────────────────────────────

/// Canned answers of the mock remote server.
fn mcp_result(method: &str, params: &Value) -> Result<Value, (i32, &'static str)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {}, "resources": {}},
            "serverInfo": {"name": "mock-remote", "version": "1.0"}
        })),
        "tools/list" => Ok(json!({
            "tools": [{"name": "echo", "description": "Echo input", "inputSchema": {"type": "object"}}]
        })),
        "resources/list" => Ok(json!({
            "resources": [{"uri": "mock://readme", "name": "readme"}]
        })),
        "tools/call" => Ok(json!({
            "content": [{"type": "text", "text": format!("called {}", params["name"].as_str().unwrap_or(""))}],
            "arguments": params["arguments"].clone()
        })),
        "resources/read" => Ok(json!({
            "contents": [{"uri": params["uri"].clone(), "text": "hello"}]
        })),
        "prompts/get" => Ok(json!({"messages": []})),
        _ => Err((-32601, "Method not found")),
    }
}

fn mcp_reply(body: &Value) -> Option<Value> {
    let id = body.get("id")?.clone();
    let method = body["method"].as_str().unwrap_or_default();
    Some(match mcp_result(method, &body["params"]) {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => {
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        }
    })
}

// ─── Streamable HTTP mock ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MockMcpOptions {
    /// Reject requests without `Authorization: Bearer <token>`.
    pub require_token: Option<String>,
    /// Challenge sent with the 401.
    pub www_authenticate: Option<String>,
    /// Answer with `text/event-stream` bodies instead of JSON.
    pub event_stream_responses: bool,
}

struct MockState {
    options: MockMcpOptions,
    initialize_count: AtomicUsize,
    tool_calls: AtomicUsize,
    unauthorized_count: AtomicUsize,
    session_generation: AtomicUsize,
}

pub struct MockMcpServer {
    base: String,
    state: Arc<MockState>,
}

impl MockMcpServer {
    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn mcp_url(&self) -> String {
        format!("{}/mcp", self.base)
    }

    pub fn initialize_count(&self) -> usize {
        self.state.initialize_count.load(Ordering::SeqCst)
    }

    pub fn tool_calls(&self) -> usize {
        self.state.tool_calls.load(Ordering::SeqCst)
    }

    pub fn unauthorized_count(&self) -> usize {
        self.state.unauthorized_count.load(Ordering::SeqCst)
    }

    /// Forget every session, as a restarted server would.
    pub fn restart(&self) {
        self.state.session_generation.fetch_add(1, Ordering::SeqCst);
    }
}

async fn handle_mcp(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(token) = &state.options.require_token {
        let expected = format!("Bearer {token}");
        let presented = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            state.unauthorized_count.fetch_add(1, Ordering::SeqCst);
            let mut response = StatusCode::UNAUTHORIZED.into_response();
            if let Some(challenge) = &state.options.www_authenticate {
                response
                    .headers_mut()
                    .insert(WWW_AUTHENTICATE, HeaderValue::from_str(challenge).unwrap());
            }
            return response;
        }
    }

    let session = format!("mock-session-{}", state.session_generation.load(Ordering::SeqCst));
    let presented_session = headers.get("mcp-session-id").and_then(|v| v.to_str().ok());
    if presented_session.is_some_and(|presented| presented != session) {
        return StatusCode::NOT_FOUND.into_response();
    }

    match body["method"].as_str() {
        Some("initialize") => {
            state.initialize_count.fetch_add(1, Ordering::SeqCst);
        }
        Some("tools/call") => {
            state.tool_calls.fetch_add(1, Ordering::SeqCst);
        }
        _ => {}
    }

    let Some(reply) = mcp_reply(&body) else {
        return StatusCode::ACCEPTED.into_response();
    };

    let mut response = if state.options.event_stream_responses {
        (
            [(CONTENT_TYPE, "text/event-stream")],
            format!(": warming up\n\nevent: message\ndata: {reply}\n\n"),
        )
            .into_response()
    } else {
        Json(reply).into_response()
    };
    response
        .headers_mut()
        .insert("mcp-session-id", HeaderValue::from_str(&session).unwrap());
    response
}

/// A streamable HTTP MCP server at `/mcp`.
pub async fn spawn_mcp_http_server(options: MockMcpOptions) -> MockMcpServer {
    let state = Arc::new(MockState {
        options,
        initialize_count: AtomicUsize::new(0),
        tool_calls: AtomicUsize::new(0),
        unauthorized_count: AtomicUsize::new(0),
        session_generation: AtomicUsize::new(0),
    });
    let router = Router::new()
        .route("/mcp", post(handle_mcp))
        .with_state(state.clone());
    let base = serve(router).await;
    MockMcpServer { base, state }
}

// ─── Legacy SSE mock ─────────────────────────────────────────────────────────

#[derive(Default)]
struct SseState {
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

pub struct MockSseServer {
    base: String,
}

impl MockSseServer {
    pub fn sse_url(&self) -> String {
        format!("{}/sse", self.base)
    }
}

async fn sse_stream(
    State(state): State<Arc<SseState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    *state.sender.lock().unwrap() = Some(tx);

    let endpoint = stream::once(async {
        Ok::<_, Infallible>(Event::default().event("endpoint").data("/messages?sessionId=mock"))
    });
    let messages = stream::unfold(rx, |mut rx| async move {
        let data = rx.recv().await?;
        Some((Ok(Event::default().event("message").data(data)), rx))
    });
    Sse::new(endpoint.chain(messages))
}

async fn sse_post(State(state): State<Arc<SseState>>, Json(body): Json<Value>) -> StatusCode {
    if let Some(reply) = mcp_reply(&body) {
        if let Some(tx) = state.sender.lock().unwrap().as_ref() {
            let _ = tx.send(reply.to_string());
        }
    }
    StatusCode::ACCEPTED
}

/// A legacy HTTP+SSE server: `GET /sse` plus `POST /messages`. POSTing to
/// `/sse` gets 405, so streamable HTTP fails against it.
pub async fn spawn_mcp_sse_server() -> MockSseServer {
    let state = Arc::new(SseState::default());
    let router = Router::new()
        .route("/sse", get(sse_stream))
        .route("/messages", post(sse_post))
        .with_state(state);
    MockSseServer {
        base: serve(router).await,
    }
}

// ─── Stdio mock ──────────────────────────────────────────────────────────────

/// A line-oriented MCP server in POSIX sh. `tools/call` of `crash` exits
/// with status 3; `greet` answers with `$MOCK_GREETING`.
pub const MOCK_MCP_SCRIPT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  method=$(printf '%s' "$line" | sed -n 's/.*"method":"\([^"]*\)".*/\1/p')
  [ -z "$id" ] && continue
  case "$method" in
    initialize)
      result='{"protocolVersion":"2025-03-26","capabilities":{"tools":{}},"serverInfo":{"name":"mock-local","version":"1.0"}}' ;;
    tools/list)
      result='{"tools":[{"name":"echo","description":"Echo input","inputSchema":{"type":"object"}}]}' ;;
    tools/call)
      case "$line" in
        *'"name":"crash"'*) exit 3 ;;
        *'"name":"greet"'*) result="{\"content\":[{\"type\":\"text\",\"text\":\"${MOCK_GREETING:-hi}\"}]}" ;;
        *) result='{"content":[{"type":"text","text":"pong"}]}' ;;
      esac ;;
    resources/read)
      result='{"contents":[{"uri":"file:///readme","text":"local"}]}' ;;
    prompts/get)
      result='{"messages":[{"role":"user","content":{"type":"text","text":"hello"}}]}' ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id"
      continue ;;
  esac
  printf '{"jsonrpc":"2.0","id":%s,"result":%s}\n' "$id" "$result"
done
"#;

/// A local-mcp service running [`MOCK_MCP_SCRIPT`].
pub fn local_mcp_service(id: &str) -> Service {
    Service::local_mcp(
        id,
        &format!("Local {id}"),
        LocalCommand {
            command: "sh".into(),
            args: vec!["-c".into(), MOCK_MCP_SCRIPT.into()],
            ..LocalCommand::default()
        },
    )
}
