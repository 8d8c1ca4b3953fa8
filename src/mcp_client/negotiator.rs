//! Remote transport negotiation.
//!
//! A remote MCP endpoint may speak streamable HTTP, the legacy HTTP+SSE
//! transport, or both. The negotiator tries streamable HTTP first and falls
//! back to SSE; when both fail the error lists each attempt.

use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};

use super::errors::{McpError, TransportAttempt};
use super::http::{HttpClients, StreamableHttpTransport};
use super::session::{McpSession, SessionSettings};
use super::sse::SseTransport;
use super::types::{ClientInfo, TransportKind};
use crate::config::McpConfig;

impl SessionSettings {
    pub fn from_config(config: &McpConfig) -> Self {
        Self {
            client: ClientInfo {
                name: config.client_name.clone(),
                version: config.client_version.clone(),
            },
            protocol_version: config.protocol_version.clone(),
            init_timeout: config.init_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// Build outbound headers: the service's custom headers, then the bearer
/// token when one is available. The token overrides a configured
/// `Authorization` header.
pub fn build_request_headers(
    service: &str,
    custom: &HashMap<String, String>,
    bearer_token: Option<&str>,
) -> Result<HeaderMap, McpError> {
    let invalid = |reason: String| McpError::ConfigError {
        service: service.to_string(),
        reason,
    };

    let mut headers = HeaderMap::new();
    for (name, value) in custom {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| invalid(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| invalid(format!("invalid value for header '{name}': {e}")))?;
        headers.insert(name, value);
    }

    if let Some(token) = bearer_token {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| invalid(format!("access token is not a valid header value: {e}")))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    Ok(headers)
}

/// Connects to remote MCP endpoints.
pub struct RemoteTransportNegotiator {
    clients: HttpClients,
    settings: SessionSettings,
}

impl RemoteTransportNegotiator {
    pub fn new(config: &McpConfig) -> Result<Self, McpError> {
        let clients = HttpClients::new(config.connect_timeout(), config.request_timeout())
            .map_err(|e| McpError::ConfigError {
                service: "*".into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            clients,
            settings: SessionSettings::from_config(config),
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Open an initialized session, streamable HTTP first, then SSE.
    pub async fn connect(
        &self,
        service: &str,
        url: &str,
        headers: HeaderMap,
    ) -> Result<McpSession, McpError> {
        let mut attempts = Vec::with_capacity(2);

        match self.connect_streamable(service, url, headers.clone()).await {
            Ok(session) => return Ok(session),
            // An auth challenge is the same on both transports.
            Err(e @ McpError::Unauthorized { .. }) => return Err(e),
            Err(e) => {
                tracing::debug!(service, url, error = %e, "streamable HTTP failed, trying SSE");
                attempts.push(TransportAttempt {
                    transport: TransportKind::StreamableHttp,
                    error: e.to_string(),
                });
            }
        }

        match self.connect_sse(service, url, headers).await {
            Ok(session) => return Ok(session),
            Err(e @ McpError::Unauthorized { .. }) => return Err(e),
            Err(e) => attempts.push(TransportAttempt {
                transport: TransportKind::Sse,
                error: e.to_string(),
            }),
        }

        tracing::warn!(service, url, "no transport could connect");
        Err(McpError::ConnectionFailed {
            service: service.to_string(),
            url: url.to_string(),
            attempts,
        })
    }

    async fn connect_streamable(
        &self,
        service: &str,
        url: &str,
        headers: HeaderMap,
    ) -> Result<McpSession, McpError> {
        let transport = StreamableHttpTransport::new(service, url, headers, &self.clients);
        McpSession::initialize(service, Box::new(transport), &self.settings).await
    }

    async fn connect_sse(
        &self,
        service: &str,
        url: &str,
        headers: HeaderMap,
    ) -> Result<McpSession, McpError> {
        let transport = SseTransport::connect(service, url, headers, &self.clients).await?;
        McpSession::initialize(service, Box::new(transport), &self.settings).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
