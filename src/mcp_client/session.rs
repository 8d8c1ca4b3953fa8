//! An initialized MCP session over any transport.
//!
//! Performs the `initialize` / `notifications/initialized` handshake and
//! exposes the list and call methods the rest of the crate uses. Every
//! request is bounded by the configured timeout.

use std::time::Duration;

use serde_json::{json, Value};

use super::capabilities::{normalize_prompts, normalize_resources, normalize_tools};
use super::errors::McpError;
use super::transport::{extract_result, McpTransport};
use super::types::{CapabilitySet, ClientInfo, InitializeResult, ServerInfo, TransportKind};

/// Handshake and request settings shared by all sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub client: ClientInfo,
    pub protocol_version: String,
    pub init_timeout: Duration,
    pub request_timeout: Duration,
}

/// A live, initialized MCP session.
pub struct McpSession {
    service: String,
    transport: Box<dyn McpTransport>,
    server_info: Option<ServerInfo>,
    protocol_version: Option<String>,
    server_capabilities: Value,
    request_timeout: Duration,
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("service", &self.service)
            .field("transport", &self.transport.kind())
            .field("server_info", &self.server_info)
            .finish()
    }
}

impl McpSession {
    /// Run the initialization handshake on a fresh transport.
    pub async fn initialize(
        service: &str,
        transport: Box<dyn McpTransport>,
        settings: &SessionSettings,
    ) -> Result<Self, McpError> {
        let params = json!({
            "protocolVersion": settings.protocol_version,
            "capabilities": {},
            "clientInfo": settings.client,
        });

        let response = tokio::time::timeout(
            settings.init_timeout,
            transport.request("initialize", Some(params)),
        )
        .await
        .map_err(|_| McpError::Timeout {
            service: service.to_string(),
            operation: "initialize".into(),
            timeout_ms: settings.init_timeout.as_millis() as u64,
        })??;

        let result = extract_result(response)?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                service: service.to_string(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        transport.notify("notifications/initialized", None).await?;

        tracing::debug!(
            service,
            transport = %transport.kind(),
            server = ?init.server_info.as_ref().and_then(|s| s.name.as_deref()),
            protocol = ?init.protocol_version,
            "mcp session initialized"
        );

        Ok(Self {
            service: service.to_string(),
            transport,
            server_info: init.server_info,
            protocol_version: init.protocol_version,
            server_capabilities: init.capabilities,
            request_timeout: settings.request_timeout,
        })
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let response = tokio::time::timeout(
            self.request_timeout,
            self.transport.request(method, Some(params)),
        )
        .await
        .map_err(|_| McpError::Timeout {
            service: self.service.clone(),
            operation: method.to_string(),
            timeout_ms: self.request_timeout.as_millis() as u64,
        })??;
        extract_result(response)
    }

    /// Whether the server announced a capability (or announced nothing at all).
    fn may_offer(&self, capability: &str) -> bool {
        match self.server_capabilities.as_object() {
            Some(caps) if !caps.is_empty() => caps.contains_key(capability),
            _ => true,
        }
    }

    /// A list call for an optional capability. A JSON-RPC error means the
    /// server does not offer it.
    async fn optional_list(&self, capability: &str, method: &str) -> Result<Option<Value>, McpError> {
        if !self.may_offer(capability) {
            return Ok(None);
        }
        match self.call(method, json!({})).await {
            Ok(raw) => Ok(Some(raw)),
            Err(McpError::ServerError { code, message, .. }) => {
                tracing::debug!(service = %self.service, method, code, %message, "capability not offered");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Raw `tools/list` result.
    pub async fn list_tools(&self) -> Result<Value, McpError> {
        self.call("tools/list", json!({})).await
    }

    /// Raw `resources/list` result.
    pub async fn list_resources(&self) -> Result<Value, McpError> {
        self.call("resources/list", json!({})).await
    }

    /// Raw `prompts/list` result.
    pub async fn list_prompts(&self) -> Result<Value, McpError> {
        self.call("prompts/list", json!({})).await
    }

    /// List everything the server offers, normalized.
    pub async fn discover_capabilities(&self) -> Result<CapabilitySet, McpError> {
        let tools = self
            .optional_list("tools", "tools/list")
            .await?
            .map(normalize_tools)
            .unwrap_or_default();
        let resources = self
            .optional_list("resources", "resources/list")
            .await?
            .map(normalize_resources)
            .unwrap_or_default();
        let prompts = self
            .optional_list("prompts", "prompts/list")
            .await?
            .map(normalize_prompts)
            .unwrap_or_default();
        Ok(CapabilitySet {
            tools,
            resources,
            prompts,
        })
    }

    /// `tools/call`. The result is returned as the server sent it.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.call("tools/call", json!({"name": name, "arguments": arguments}))
            .await
    }

    /// `resources/read`.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        self.call("resources/read", json!({"uri": uri})).await
    }

    /// `prompts/get`.
    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value, McpError> {
        let mut params = json!({"name": name});
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.call("prompts/get", params).await
    }

    /// Close the underlying transport.
    pub async fn close(&self) -> Result<(), McpError> {
        self.transport.close().await
    }
}
