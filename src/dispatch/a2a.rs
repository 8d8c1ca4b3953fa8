//! HTTP client for A2A agent services.
//!
//! An agent publishes `GET {url}/manifest` naming its endpoints and accepts
//! `POST {url}/{tool}` with the arguments as the JSON body. Agents that
//! only publish an agent card at `{url}` are handled too: their skills
//! become tools and calls go to the card's `url` as JSON-RPC.

use std::collections::BTreeMap;

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};

use super::errors::DispatchError;
use crate::config::A2aConfig;
use crate::mcp_client::{build_request_headers, ServiceTool};
use crate::service::Service;

// ─── Wire documents ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    endpoints: BTreeMap<String, ManifestEndpoint>,
}

#[derive(Debug, Deserialize)]
struct ManifestEndpoint {
    #[serde(default)]
    description: String,
    #[serde(default, rename = "inputSchema")]
    input_schema: Value,
}

#[derive(Debug, Default, Deserialize)]
struct AgentCard {
    #[serde(default)]
    name: Option<String>,
    /// Where JSON-RPC requests go.
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    skills: Vec<AgentSkill>,
}

#[derive(Debug, Deserialize)]
struct AgentSkill {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "inputSchema")]
    input_schema: Option<Value>,
}

impl AgentSkill {
    fn tool_name(&self) -> Option<String> {
        if let Some(id) = self.id.as_deref().filter(|id| !id.is_empty()) {
            return Some(id.to_string());
        }
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .map(|n| n.to_lowercase().replace(' ', "-"))
    }
}

/// `{base}/{name}` with the tool name encoded as one path segment.
fn tool_url(service_id: &str, base: &str, name: &str) -> Result<Url, DispatchError> {
    let mut url = Url::parse(base).map_err(|e| DispatchError::a2a(service_id, format!("invalid URL {base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| DispatchError::a2a(service_id, format!("URL {base} cannot take a path")))?
        .pop_if_empty()
        .push(name);
    Ok(url)
}

// ─── Client ──────────────────────────────────────────────────────────────────

pub struct A2aClient {
    http: HttpClient,
}

impl A2aClient {
    pub fn new(config: &A2aConfig) -> Result<Self, DispatchError> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| DispatchError::a2a("*", format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    fn base_url(service: &Service) -> Result<&str, DispatchError> {
        service
            .url()
            .map(|url| url.trim_end_matches('/'))
            .ok_or_else(|| DispatchError::a2a(&service.id, "service has no URL"))
    }

    fn headers(service: &Service) -> Result<HeaderMap, DispatchError> {
        Ok(build_request_headers(&service.id, &service.headers, service.api_key.as_deref())?)
    }

    /// Tools from the manifest, or from the agent card's skills when there
    /// is no manifest.
    pub async fn discover_tools(&self, service: &Service) -> Result<Vec<ServiceTool>, DispatchError> {
        let base = Self::base_url(service)?;
        let manifest_url = format!("{base}/manifest");

        let response = self
            .http
            .get(&manifest_url)
            .headers(Self::headers(service)?)
            .send()
            .await
            .map_err(|e| DispatchError::a2a(&service.id, format!("GET {manifest_url}: {e}")))?;

        if response.status().is_success() {
            let manifest: Manifest = response
                .json()
                .await
                .map_err(|e| DispatchError::a2a(&service.id, format!("invalid manifest: {e}")))?;
            let tools: Vec<ServiceTool> = manifest
                .endpoints
                .into_iter()
                .map(|(name, endpoint)| ServiceTool {
                    name,
                    description: endpoint.description,
                    input_schema: endpoint.input_schema,
                })
                .collect();
            tracing::debug!(service = %service.id, count = tools.len(), "a2a manifest read");
            return Ok(tools);
        }

        tracing::debug!(
            service = %service.id,
            status = %response.status(),
            "no a2a manifest, reading agent card"
        );
        let card = self.agent_card(service, base).await?;
        Ok(card
            .skills
            .into_iter()
            .filter_map(|skill| {
                let name = skill.tool_name()?;
                Some(ServiceTool {
                    name,
                    description: skill.description,
                    input_schema: skill.input_schema.unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect())
    }

    /// Call one tool. Agents without per-tool routes get a JSON-RPC
    /// envelope at the agent card's `url` instead.
    pub async fn call_tool(
        &self,
        service: &Service,
        name: &str,
        arguments: Value,
    ) -> Result<Value, DispatchError> {
        let base = Self::base_url(service)?;
        let headers = Self::headers(service)?;
        let url = tool_url(&service.id, base, name)?;

        let response = self
            .http
            .post(url.clone())
            .headers(headers.clone())
            .json(&arguments)
            .send()
            .await
            .map_err(|e| DispatchError::a2a(&service.id, format!("POST {url}: {e}")))?;

        if !matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED) {
            let result = read_result(&service.id, response).await?;
            tracing::info!(service = %service.id, tool = name, "a2a tool called");
            return Ok(result);
        }

        let card = self.agent_card(service, base).await?;
        let Some(endpoint) = card.url else {
            return Err(DispatchError::a2a(
                &service.id,
                format!("no route for tool '{name}' and the agent card names no endpoint"),
            ));
        };
        tracing::debug!(
            service = %service.id,
            agent = card.name.as_deref().unwrap_or("unknown"),
            endpoint = %endpoint,
            "falling back to a2a json-rpc"
        );

        let envelope = json!({"jsonrpc": "2.0", "id": 1, "method": name, "params": arguments});
        let response = self
            .http
            .post(&endpoint)
            .headers(headers)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| DispatchError::a2a(&service.id, format!("POST {endpoint}: {e}")))?;

        let reply = read_result(&service.id, response).await?;
        if let Some(error) = reply.get("error") {
            return Err(DispatchError::a2a(&service.id, format!("agent returned error: {error}")));
        }
        tracing::info!(service = %service.id, tool = name, "a2a tool called over json-rpc");
        Ok(reply.get("result").cloned().unwrap_or(reply))
    }

    async fn agent_card(&self, service: &Service, base: &str) -> Result<AgentCard, DispatchError> {
        let response = self
            .http
            .get(base)
            .send()
            .await
            .map_err(|e| DispatchError::a2a(&service.id, format!("GET {base}: {e}")))?;
        if !response.status().is_success() {
            return Err(DispatchError::a2a(
                &service.id,
                format!("no manifest or agent card (HTTP {})", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| DispatchError::a2a(&service.id, format!("invalid agent card: {e}")))
    }
}

/// JSON body when the agent sends JSON, text otherwise.
async fn read_result(service_id: &str, response: Response) -> Result<Value, DispatchError> {
    let status = response.status();
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    let body = response
        .text()
        .await
        .map_err(|e| DispatchError::a2a(service_id, e.to_string()))?;

    if !status.is_success() {
        return Err(DispatchError::a2a(service_id, format!("HTTP {status}: {body}")));
    }
    if is_json {
        if let Ok(value) = serde_json::from_str(&body) {
            return Ok(value);
        }
    }
    Ok(Value::String(body))
}
