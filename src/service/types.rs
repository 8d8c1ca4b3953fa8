//! Service and deck records.
//!
//! These are the shapes the store collaborator hands us. The endpoint of a
//! service is a tagged union and cannot be changed through a [`ServicePatch`].

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Endpoint ────────────────────────────────────────────────────────────────

/// How a service is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServiceEndpoint {
    /// MCP server reachable over streamable HTTP or HTTP+SSE.
    RemoteMcp { url: String },
    /// MCP server spawned as a child process speaking JSON-RPC over stdio.
    LocalMcp(LocalCommand),
    /// Agent exposing a `/manifest` and one POST route per tool.
    A2a { url: String },
    /// Any `type` this build does not know how to reach.
    #[serde(other)]
    Unsupported,
}

impl ServiceEndpoint {
    /// The discriminator alone, for logging and status updates.
    pub fn kind(&self) -> ServiceKind {
        match self {
            ServiceEndpoint::RemoteMcp { .. } => ServiceKind::RemoteMcp,
            ServiceEndpoint::LocalMcp(_) => ServiceKind::LocalMcp,
            ServiceEndpoint::A2a { .. } => ServiceKind::A2a,
            ServiceEndpoint::Unsupported => ServiceKind::Unsupported,
        }
    }
}

/// Launch description for a local MCP server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Added on top of the inherited environment; these win on conflict.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Service kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    RemoteMcp,
    LocalMcp,
    A2a,
    Unsupported,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceKind::RemoteMcp => "remote-mcp",
            ServiceKind::LocalMcp => "local-mcp",
            ServiceKind::A2a => "a2a",
            ServiceKind::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

// ─── Health ──────────────────────────────────────────────────────────────────

/// Last known health of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

// ─── OAuth ───────────────────────────────────────────────────────────────────

/// OAuth client configuration and the current credential material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthSettings {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub authorization_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl OAuthSettings {
    /// Whether the stored credentials can still authenticate a request.
    ///
    /// A token with no refresh token that is past its expiry is dead; one
    /// with a refresh token can be renewed.
    pub fn is_authenticated(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_none() {
            return false;
        }
        match self.expires_at {
            Some(expiry) if expiry <= now => self.refresh_token.is_some(),
            _ => true,
        }
    }
}

/// Partial update of [`OAuthSettings`] client configuration.
///
/// Tokens are written through `ServiceStore::update_oauth_tokens` instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OAuthSettingsPatch {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub authorization_url: Option<String>,
    pub token_url: Option<String>,
    pub issuer: Option<String>,
    pub scope: Option<String>,
}

impl OAuthSettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ─── Service ─────────────────────────────────────────────────────────────────

/// A registered backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub endpoint: ServiceEndpoint,
    /// Static headers sent with every outbound request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Bearer credential for A2A agents.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub oauth: OAuthSettings,
    #[serde(default)]
    pub health: ServiceHealth,
    #[serde(default)]
    pub is_connected: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Service {
    fn with_endpoint(id: &str, name: &str, endpoint: ServiceEndpoint) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            endpoint,
            headers: HashMap::new(),
            api_key: None,
            oauth: OAuthSettings::default(),
            health: ServiceHealth::Unknown,
            is_connected: false,
            last_error: None,
        }
    }

    pub fn remote_mcp(id: &str, name: &str, url: &str) -> Self {
        Self::with_endpoint(id, name, ServiceEndpoint::RemoteMcp { url: url.to_string() })
    }

    pub fn local_mcp(id: &str, name: &str, command: LocalCommand) -> Self {
        Self::with_endpoint(id, name, ServiceEndpoint::LocalMcp(command))
    }

    pub fn a2a(id: &str, name: &str, url: &str) -> Self {
        Self::with_endpoint(id, name, ServiceEndpoint::A2a { url: url.to_string() })
    }

    /// Add a static header (builder style).
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn kind(&self) -> ServiceKind {
        self.endpoint.kind()
    }

    /// The base URL for remote and A2A services.
    pub fn url(&self) -> Option<&str> {
        match &self.endpoint {
            ServiceEndpoint::RemoteMcp { url } | ServiceEndpoint::A2a { url } => Some(url),
            _ => None,
        }
    }

    /// Apply a patch. The endpoint is never touched.
    pub fn apply(&mut self, patch: ServicePatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(headers) = patch.headers {
            self.headers = headers;
        }
        if let Some(api_key) = patch.api_key {
            self.api_key = api_key;
        }
        if let Some(health) = patch.health {
            self.health = health;
        }
        if let Some(connected) = patch.is_connected {
            self.is_connected = connected;
        }
        if let Some(last_error) = patch.last_error {
            self.last_error = last_error;
        }
        if let Some(oauth) = patch.oauth {
            let target = &mut self.oauth;
            macro_rules! set {
                ($field:ident) => {
                    if oauth.$field.is_some() {
                        target.$field = oauth.$field;
                    }
                };
            }
            set!(client_id);
            set!(client_secret);
            set!(authorization_url);
            set!(token_url);
            set!(issuer);
            set!(scope);
        }
    }
}

/// Partial update of a [`Service`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub api_key: Option<Option<String>>,
    pub health: Option<ServiceHealth>,
    pub is_connected: Option<bool>,
    pub last_error: Option<Option<String>>,
    pub oauth: Option<OAuthSettingsPatch>,
}

impl ServicePatch {
    /// Patch carrying a health-check outcome.
    pub fn status(health: ServiceHealth, connected: bool, error: Option<String>) -> Self {
        Self {
            health: Some(health),
            is_connected: Some(connected),
            last_error: Some(error),
            ..Self::default()
        }
    }
}

// ─── Deck ────────────────────────────────────────────────────────────────────

/// An ordered group of services presented together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deck {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Member service ids, in display order.
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub is_active: bool,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_endpoint_deserializes_tagged_kinds() {
        let json = r#"{
            "id": "svc-1",
            "name": "Files",
            "endpoint": {
                "type": "local-mcp",
                "command": "npx",
                "args": ["-y", "@modelcontextprotocol/server-filesystem"],
                "workingDir": "/tmp",
                "env": {"DEBUG": "1"}
            }
        }"#;
        let service: Service = serde_json::from_str(json).unwrap();
        assert_eq!(service.kind(), ServiceKind::LocalMcp);
        match &service.endpoint {
            ServiceEndpoint::LocalMcp(cmd) => {
                assert_eq!(cmd.command, "npx");
                assert_eq!(cmd.working_dir.as_deref(), Some("/tmp"));
                assert_eq!(cmd.env.get("DEBUG").map(String::as_str), Some("1"));
            }
            other => panic!("unexpected endpoint {other:?}"),
        }
        assert_eq!(service.health, ServiceHealth::Unknown);
    }

    #[test]
    fn test_unknown_kind_is_unsupported() {
        let json = r#"{"id": "x", "name": "X", "endpoint": {"type": "grpc"}}"#;
        let service: Service = serde_json::from_str(json).unwrap();
        assert_eq!(service.kind(), ServiceKind::Unsupported);
        assert!(service.url().is_none());
    }

    #[test]
    fn test_patch_never_changes_endpoint() {
        let mut service = Service::remote_mcp("s", "Remote", "https://mcp.example.com/mcp");
        service.apply(ServicePatch {
            name: Some("Renamed".into()),
            oauth: Some(OAuthSettingsPatch {
                token_url: Some("https://auth.example.com/token".into()),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(service.name, "Renamed");
        assert_eq!(service.url(), Some("https://mcp.example.com/mcp"));
        assert_eq!(
            service.oauth.token_url.as_deref(),
            Some("https://auth.example.com/token")
        );
        assert!(service.oauth.authorization_url.is_none());
    }

    #[test]
    fn test_expired_token_without_refresh_is_unauthenticated() {
        let now = Utc::now();
        let mut oauth = OAuthSettings {
            access_token: Some("tok".into()),
            expires_at: Some(now - Duration::minutes(1)),
            ..Default::default()
        };
        assert!(!oauth.is_authenticated(now));

        oauth.refresh_token = Some("refresh".into());
        assert!(oauth.is_authenticated(now));

        oauth.expires_at = None;
        oauth.refresh_token = None;
        assert!(oauth.is_authenticated(now));
    }
}
