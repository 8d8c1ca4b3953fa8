//! Service connection registry.
//!
//! Holds at most one live MCP session per service id. Remote sessions are
//! opened through the [`RemoteTransportNegotiator`] and cached; local
//! sessions belong to the [`LocalProcessSupervisor`] and are only looked up
//! here, never spawned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::errors::McpError;
use super::lifecycle::{LocalProcess, LocalProcessSupervisor};
use super::negotiator::{build_request_headers, RemoteTransportNegotiator};
use super::session::McpSession;
use super::sync::{lock, KeyedLocks};
use super::types::{CapabilitySet, TransportKind};
use crate::service::{Service, ServiceEndpoint};

// ─── Token source ────────────────────────────────────────────────────────────

/// Supplies bearer tokens for remote services, refreshing them as needed.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self, service_id: &str) -> Option<String>;
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// A cached remote session.
pub struct ConnectionRecord {
    pub id: Uuid,
    pub service_id: String,
    pub url: String,
    pub connected_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    session: McpSession,
}

impl ConnectionRecord {
    pub fn transport_kind(&self) -> TransportKind {
        self.session.transport_kind()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *lock(&self.last_activity)
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Utc::now();
    }
}

/// The session backing one service.
#[derive(Clone)]
pub enum ServiceClient {
    Remote(Arc<ConnectionRecord>),
    Local(Arc<LocalProcess>),
}

impl ServiceClient {
    pub fn session(&self) -> &McpSession {
        match self {
            ServiceClient::Remote(record) => &record.session,
            ServiceClient::Local(process) => process.session(),
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.session().transport_kind()
    }

    fn touch(&self) {
        match self {
            ServiceClient::Remote(record) => record.touch(),
            ServiceClient::Local(process) => process.touch(),
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

pub struct ServiceConnectionRegistry {
    negotiator: RemoteTransportNegotiator,
    supervisor: Arc<LocalProcessSupervisor>,
    connections: RwLock<HashMap<String, Arc<ConnectionRecord>>>,
    locks: KeyedLocks,
    token_source: Option<Arc<dyn AccessTokenSource>>,
}

impl ServiceConnectionRegistry {
    pub fn new(negotiator: RemoteTransportNegotiator, supervisor: Arc<LocalProcessSupervisor>) -> Self {
        Self {
            negotiator,
            supervisor,
            connections: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
            token_source: None,
        }
    }

    /// Use `source` for bearer tokens instead of the stored access token.
    pub fn with_token_source(mut self, source: Arc<dyn AccessTokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    pub fn supervisor(&self) -> &Arc<LocalProcessSupervisor> {
        &self.supervisor
    }

    async fn bearer_token(&self, service: &Service) -> Option<String> {
        if let Some(source) = &self.token_source {
            if let Some(token) = source.access_token(&service.id).await {
                return Some(token);
            }
        }
        service.oauth.access_token.clone()
    }

    /// The session for a service, connecting a remote one if needed.
    pub async fn get_or_create_client(&self, service: &Service) -> Result<ServiceClient, McpError> {
        let url = match &service.endpoint {
            ServiceEndpoint::RemoteMcp { url } => url,
            ServiceEndpoint::LocalMcp(_) => {
                return self
                    .supervisor
                    .process(&service.id)
                    .await
                    .map(ServiceClient::Local);
            }
            _ => {
                return Err(McpError::ConfigError {
                    service: service.id.clone(),
                    reason: format!("{} services have no MCP session", service.kind()),
                })
            }
        };

        if let Some(record) = self.connections.read().await.get(&service.id) {
            return Ok(ServiceClient::Remote(record.clone()));
        }

        let _guard = self.locks.lock(&service.id).await;
        // Another caller may have connected while we waited.
        if let Some(record) = self.connections.read().await.get(&service.id) {
            return Ok(ServiceClient::Remote(record.clone()));
        }

        let token = self.bearer_token(service).await;
        let headers = build_request_headers(&service.id, &service.headers, token.as_deref())?;
        let session = self.negotiator.connect(&service.id, url, headers).await?;

        let now = Utc::now();
        let record = Arc::new(ConnectionRecord {
            id: Uuid::new_v4(),
            service_id: service.id.clone(),
            url: url.clone(),
            connected_at: now,
            last_activity: Mutex::new(now),
            session,
        });
        tracing::info!(
            service = %service.id,
            transport = %record.transport_kind(),
            connection = %record.id,
            "connected to remote service"
        );
        self.connections
            .write()
            .await
            .insert(service.id.clone(), record.clone());
        Ok(ServiceClient::Remote(record))
    }

    /// Record activity and drop a remote session whose channel failed.
    async fn settle<T>(&self, client: &ServiceClient, result: &Result<T, McpError>) {
        client.touch();
        let (ServiceClient::Remote(record), Err(e)) = (client, result) else {
            return;
        };
        if !e.is_transport_failure() {
            return;
        }
        let mut connections = self.connections.write().await;
        if connections
            .get(&record.service_id)
            .is_some_and(|current| Arc::ptr_eq(current, record))
        {
            connections.remove(&record.service_id);
            drop(connections);
            tracing::warn!(service = %record.service_id, error = %e, "dropping failed connection");
            let _ = record.session.close().await;
        }
    }

    pub async fn discover_capabilities(&self, service: &Service) -> Result<CapabilitySet, McpError> {
        if matches!(service.endpoint, ServiceEndpoint::LocalMcp(_)) {
            return self.supervisor.discover_capabilities(&service.id).await;
        }
        let client = self.get_or_create_client(service).await?;
        let result = client.session().discover_capabilities().await;
        self.settle(&client, &result).await;
        result
    }

    pub async fn call_tool(&self, service: &Service, name: &str, arguments: Value) -> Result<Value, McpError> {
        let client = self.get_or_create_client(service).await?;
        let result = client.session().call_tool(name, arguments).await;
        self.settle(&client, &result).await;
        result
    }

    pub async fn read_resource(&self, service: &Service, uri: &str) -> Result<Value, McpError> {
        let client = self.get_or_create_client(service).await?;
        let result = client.session().read_resource(uri).await;
        self.settle(&client, &result).await;
        result
    }

    pub async fn get_prompt(
        &self,
        service: &Service,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, McpError> {
        let client = self.get_or_create_client(service).await?;
        let result = client.session().get_prompt(name, arguments).await;
        self.settle(&client, &result).await;
        result
    }

    /// Close and forget a remote session. Returns whether one existed.
    pub async fn disconnect(&self, service_id: &str) -> bool {
        let _guard = self.locks.lock(service_id).await;
        let Some(record) = self.connections.write().await.remove(service_id) else {
            return false;
        };
        if let Err(e) = record.session.close().await {
            tracing::debug!(service = service_id, error = %e, "close failed");
        }
        tracing::info!(service = service_id, "disconnected");
        true
    }

    /// Close every remote session.
    pub async fn close_all(&self) {
        let records: Vec<Arc<ConnectionRecord>> =
            self.connections.write().await.drain().map(|(_, r)| r).collect();
        join_all(records.iter().map(|r| r.session.close())).await;
        if !records.is_empty() {
            tracing::info!(count = records.len(), "closed remote connections");
        }
    }

    /// Whether a service currently has a live session.
    pub async fn is_connected(&self, service: &Service) -> bool {
        match &service.endpoint {
            ServiceEndpoint::LocalMcp(_) => self.supervisor.is_running(&service.id).await,
            _ => self.connections.read().await.contains_key(&service.id),
        }
    }

    /// Cached remote sessions.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::McpConfig;
    use crate::test_support::{spawn_mcp_http_server, MockMcpOptions};

    fn registry() -> ServiceConnectionRegistry {
        let config = McpConfig {
            connect_timeout_ms: 2_000,
            request_timeout_ms: 2_000,
            init_timeout_ms: 2_000,
            shutdown_timeout_ms: 1_000,
            ..McpConfig::default()
        };
        ServiceConnectionRegistry::new(
            RemoteTransportNegotiator::new(&config).unwrap(),
            Arc::new(LocalProcessSupervisor::new(&config)),
        )
    }

    struct FixedToken(&'static str);

    #[async_trait]
    impl AccessTokenSource for FixedToken {
        async fn access_token(&self, _service_id: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_two_discoveries_share_one_connection() {
        let server = spawn_mcp_http_server(MockMcpOptions::default()).await;
        let registry = registry();
        let service = Service::remote_mcp("remote", "Remote", &server.mcp_url());

        let first = registry.discover_capabilities(&service).await.unwrap();
        let second = registry.discover_capabilities(&service).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.tools[0].name, "echo");
        assert_eq!(first.resources[0].uri, "mock://readme");
        assert!(first.prompts.is_empty());
        assert_eq!(server.initialize_count(), 1);
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_connection() {
        let server = spawn_mcp_http_server(MockMcpOptions::default()).await;
        let registry = Arc::new(registry());
        let service = Service::remote_mcp("remote", "Remote", &server.mcp_url());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let service = service.clone();
                tokio::spawn(async move { registry.get_or_create_client(&service).await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(server.initialize_count(), 1);
    }

    #[tokio::test]
    async fn test_call_tool_passes_result_through() {
        let server = spawn_mcp_http_server(MockMcpOptions {
            event_stream_responses: true,
            ..Default::default()
        })
        .await;
        let registry = registry();
        let service = Service::remote_mcp("remote", "Remote", &server.mcp_url());

        let result = registry
            .call_tool(&service, "echo", serde_json::json!({"q": "x"}))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "called echo");
        assert_eq!(result["arguments"]["q"], "x");
        assert_eq!(server.tool_calls(), 1);
    }

    #[tokio::test]
    async fn test_token_source_supplies_bearer() {
        let server = spawn_mcp_http_server(MockMcpOptions {
            require_token: Some("fresh".into()),
            ..Default::default()
        })
        .await;
        let service = Service::remote_mcp("remote", "Remote", &server.mcp_url());

        let err = registry().discover_capabilities(&service).await.unwrap_err();
        assert!(matches!(err, McpError::Unauthorized { .. }));

        let registry = registry().with_token_source(Arc::new(FixedToken("fresh")));
        registry.discover_capabilities(&service).await.unwrap();
        assert!(registry.is_connected(&service).await);
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect() {
        let server = spawn_mcp_http_server(MockMcpOptions::default()).await;
        let registry = registry();
        let service = Service::remote_mcp("remote", "Remote", &server.mcp_url());

        registry.get_or_create_client(&service).await.unwrap();
        assert!(registry.disconnect("remote").await);
        assert!(!registry.disconnect("remote").await);
        assert!(!registry.is_connected(&service).await);

        registry.get_or_create_client(&service).await.unwrap();
        assert_eq!(server.initialize_count(), 2);
        registry.close_all().await;
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_expired_session_is_evicted_and_reconnected() {
        let server = spawn_mcp_http_server(MockMcpOptions::default()).await;
        let registry = registry();
        let service = Service::remote_mcp("remote", "Remote", &server.mcp_url());

        registry.call_tool(&service, "echo", serde_json::json!({})).await.unwrap();
        server.restart();

        let err = registry
            .call_tool(&service, "echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::SessionExpired { .. }), "{err:?}");
        assert_eq!(registry.connection_count().await, 0);

        let result = registry
            .call_tool(&service, "echo", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "called echo");
        assert_eq!(server.initialize_count(), 2);
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_local_service_is_never_spawned_here() {
        let registry = registry();
        let service = crate::test_support::local_mcp_service("files");
        let err = registry
            .call_tool(&service, "echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotRunning { .. }));
        assert!(!registry.supervisor().is_running("files").await);
    }

    #[tokio::test]
    async fn test_a2a_has_no_session() {
        let registry = registry();
        let service = Service::a2a("agent", "Agent", "http://127.0.0.1:1");
        let err = registry.get_or_create_client(&service).await.err().unwrap();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }
}
