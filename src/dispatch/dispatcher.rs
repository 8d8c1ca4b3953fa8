//! Capability dispatcher.
//!
//! The one entry point callers use. Resolves a service id through the
//! store, picks the backend for its kind, and turns a failing or empty
//! remote MCP service into `AuthorizationRequired` when OAuth discovery
//! finds a requirement.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join;
use serde_json::Value;

use super::a2a::A2aClient;
use super::backend::{A2aBackend, McpBackend, ServiceBackend};
use super::errors::DispatchError;
use crate::config::ConnectConfig;
use crate::mcp_client::{
    CapabilitySet, LocalProcessSupervisor, LocalServerInfo, McpError, ProcessState,
    RemoteTransportNegotiator, ServiceConnectionRegistry, ServiceTool,
};
use crate::oauth::{
    AuthorizationRequest, InMemoryStateStore, OAuthDiscovery, OAuthDiscoveryEngine, OAuthError,
    OAuthFlowCoordinator, OAuthStateStore, RegistrationConfig, RegistrationOutcome, TokenSet,
};
use crate::service::{
    OAuthSettingsPatch, Service, ServiceEndpoint, ServiceHealth, ServiceKind, ServicePatch,
    ServiceStore,
};
use crate::status::{ServiceStatusUpdate, StatusSink};

pub struct CapabilityDispatcher {
    store: Arc<dyn ServiceStore>,
    status: Arc<dyn StatusSink>,
    registry: Arc<ServiceConnectionRegistry>,
    discovery: Arc<OAuthDiscoveryEngine>,
    oauth: Arc<OAuthFlowCoordinator>,
    mcp: McpBackend,
    a2a: A2aBackend,
}

impl CapabilityDispatcher {
    /// Wire up every component with an in-memory OAuth state store.
    pub fn new(
        config: &ConnectConfig,
        store: Arc<dyn ServiceStore>,
        status: Arc<dyn StatusSink>,
    ) -> Result<Self, DispatchError> {
        let states = Arc::new(InMemoryStateStore::new(config.oauth.state_ttl()));
        Self::with_state_store(config, store, status, states)
    }

    pub fn with_state_store(
        config: &ConnectConfig,
        store: Arc<dyn ServiceStore>,
        status: Arc<dyn StatusSink>,
        states: Arc<dyn OAuthStateStore>,
    ) -> Result<Self, DispatchError> {
        let discovery = Arc::new(OAuthDiscoveryEngine::new(&config.oauth)?);
        let oauth = Arc::new(OAuthFlowCoordinator::new(
            store.clone(),
            states,
            discovery.clone(),
            &config.oauth,
        )?);
        let supervisor = Arc::new(LocalProcessSupervisor::new(&config.mcp));
        let registry = Arc::new(
            ServiceConnectionRegistry::new(RemoteTransportNegotiator::new(&config.mcp)?, supervisor)
                .with_token_source(oauth.clone()),
        );

        Ok(Self {
            mcp: McpBackend::new(registry.clone()),
            a2a: A2aBackend::new(A2aClient::new(&config.a2a)?),
            store,
            status,
            registry,
            discovery,
            oauth,
        })
    }

    pub fn registry(&self) -> &Arc<ServiceConnectionRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<LocalProcessSupervisor> {
        self.registry.supervisor()
    }

    pub fn oauth(&self) -> &Arc<OAuthFlowCoordinator> {
        &self.oauth
    }

    async fn service(&self, service_id: &str) -> Result<Service, DispatchError> {
        self.store
            .get_service(service_id)
            .await?
            .ok_or_else(|| DispatchError::ServiceNotFound {
                service: service_id.to_string(),
            })
    }

    fn backend_for(&self, service: &Service) -> Result<&dyn ServiceBackend, DispatchError> {
        match service.endpoint {
            ServiceEndpoint::RemoteMcp { .. } | ServiceEndpoint::LocalMcp(_) => Ok(&self.mcp),
            ServiceEndpoint::A2a { .. } => Ok(&self.a2a),
            ServiceEndpoint::Unsupported => Err(DispatchError::UnsupportedServiceKind {
                service: service.id.clone(),
                kind: service.kind(),
            }),
        }
    }

    // ─── Capabilities ────────────────────────────────────────────────────────

    pub async fn discover_capabilities(&self, service_id: &str) -> Result<CapabilitySet, DispatchError> {
        let service = self.service(service_id).await?;
        let backend = self.backend_for(&service)?;
        match backend.discover_capabilities(&service).await {
            Ok(capabilities) if capabilities.is_empty() => {
                match self.authorization_requirement(&service).await? {
                    Some(required) => Err(required),
                    None => Ok(capabilities),
                }
            }
            Ok(capabilities) => {
                tracing::debug!(
                    service = service_id,
                    tools = capabilities.tools.len(),
                    resources = capabilities.resources.len(),
                    prompts = capabilities.prompts.len(),
                    "capabilities discovered"
                );
                Ok(capabilities)
            }
            Err(e) => Err(self.explain_failure(&service, e).await?),
        }
    }

    pub async fn discover_tools(&self, service_id: &str) -> Result<Vec<ServiceTool>, DispatchError> {
        Ok(self.discover_capabilities(service_id).await?.tools)
    }

    pub async fn call_tool(
        &self,
        service_id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value, DispatchError> {
        let service = self.service(service_id).await?;
        let backend = self.backend_for(&service)?;
        tracing::info!(service = service_id, kind = %service.kind(), tool = name, "calling tool");
        match backend.call_operation(&service, name, arguments).await {
            Ok(result) => Ok(result),
            Err(e) => Err(self.explain_failure(&service, e).await?),
        }
    }

    pub async fn read_resource(&self, service_id: &str, uri: &str) -> Result<Value, DispatchError> {
        let service = self.mcp_service(service_id, "read_resource").await?;
        match self.registry.read_resource(&service, uri).await {
            Ok(result) => Ok(result),
            Err(e) => Err(self.explain_failure(&service, e.into()).await?),
        }
    }

    pub async fn get_prompt(
        &self,
        service_id: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, DispatchError> {
        let service = self.mcp_service(service_id, "get_prompt").await?;
        match self.registry.get_prompt(&service, name, arguments).await {
            Ok(result) => Ok(result),
            Err(e) => Err(self.explain_failure(&service, e.into()).await?),
        }
    }

    async fn mcp_service(&self, service_id: &str, operation: &'static str) -> Result<Service, DispatchError> {
        let service = self.service(service_id).await?;
        match service.kind() {
            ServiceKind::RemoteMcp | ServiceKind::LocalMcp => Ok(service),
            kind @ ServiceKind::A2a => Err(DispatchError::UnsupportedOperation {
                service: service.id,
                kind,
                operation,
            }),
            kind @ ServiceKind::Unsupported => Err(DispatchError::UnsupportedServiceKind {
                service: service.id,
                kind,
            }),
        }
    }

    // ─── OAuth requirement ───────────────────────────────────────────────────

    /// Replace a remote MCP failure with `AuthorizationRequired` when the
    /// service turns out to need OAuth. JSON-RPC errors come from a
    /// session that already works and are passed through.
    async fn explain_failure(&self, service: &Service, error: DispatchError) -> Result<DispatchError, DispatchError> {
        if matches!(error, DispatchError::Mcp(McpError::ServerError { .. })) {
            return Ok(error);
        }
        tracing::debug!(service = %service.id, error = %error, "operation failed");
        Ok(self.authorization_requirement(service).await?.unwrap_or(error))
    }

    /// Run discovery for a remote MCP service and store what it finds.
    async fn authorization_requirement(&self, service: &Service) -> Result<Option<DispatchError>, DispatchError> {
        let ServiceEndpoint::RemoteMcp { url } = &service.endpoint else {
            return Ok(None);
        };
        let discovery = self.discovery.discover(url).await;
        if !discovery.required {
            return Ok(None);
        }
        self.remember_discovery(service, &discovery).await?;
        tracing::info!(
            service = %service.id,
            authorization_url = ?discovery.authorization_url,
            "service requires oauth"
        );
        Ok(Some(DispatchError::AuthorizationRequired {
            service: service.id.clone(),
            discovery: Box::new(discovery),
        }))
    }

    /// Fill in OAuth settings the service does not have yet.
    async fn remember_discovery(&self, service: &Service, discovery: &OAuthDiscovery) -> Result<(), DispatchError> {
        let current = &service.oauth;
        let missing = |have: &Option<String>, found: &Option<String>| {
            if have.is_none() {
                found.clone()
            } else {
                None
            }
        };
        let scope = discovery
            .scopes_supported
            .as_ref()
            .filter(|scopes| !scopes.is_empty())
            .map(|scopes| scopes.join(" "));
        let patch = OAuthSettingsPatch {
            authorization_url: missing(&current.authorization_url, &discovery.authorization_url),
            token_url: missing(&current.token_url, &discovery.token_url),
            issuer: missing(&current.issuer, &discovery.issuer),
            scope: missing(&current.scope, &scope),
            ..OAuthSettingsPatch::default()
        };
        if patch.is_empty() {
            return Ok(());
        }
        self.store
            .update_service(
                &service.id,
                ServicePatch {
                    oauth: Some(patch),
                    ..ServicePatch::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Discovery on demand, for any service with a URL.
    pub async fn discover_oauth(&self, service_id: &str) -> Result<OAuthDiscovery, DispatchError> {
        let service = self.service(service_id).await?;
        let Some(url) = service.url() else {
            return Err(DispatchError::UnsupportedOperation {
                service: service.id.clone(),
                kind: service.kind(),
                operation: "discover_oauth",
            });
        };
        let discovery = self.discovery.discover(url).await;
        if discovery.required {
            self.remember_discovery(&service, &discovery).await?;
        }
        Ok(discovery)
    }

    // ─── Health ──────────────────────────────────────────────────────────────

    /// Probe a service and record the outcome. Probe failures become an
    /// unhealthy status, never an error.
    pub async fn check_health(&self, service_id: &str) -> Result<ServiceStatusUpdate, DispatchError> {
        let service = self.service(service_id).await?;
        let backend = self.backend_for(&service)?;

        let outcome = match backend.check_health(&service).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Crash details beat a generic failure.
                if let ProcessState::Crashed { exit_code } = self.supervisor().process_state(service_id).await {
                    Err(McpError::ServerCrashed {
                        service: service.id.clone(),
                        exit_code,
                    }
                    .to_string())
                } else {
                    Err(e.to_string())
                }
            }
        };

        let update = match outcome {
            Ok(()) => self.record_status(&service, ServiceHealth::Healthy, true, None).await?,
            Err(error) => {
                tracing::warn!(service = service_id, error = %error, "health check failed");
                self.record_status(&service, ServiceHealth::Unhealthy, false, Some(error))
                    .await?
            }
        };
        Ok(update)
    }

    async fn record_status(
        &self,
        service: &Service,
        health: ServiceHealth,
        connected: bool,
        error: Option<String>,
    ) -> Result<ServiceStatusUpdate, DispatchError> {
        self.store
            .update_service(&service.id, ServicePatch::status(health, connected, error.clone()))
            .await?;
        let update = ServiceStatusUpdate {
            service_id: service.id.clone(),
            kind: service.kind(),
            health,
            is_connected: connected,
            error,
            timestamp: Utc::now(),
        };
        self.status.publish(update.clone());
        Ok(update)
    }

    // ─── Local servers ───────────────────────────────────────────────────────

    pub async fn start_local_server(&self, service_id: &str) -> Result<LocalServerInfo, DispatchError> {
        let service = self.service(service_id).await?;
        match self.supervisor().start_local_server(&service).await {
            Ok(info) => {
                self.record_status(&service, ServiceHealth::Healthy, true, None).await?;
                Ok(info)
            }
            Err(e) => {
                if matches!(service.endpoint, ServiceEndpoint::LocalMcp(_)) {
                    self.record_status(&service, ServiceHealth::Unhealthy, false, Some(e.to_string()))
                        .await?;
                }
                Err(e.into())
            }
        }
    }

    /// Returns whether a process was running.
    pub async fn stop_local_server(&self, service_id: &str) -> Result<bool, DispatchError> {
        let service = self.service(service_id).await?;
        let stopped = self.supervisor().stop_local_server(service_id).await;
        if stopped {
            self.record_status(&service, ServiceHealth::Unknown, false, None).await?;
        }
        Ok(stopped)
    }

    // ─── OAuth flow ──────────────────────────────────────────────────────────

    pub async fn initiate_oauth_flow(
        &self,
        service_id: &str,
        redirect_uri: &str,
    ) -> Result<AuthorizationRequest, DispatchError> {
        Ok(self.oauth.initiate_oauth_flow(service_id, redirect_uri).await?)
    }

    pub async fn handle_oauth_callback(&self, code: &str, state: &str) -> Result<TokenSet, DispatchError> {
        Ok(self.oauth.handle_oauth_callback(code, state).await?)
    }

    /// Refresh with the stored refresh token.
    pub async fn refresh_oauth_token(&self, service_id: &str) -> Result<TokenSet, DispatchError> {
        let service = self.service(service_id).await?;
        let refresh_token = service
            .oauth
            .refresh_token
            .ok_or_else(|| OAuthError::MissingRefreshToken {
                service: service_id.to_string(),
            })?;
        Ok(self.oauth.refresh_oauth_token(service_id, &refresh_token).await?)
    }

    /// Register an OAuth client for the service and store the credentials
    /// on success.
    pub async fn auto_register_oauth_app(
        &self,
        service_id: &str,
        config: &RegistrationConfig,
    ) -> Result<RegistrationOutcome, DispatchError> {
        let service = self.service(service_id).await?;
        let Some(url) = service.url() else {
            return Err(DispatchError::UnsupportedOperation {
                service: service.id.clone(),
                kind: service.kind(),
                operation: "auto_register_oauth_app",
            });
        };
        let outcome = self.oauth.auto_register_oauth_app(url, config).await;
        if outcome.success {
            let patch = OAuthSettingsPatch {
                client_id: outcome.client_id.clone(),
                client_secret: outcome.client_secret.clone(),
                authorization_url: outcome.authorization_url.clone(),
                token_url: outcome.token_url.clone(),
                scope: config.scope.clone(),
                ..OAuthSettingsPatch::default()
            };
            self.store
                .update_service(
                    service_id,
                    ServicePatch {
                        oauth: Some(patch),
                        ..ServicePatch::default()
                    },
                )
                .await?;
        }
        Ok(outcome)
    }

    // ─── Active deck ─────────────────────────────────────────────────────────

    /// Members of the active deck, in deck order. Ids the store no longer
    /// knows are skipped.
    pub async fn list_active_deck_services(&self) -> Result<Vec<Service>, DispatchError> {
        let Some(deck) = self.store.get_active_deck().await? else {
            return Ok(Vec::new());
        };
        let mut services = Vec::with_capacity(deck.services.len());
        for id in &deck.services {
            match self.store.get_service(id).await? {
                Some(service) => services.push(service),
                None => tracing::warn!(deck = %deck.id, service = %id, "deck references unknown service"),
            }
        }
        Ok(services)
    }

    /// `call_tool`, restricted to members of the active deck.
    pub async fn call_deck_tool(
        &self,
        service_id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value, DispatchError> {
        let in_deck = self
            .store
            .get_active_deck()
            .await?
            .is_some_and(|deck| deck.services.iter().any(|id| id == service_id));
        if !in_deck {
            return Err(DispatchError::NotInActiveDeck {
                service: service_id.to_string(),
            });
        }
        self.call_tool(service_id, name, arguments).await
    }

    // ─── Shutdown ────────────────────────────────────────────────────────────

    /// Stop every local server and close every remote session.
    pub async fn shutdown(&self) {
        join(self.supervisor().cleanup(), self.registry.close_all()).await;
        tracing::info!("dispatcher shut down");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
