//! One interface over every kind of service.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::a2a::A2aClient;
use super::errors::DispatchError;
use crate::mcp_client::{CapabilitySet, ServiceConnectionRegistry};
use crate::service::Service;

#[async_trait]
pub trait ServiceBackend: Send + Sync {
    async fn discover_capabilities(&self, service: &Service) -> Result<CapabilitySet, DispatchError>;

    async fn call_operation(
        &self,
        service: &Service,
        name: &str,
        arguments: Value,
    ) -> Result<Value, DispatchError>;

    /// Cheapest call that proves the service answers.
    async fn check_health(&self, service: &Service) -> Result<(), DispatchError>;
}

/// Remote and local MCP servers, through the connection registry.
pub struct McpBackend {
    registry: Arc<ServiceConnectionRegistry>,
}

impl McpBackend {
    pub fn new(registry: Arc<ServiceConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ServiceBackend for McpBackend {
    async fn discover_capabilities(&self, service: &Service) -> Result<CapabilitySet, DispatchError> {
        Ok(self.registry.discover_capabilities(service).await?)
    }

    async fn call_operation(
        &self,
        service: &Service,
        name: &str,
        arguments: Value,
    ) -> Result<Value, DispatchError> {
        Ok(self.registry.call_tool(service, name, arguments).await?)
    }

    async fn check_health(&self, service: &Service) -> Result<(), DispatchError> {
        // A crashed or stopped local process fails here without touching it.
        self.registry.discover_capabilities(service).await?;
        Ok(())
    }
}

/// A2A agents over plain HTTP. Nothing is cached between calls.
pub struct A2aBackend {
    client: A2aClient,
}

impl A2aBackend {
    pub fn new(client: A2aClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceBackend for A2aBackend {
    async fn discover_capabilities(&self, service: &Service) -> Result<CapabilitySet, DispatchError> {
        Ok(CapabilitySet {
            tools: self.client.discover_tools(service).await?,
            ..CapabilitySet::default()
        })
    }

    async fn call_operation(
        &self,
        service: &Service,
        name: &str,
        arguments: Value,
    ) -> Result<Value, DispatchError> {
        self.client.call_tool(service, name, arguments).await
    }

    async fn check_health(&self, service: &Service) -> Result<(), DispatchError> {
        self.client.discover_tools(service).await.map(|_| ())
    }
}
