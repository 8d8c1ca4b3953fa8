//! Dispatch error types.

use thiserror::Error;

use crate::mcp_client::McpError;
use crate::oauth::{OAuthDiscovery, OAuthError};
use crate::service::{ServiceKind, StoreError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("service '{service}' has unsupported kind '{kind}'")]
    UnsupportedServiceKind { service: String, kind: ServiceKind },

    /// The operation exists, but not for this kind of service.
    #[error("'{operation}' is not supported by {kind} service '{service}'")]
    UnsupportedOperation {
        service: String,
        kind: ServiceKind,
        operation: &'static str,
    },

    #[error("service not found: '{service}'")]
    ServiceNotFound { service: String },

    /// The service failed or came back empty and discovery found an OAuth
    /// requirement. The findings are already stored on the service.
    #[error("service '{service}' requires OAuth authorization")]
    AuthorizationRequired {
        service: String,
        discovery: Box<OAuthDiscovery>,
    },

    #[error("Service not found in active deck")]
    NotInActiveDeck { service: String },

    #[error("a2a service '{service}' failed: {reason}")]
    A2a { service: String, reason: String },

    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    OAuth(#[from] OAuthError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    pub(crate) fn a2a(service: &str, reason: impl Into<String>) -> Self {
        DispatchError::A2a {
            service: service.to_string(),
            reason: reason.into(),
        }
    }
}
