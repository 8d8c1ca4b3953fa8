//! OAuth error types.

use thiserror::Error;

use crate::service::StoreError;

#[derive(Debug, Error)]
pub enum OAuthError {
    /// Unknown, already consumed, or expired authorization state.
    #[error("invalid or expired OAuth state")]
    InvalidState,

    /// The token endpoint answered with a non-2xx status.
    #[error("token exchange failed with HTTP {status}: {body}")]
    TokenExchange { status: u16, body: String },

    #[error("service '{service}' has no authorization URL configured")]
    MissingAuthorizationUrl { service: String },

    #[error("service '{service}' has no token URL configured")]
    MissingTokenUrl { service: String },

    #[error("service '{service}' has no refresh token")]
    MissingRefreshToken { service: String },

    #[error("service not found: '{service}'")]
    ServiceNotFound { service: String },

    /// Request failed before a response arrived, or the body was unreadable.
    #[error("OAuth request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
