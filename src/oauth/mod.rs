//! OAuth for remote services.
//!
//! - Discovery of authorization requirements and endpoints
//! - Authorization-code flow with optional PKCE
//! - Token refresh and the "valid token now" query
//! - Automatic client registration

pub mod discovery;
pub mod errors;
pub mod flow;
pub mod pkce;
pub mod registration;
pub mod state;
pub mod types;

pub use discovery::OAuthDiscoveryEngine;
pub use errors::OAuthError;
pub use flow::OAuthFlowCoordinator;
pub use state::{InMemoryStateStore, OAuthStateStore, PendingAuthorization};
pub use types::{
    AuthorizationRequest, OAuthDiscovery, RegistrationConfig, RegistrationOutcome, TokenSet,
};
