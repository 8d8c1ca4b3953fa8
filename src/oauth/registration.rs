//! Automatic OAuth client registration.
//!
//! Tries dynamic client registration (RFC 7591) at the endpoint the
//! authorization server advertises, then a handful of conventional paths on
//! its origin. When both fail the outcome points at the provider's manual
//! registration page, if one is known.

use reqwest::header::ACCEPT;
use reqwest::Url;

use super::discovery::origin_of;
use super::flow::OAuthFlowCoordinator;
use super::types::{
    AuthorizationServerMetadata, ClientRegistrationRequest, ClientRegistrationResponse,
    RegistrationConfig, RegistrationOutcome,
};

/// Registration paths tried on the authorization server's origin.
const CONVENTIONAL_PATHS: &[&str] = &["/register", "/oauth/register", "/oauth2/register", "/api/oauth/register"];

const MIN_CREDENTIAL_LEN: usize = 8;

const PLACEHOLDER_MARKERS: &[&str] = &[
    "your_client",
    "your-client",
    "yourclient",
    "client_id_here",
    "placeholder",
    "changeme",
    "change_me",
    "example",
    "dummy",
    "xxxx",
    "${",
    "<",
];

/// Whether a returned credential looks real rather than a template value.
pub fn is_plausible_credential(value: &str) -> bool {
    let value = value.trim();
    if value.len() < MIN_CREDENTIAL_LEN {
        return false;
    }
    let lower = value.to_ascii_lowercase();
    if PLACEHOLDER_MARKERS.iter().any(|m| lower.contains(m)) {
        return false;
    }
    // "aaaaaaaa" and friends.
    let mut chars = lower.chars();
    let first = chars.next();
    !chars.all(|c| Some(c) == first)
}

impl OAuthFlowCoordinator {
    /// Register an OAuth client for the service at `service_url`.
    ///
    /// Never fails outright: every failure mode is an unsuccessful outcome
    /// with a message.
    pub async fn auto_register_oauth_app(
        &self,
        service_url: &str,
        config: &RegistrationConfig,
    ) -> RegistrationOutcome {
        let Ok(target) = Url::parse(service_url) else {
            return RegistrationOutcome {
                message: Some(format!("invalid service URL '{service_url}'")),
                ..RegistrationOutcome::default()
            };
        };
        let metadata = self
            .discovery
            .authorization_server_metadata(service_url)
            .await
            .unwrap_or_default();
        let request = ClientRegistrationRequest {
            client_name: config.client_name.clone(),
            redirect_uris: vec![config.redirect_uri.clone()],
            grant_types: vec!["authorization_code".into(), "refresh_token".into()],
            response_types: vec!["code".into()],
            token_endpoint_auth_method: "client_secret_post".into(),
            scope: config.scope.clone(),
        };

        let mut candidates = Vec::new();
        if let Some(endpoint) = &metadata.registration_endpoint {
            candidates.push(endpoint.clone());
        }
        let server_origin = server_origin(&metadata).unwrap_or_else(|| origin_of(&target));
        candidates.extend(CONVENTIONAL_PATHS.iter().map(|path| format!("{server_origin}{path}")));
        candidates.dedup();

        for endpoint in &candidates {
            if let Some(response) = self.register_at(endpoint, &request).await {
                tracing::info!(endpoint = %endpoint, "oauth client registered");
                return RegistrationOutcome {
                    success: true,
                    client_id: response.client_id,
                    client_secret: response.client_secret,
                    authorization_url: metadata.authorization_endpoint.clone(),
                    token_url: metadata.token_endpoint.clone(),
                    registration_endpoint: Some(endpoint.clone()),
                    ..RegistrationOutcome::default()
                };
            }
        }

        let manual = [
            metadata.authorization_endpoint.as_deref(),
            metadata.issuer.as_deref(),
            Some(service_url),
        ]
        .into_iter()
        .flatten()
        .find_map(|url| self.discovery.provider_for(url))
        .and_then(|provider| provider.registration_url.clone());

        tracing::info!(url = service_url, manual = ?manual, "automatic oauth registration failed");
        RegistrationOutcome {
            success: false,
            authorization_url: metadata.authorization_endpoint,
            token_url: metadata.token_endpoint,
            message: Some(match &manual {
                Some(url) => format!("automatic registration is not supported; register an app at {url}"),
                None => "automatic registration is not supported by this server".to_string(),
            }),
            manual_registration_url: manual,
            ..RegistrationOutcome::default()
        }
    }

    /// One registration attempt. `None` on any failure or implausible reply.
    async fn register_at(
        &self,
        endpoint: &str,
        request: &ClientRegistrationRequest,
    ) -> Option<ClientRegistrationResponse> {
        let response = match self
            .http
            .post(endpoint)
            .header(ACCEPT, "application/json")
            .json(request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(endpoint, error = %e, "registration request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::debug!(endpoint, status = %response.status(), "registration rejected");
            return None;
        }
        let body: ClientRegistrationResponse = response.json().await.ok()?;

        let client_id = body.client_id.as_deref()?;
        let secret_ok = body.client_secret.as_deref().map_or(true, is_plausible_credential);
        if !is_plausible_credential(client_id) || !secret_ok {
            tracing::warn!(endpoint, "registration returned placeholder credentials");
            return None;
        }
        Some(body)
    }
}

fn server_origin(metadata: &AuthorizationServerMetadata) -> Option<String> {
    [metadata.issuer.as_deref(), metadata.authorization_endpoint.as_deref()]
        .into_iter()
        .flatten()
        .find_map(|url| Url::parse(url).ok())
        .map(|url| origin_of(&url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KnownProvider, OAuthConfig};
    use crate::oauth::discovery::OAuthDiscoveryEngine;
    use crate::oauth::state::InMemoryStateStore;
    use crate::service::InMemoryServiceStore;
    use crate::test_support::{bind, serve, serve_on};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    fn coordinator(config: OAuthConfig) -> OAuthFlowCoordinator {
        OAuthFlowCoordinator::new(
            Arc::new(InMemoryServiceStore::new()),
            Arc::new(InMemoryStateStore::new(config.state_ttl())),
            Arc::new(OAuthDiscoveryEngine::new(&config).unwrap()),
            &config,
        )
        .unwrap()
    }

    fn registration() -> RegistrationConfig {
        RegistrationConfig {
            client_name: "Agent Deck".into(),
            redirect_uri: "http://localhost:3000/callback".into(),
            scope: Some("files:read".into()),
        }
    }

    #[test]
    fn test_placeholder_credentials_are_implausible() {
        assert!(is_plausible_credential("a1b2c3d4e5f6"));
        assert!(!is_plausible_credential("short"));
        assert!(!is_plausible_credential("your_client_id"));
        assert!(!is_plausible_credential("PLACEHOLDER-SECRET"));
        assert!(!is_plausible_credential("xxxxxxxxxx"));
        assert!(!is_plausible_credential("00000000"));
    }

    #[tokio::test]
    async fn test_dynamic_registration_at_advertised_endpoint() {
        let (listener, base) = bind().await;
        let seen: Arc<Mutex<Option<Value>>> = Arc::default();
        let recorder = seen.clone();
        let metadata = json!({
            "issuer": base.clone(),
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/token"),
            "registration_endpoint": format!("{base}/connect/register"),
        });
        let router = Router::new()
            .route(
                "/.well-known/oauth-authorization-server",
                get(move || async move { Json(metadata) }),
            )
            .route(
                "/connect/register",
                post(move |Json(body): Json<Value>| {
                    let recorder = recorder.clone();
                    async move {
                        *recorder.lock().unwrap() = Some(body);
                        (
                            StatusCode::CREATED,
                            Json(json!({"client_id": "deck-3f9a2c71", "client_secret": "s3cr3t-9d8e7f"})),
                        )
                    }
                }),
            );
        serve_on(listener, router);

        let outcome = coordinator(OAuthConfig::default())
            .auto_register_oauth_app(&format!("{base}/mcp"), &registration())
            .await;
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.client_id.as_deref(), Some("deck-3f9a2c71"));
        assert_eq!(outcome.client_secret.as_deref(), Some("s3cr3t-9d8e7f"));
        assert_eq!(outcome.authorization_url, Some(format!("{base}/authorize")));
        assert_eq!(outcome.registration_endpoint, Some(format!("{base}/connect/register")));

        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body["client_name"], "Agent Deck");
        assert_eq!(body["redirect_uris"], json!(["http://localhost:3000/callback"]));
        assert_eq!(body["grant_types"], json!(["authorization_code", "refresh_token"]));
    }

    #[tokio::test]
    async fn test_conventional_path_fallback() {
        let router = Router::new().route(
            "/oauth/register",
            post(|| async { Json(json!({"client_id": "fallback-client-42"})) }),
        );
        let base = serve(router).await;

        let outcome = coordinator(OAuthConfig::default())
            .auto_register_oauth_app(&format!("{base}/mcp"), &registration())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.client_id.as_deref(), Some("fallback-client-42"));
        assert_eq!(outcome.client_secret, None);
        assert_eq!(outcome.registration_endpoint, Some(format!("{base}/oauth/register")));
    }

    #[tokio::test]
    async fn test_placeholder_reply_is_rejected() {
        let router = Router::new().route(
            "/register",
            post(|| async { Json(json!({"client_id": "your_client_id", "client_secret": "your_client_secret"})) }),
        );
        let base = serve(router).await;

        let outcome = coordinator(OAuthConfig::default())
            .auto_register_oauth_app(&base, &registration())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.client_id, None);
        assert!(outcome.message.is_some());
    }

    #[tokio::test]
    async fn test_failure_points_at_manual_registration() {
        let base = serve(Router::new()).await;
        let config = OAuthConfig {
            known_providers: vec![KnownProvider {
                name: "local".into(),
                hosts: vec!["127.0.0.1".into()],
                authorization_url: format!("{base}/authorize"),
                token_url: format!("{base}/token"),
                registration_url: Some("https://provider.example.com/apps/new".into()),
            }],
            ..OAuthConfig::default()
        };

        let outcome = coordinator(config)
            .auto_register_oauth_app(&format!("{base}/mcp"), &registration())
            .await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.manual_registration_url.as_deref(),
            Some("https://provider.example.com/apps/new")
        );
    }

    #[tokio::test]
    async fn test_invalid_url_is_unsuccessful() {
        let outcome = coordinator(OAuthConfig::default())
            .auto_register_oauth_app("not a url", &registration())
            .await;
        assert!(!outcome.success);
    }
}
