//! OAuth authorization-code flow.
//!
//! [`OAuthFlowCoordinator`] builds authorization URLs, correlates callbacks
//! through the injected state store, exchanges and refreshes tokens, and
//! persists them through the service store. Nothing here retries; polling
//! for a callback is the caller's business.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::ACCEPT;
use reqwest::{Client as HttpClient, Url};

use super::discovery::OAuthDiscoveryEngine;
use super::errors::OAuthError;
use super::pkce::Pkce;
use super::state::{generate_state, OAuthStateStore, PendingAuthorization};
use super::types::{AuthorizationRequest, TokenResponse, TokenSet};
use crate::config::OAuthConfig;
use crate::mcp_client::AccessTokenSource;
use crate::service::{Service, ServiceStore};

/// Longest token endpoint body kept in an error.
const MAX_ERROR_BODY: usize = 1_000;
/// Refresh windows beyond a week are clamped.
const MAX_REFRESH_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;

pub struct OAuthFlowCoordinator {
    pub(super) store: Arc<dyn ServiceStore>,
    states: Arc<dyn OAuthStateStore>,
    pub(super) discovery: Arc<OAuthDiscoveryEngine>,
    pub(super) http: HttpClient,
    refresh_window: ChronoDuration,
    use_pkce: bool,
}

impl OAuthFlowCoordinator {
    pub fn new(
        store: Arc<dyn ServiceStore>,
        states: Arc<dyn OAuthStateStore>,
        discovery: Arc<OAuthDiscoveryEngine>,
        config: &OAuthConfig,
    ) -> Result<Self, OAuthError> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| OAuthError::Http {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            store,
            states,
            discovery,
            http,
            refresh_window: ChronoDuration::try_seconds(config.refresh_window_secs.clamp(0, MAX_REFRESH_WINDOW_SECS))
                .unwrap_or_default(),
            use_pkce: config.use_pkce,
        })
    }

    async fn service(&self, service_id: &str) -> Result<Service, OAuthError> {
        self.store
            .get_service(service_id)
            .await?
            .ok_or_else(|| OAuthError::ServiceNotFound {
                service: service_id.to_string(),
            })
    }

    // ─── Authorization ───────────────────────────────────────────────────────

    /// Build the URL to send the user's browser to.
    pub async fn initiate_oauth_flow(
        &self,
        service_id: &str,
        redirect_uri: &str,
    ) -> Result<AuthorizationRequest, OAuthError> {
        let service = self.service(service_id).await?;
        let oauth = &service.oauth;
        let authorization_url = oauth.authorization_url.as_deref().ok_or_else(|| {
            OAuthError::MissingAuthorizationUrl {
                service: service_id.to_string(),
            }
        })?;
        let mut url = Url::parse(authorization_url).map_err(|e| OAuthError::InvalidUrl {
            url: authorization_url.to_string(),
            reason: e.to_string(),
        })?;

        let state = generate_state();
        let pkce = self.use_pkce.then(Pkce::generate);

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", oauth.client_id.as_deref().unwrap_or_default())
                .append_pair("redirect_uri", redirect_uri);
            if let Some(scope) = oauth.scope.as_deref().filter(|s| !s.is_empty()) {
                query.append_pair("scope", scope);
            }
            query.append_pair("state", &state);
            if let Some(pkce) = &pkce {
                query
                    .append_pair("code_challenge", &pkce.challenge)
                    .append_pair("code_challenge_method", "S256");
            }
        }

        self.states
            .put(
                &state,
                PendingAuthorization {
                    service_id: service_id.to_string(),
                    redirect_uri: redirect_uri.to_string(),
                    code_verifier: pkce.map(|p| p.verifier),
                },
            )
            .await;

        tracing::info!(service = service_id, "oauth flow initiated");
        Ok(AuthorizationRequest {
            authorization_url: url.into(),
            state,
        })
    }

    /// Finish a flow: consume the state and exchange the code.
    pub async fn handle_oauth_callback(&self, code: &str, state: &str) -> Result<TokenSet, OAuthError> {
        let pending = self.states.take(state).await.ok_or(OAuthError::InvalidState)?;
        let service = self.service(&pending.service_id).await?;
        let token_url = token_url_of(&service)?;

        let mut form = client_credentials(&service);
        form.push(("grant_type", "authorization_code".into()));
        form.push(("code", code.to_string()));
        form.push(("redirect_uri", pending.redirect_uri.clone()));
        if let Some(verifier) = pending.code_verifier {
            form.push(("code_verifier", verifier));
        }

        let tokens = self.request_tokens(token_url, &form).await?;
        self.persist(&service.id, &tokens).await?;
        tracing::info!(service = %service.id, "oauth authorization completed");
        Ok(tokens)
    }

    // ─── Refresh ─────────────────────────────────────────────────────────────

    /// Refresh tokens. A provider that does not rotate refresh tokens leaves
    /// the given one in place.
    pub async fn refresh_oauth_token(
        &self,
        service_id: &str,
        refresh_token: &str,
    ) -> Result<TokenSet, OAuthError> {
        let service = self.service(service_id).await?;
        let token_url = token_url_of(&service)?;

        let mut form = client_credentials(&service);
        form.push(("grant_type", "refresh_token".into()));
        form.push(("refresh_token", refresh_token.to_string()));

        let mut tokens = self.request_tokens(token_url, &form).await?;
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_string());
        }
        self.persist(service_id, &tokens).await?;
        tracing::debug!(service = service_id, expires_at = ?tokens.expires_at, "oauth token refreshed");
        Ok(tokens)
    }

    /// A token that is safe to use now, refreshing it first when it is
    /// close to expiry or its expiry is unknown.
    ///
    /// `None` when nothing is stored or a needed refresh is impossible.
    pub async fn get_valid_access_token(&self, service_id: &str) -> Option<String> {
        let service = match self.store.get_service(service_id).await {
            Ok(Some(service)) => service,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(service = service_id, error = %e, "could not read stored tokens");
                return None;
            }
        };
        let access_token = service.oauth.access_token?;

        let fresh = service
            .oauth
            .expires_at
            .is_some_and(|expiry| expiry - Utc::now() > self.refresh_window);
        if fresh {
            return Some(access_token);
        }

        let Some(refresh_token) = service.oauth.refresh_token else {
            tracing::debug!(service = service_id, "token near expiry and no refresh token");
            return None;
        };
        match self.refresh_oauth_token(service_id, &refresh_token).await {
            Ok(tokens) => Some(tokens.access_token),
            Err(e) => {
                tracing::warn!(service = service_id, error = %e, "token refresh failed");
                None
            }
        }
    }

    // ─── Token endpoint ──────────────────────────────────────────────────────

    async fn request_tokens(
        &self,
        token_url: &str,
        form: &[(&str, String)],
    ) -> Result<TokenSet, OAuthError> {
        let http_error = |reason: String| OAuthError::Http {
            url: token_url.to_string(),
            reason,
        };

        let response = self
            .http
            .post(token_url)
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| http_error(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| http_error(e.to_string()))?;
        if !status.is_success() {
            return Err(OAuthError::TokenExchange {
                status: status.as_u16(),
                body: truncate(body),
            });
        }

        // Some providers report errors with a 200 and an `error` field.
        let value: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| http_error(format!("invalid token response: {e}")))?;
        if value.get("error").is_some() {
            return Err(OAuthError::TokenExchange {
                status: status.as_u16(),
                body: truncate(body),
            });
        }
        let token: TokenResponse =
            serde_json::from_value(value).map_err(|e| http_error(format!("invalid token response: {e}")))?;

        Ok(TokenSet {
            expires_at: token.expires_in.and_then(expiry_from_now),
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            token_type: token.token_type,
            scope: token.scope,
        })
    }

    async fn persist(&self, service_id: &str, tokens: &TokenSet) -> Result<(), OAuthError> {
        self.store
            .update_oauth_tokens(
                service_id,
                &tokens.access_token,
                tokens.refresh_token.as_deref(),
                tokens.expires_at,
            )
            .await?;
        Ok(())
    }
}

fn token_url_of(service: &Service) -> Result<&str, OAuthError> {
    service
        .oauth
        .token_url
        .as_deref()
        .ok_or_else(|| OAuthError::MissingTokenUrl {
            service: service.id.clone(),
        })
}

/// `client_id` always, `client_secret` when the client has one.
fn client_credentials(service: &Service) -> Vec<(&'static str, String)> {
    let mut form = vec![(
        "client_id",
        service.oauth.client_id.clone().unwrap_or_default(),
    )];
    if let Some(secret) = &service.oauth.client_secret {
        form.push(("client_secret", secret.clone()));
    }
    form
}

/// Absolute expiry for `expires_in` seconds. Values chrono cannot represent
/// leave the expiry unknown, which makes the next use refresh.
fn expiry_from_now(secs: i64) -> Option<DateTime<Utc>> {
    let expires_at = ChronoDuration::try_seconds(secs).and_then(|delta| Utc::now().checked_add_signed(delta));
    if expires_at.is_none() {
        tracing::warn!(expires_in = secs, "token expiry out of range, treating as unknown");
    }
    expires_at
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[async_trait]
impl AccessTokenSource for OAuthFlowCoordinator {
    async fn access_token(&self, service_id: &str) -> Option<String> {
        self.get_valid_access_token(service_id).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
