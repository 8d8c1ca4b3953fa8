//! OAuth requirement discovery.
//!
//! Given nothing but a URL, works out whether it sits behind OAuth and where
//! the authorization and token endpoints are. The cascade, stopping as soon
//! as a step resolves:
//! 1. The protected-resource document on the URL's origin
//! 2. The first authorization server it names, via its metadata document
//! 3. The authorization-server document on the URL's own origin
//! 4. The `WWW-Authenticate` challenge of the URL itself (GET, then a
//!    JSON-RPC POST)
//! 5. Known providers, whose canonical endpoints replace discovered ones
//!
//! Network failures are expected here (most servers have no well-known
//! documents) and are logged at debug level, never returned. Every request
//! has a timeout and one discovery run issues at most `max_probes` of them.

use std::sync::OnceLock;

use regex::Regex;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Client as HttpClient, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::json;

use super::errors::OAuthError;
use super::types::{AuthorizationServerMetadata, OAuthDiscovery, ProtectedResourceMetadata};
use crate::config::{KnownProvider, OAuthConfig};

// ─── Constants ───────────────────────────────────────────────────────────────

pub const PROTECTED_RESOURCE_PATH: &str = "/.well-known/oauth-protected-resource";
pub const AUTHORIZATION_SERVER_PATH: &str = "/.well-known/oauth-authorization-server";

/// Providers recognized without configuration.
pub fn builtin_providers() -> Vec<KnownProvider> {
    vec![KnownProvider {
        name: "github".into(),
        hosts: vec!["github.com".into()],
        authorization_url: "https://github.com/login/oauth/authorize".into(),
        token_url: "https://github.com/login/oauth/access_token".into(),
        registration_url: Some("https://github.com/settings/applications/new".into()),
    }]
}

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s"'<>,]+"#).unwrap())
}

fn resource_metadata_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"resource_metadata="([^"]+)""#).unwrap())
}

// ─── URL helpers ─────────────────────────────────────────────────────────────

/// `scheme://host[:port]` of a URL.
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Metadata document URL for an authorization server (RFC 8414 path
/// insertion). A URL that already points at the document is kept.
pub fn authorization_server_metadata_url(server: &str) -> Option<String> {
    if server.contains(AUTHORIZATION_SERVER_PATH) {
        return Some(server.to_string());
    }
    let url = Url::parse(server).ok()?;
    let path = url.path().trim_end_matches('/');
    Some(format!("{}{AUTHORIZATION_SERVER_PATH}{path}", origin_of(&url)))
}

/// Whether a `WWW-Authenticate` value asks for OAuth.
pub fn is_oauth_challenge(header: &str) -> bool {
    let trimmed = header.trim_start();
    trimmed
        .get(..6)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("bearer"))
        || header.to_ascii_lowercase().contains("oauth")
}

/// Every URL embedded in a challenge, in order.
pub fn challenge_urls(header: &str) -> Vec<String> {
    url_pattern()
        .find_iter(header)
        .map(|m| m.as_str().trim_end_matches(['.', ';', ')']).to_string())
        .collect()
}

fn resource_metadata_url(header: &str) -> Option<String> {
    resource_metadata_pattern()
        .captures(header)
        .map(|c| c[1].to_string())
}

// ─── Probe budget ────────────────────────────────────────────────────────────

/// Counts requests so one discovery run stays bounded.
struct Probe<'a> {
    http: &'a HttpClient,
    remaining: usize,
}

impl Probe<'_> {
    async fn send(&mut self, request: RequestBuilder, what: &str) -> Option<Response> {
        if self.remaining == 0 {
            tracing::debug!(probe = what, "discovery probe budget exhausted");
            return None;
        }
        self.remaining -= 1;
        match request.send().await {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::debug!(probe = what, error = %e, "discovery probe failed");
                None
            }
        }
    }

    /// GET a JSON document; anything but a parseable 2xx body is `None`.
    async fn get_json<T: DeserializeOwned>(&mut self, url: &str) -> Option<T> {
        let response = self
            .send(self.http.get(url).header(ACCEPT, "application/json"), url)
            .await?;
        if !response.status().is_success() {
            tracing::debug!(url, status = %response.status(), "no metadata document");
            return None;
        }
        match response.json::<T>().await {
            Ok(doc) => Some(doc),
            Err(e) => {
                tracing::debug!(url, error = %e, "unparseable metadata document");
                None
            }
        }
    }
}

fn challenge_of(response: &Response) -> Option<String> {
    response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct OAuthDiscoveryEngine {
    http: HttpClient,
    max_probes: usize,
    providers: Vec<KnownProvider>,
}

impl OAuthDiscoveryEngine {
    pub fn new(config: &OAuthConfig) -> Result<Self, OAuthError> {
        let http = HttpClient::builder()
            .timeout(config.probe_timeout())
            .connect_timeout(config.probe_timeout())
            .build()
            .map_err(|e| OAuthError::Http {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        let mut providers = builtin_providers();
        providers.extend(config.known_providers.iter().cloned());
        Ok(Self {
            http,
            max_probes: config.max_probes,
            providers,
        })
    }

    pub fn providers(&self) -> &[KnownProvider] {
        &self.providers
    }

    /// The known provider serving a URL's host, if any.
    pub fn provider_for(&self, url: &str) -> Option<&KnownProvider> {
        let host = Url::parse(url).ok()?.host_str()?.to_ascii_lowercase();
        self.providers
            .iter()
            .find(|p| p.hosts.iter().any(|h| h.eq_ignore_ascii_case(&host)))
    }

    fn probe(&self) -> Probe<'_> {
        Probe {
            http: &self.http,
            remaining: self.max_probes,
        }
    }

    /// Run the discovery cascade against `url`.
    pub async fn discover(&self, url: &str) -> OAuthDiscovery {
        let target = match Url::parse(url) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!(url, error = %e, "cannot discover OAuth for an invalid URL");
                return OAuthDiscovery::not_required();
            }
        };
        let origin = origin_of(&target);
        let mut probe = self.probe();
        let mut result = OAuthDiscovery::default();

        // Steps 1 and 2.
        let resource_url = format!("{origin}{PROTECTED_RESOURCE_PATH}");
        let mut found_metadata = self
            .follow_protected_resource(&mut probe, &resource_url, &mut result)
            .await;

        // Step 3.
        if !found_metadata {
            let server_url = format!("{origin}{AUTHORIZATION_SERVER_PATH}");
            if let Some(metadata) = probe.get_json::<AuthorizationServerMetadata>(&server_url).await {
                found_metadata = apply_server_metadata(&mut result, metadata);
            }
        }

        // Step 4.
        if !found_metadata {
            self.inspect_challenge(&mut probe, url, &mut result).await;
        }

        // Step 5.
        self.apply_known_provider(&mut result);

        tracing::debug!(
            url,
            required = result.required,
            authorization_url = ?result.authorization_url,
            token_url = ?result.token_url,
            probes = self.max_probes - probe.remaining,
            "oauth discovery finished"
        );
        result
    }

    /// Fetch a protected-resource document and the metadata of its first
    /// authorization server. Returns whether the document existed.
    async fn follow_protected_resource(
        &self,
        probe: &mut Probe<'_>,
        resource_url: &str,
        result: &mut OAuthDiscovery,
    ) -> bool {
        let Some(resource) = probe.get_json::<ProtectedResourceMetadata>(resource_url).await else {
            return false;
        };
        result.required = true;
        result.resource_name = resource.resource_name.or(resource.resource);
        result.scopes_supported = resource.scopes_supported;
        result.bearer_methods_supported = resource.bearer_methods_supported;

        let Some(server) = resource
            .authorization_servers
            .and_then(|servers| servers.into_iter().next())
        else {
            return true;
        };
        result.issuer = Some(server.clone());

        if let Some(metadata_url) = authorization_server_metadata_url(&server) {
            if let Some(metadata) = probe.get_json::<AuthorizationServerMetadata>(&metadata_url).await {
                apply_server_metadata(result, metadata);
            }
        }
        true
    }

    /// Look for an OAuth challenge on the URL itself.
    async fn inspect_challenge(&self, probe: &mut Probe<'_>, url: &str, result: &mut OAuthDiscovery) {
        let mut challenge = match probe.send(self.http.get(url), url).await {
            Some(response) => challenge_of(&response),
            None => None,
        };

        if !challenge.as_deref().is_some_and(is_oauth_challenge) {
            let envelope = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}});
            let request = self
                .http
                .post(url)
                .header(ACCEPT, "application/json, text/event-stream")
                .json(&envelope);
            if let Some(response) = probe.send(request, url).await {
                challenge = challenge_of(&response).or(challenge);
            }
        }

        let Some(challenge) = challenge.filter(|c| is_oauth_challenge(c)) else {
            return;
        };
        tracing::debug!(url, challenge = %challenge, "oauth challenge found");
        result.required = true;

        let metadata_url = resource_metadata_url(&challenge);
        if let Some(metadata_url) = &metadata_url {
            self.follow_protected_resource(probe, metadata_url, result).await;
        }

        if result.authorization_url.is_none() {
            result.authorization_url = challenge_urls(&challenge)
                .into_iter()
                .find(|u| Some(u) != metadata_url.as_ref());
        }
    }

    fn apply_known_provider(&self, result: &mut OAuthDiscovery) {
        let candidates = [
            result.issuer.as_deref(),
            result.authorization_url.as_deref(),
            result.token_url.as_deref(),
        ];
        let Some(provider) = candidates.into_iter().flatten().find_map(|u| self.provider_for(u)) else {
            return;
        };
        tracing::debug!(provider = %provider.name, "known oauth provider");
        result.required = true;
        result.provider = Some(provider.name.clone());
        result.authorization_url = Some(provider.authorization_url.clone());
        result.token_url = Some(provider.token_url.clone());
    }

    /// Authorization-server metadata for a service URL: from the server
    /// named by its protected-resource document, else from its own origin.
    pub async fn authorization_server_metadata(&self, url: &str) -> Option<AuthorizationServerMetadata> {
        let target = Url::parse(url).ok()?;
        let origin = origin_of(&target);
        let mut probe = self.probe();

        let resource_url = format!("{origin}{PROTECTED_RESOURCE_PATH}");
        if let Some(resource) = probe.get_json::<ProtectedResourceMetadata>(&resource_url).await {
            if let Some(server) = resource.authorization_servers.and_then(|s| s.into_iter().next()) {
                if let Some(metadata_url) = authorization_server_metadata_url(&server) {
                    if let Some(mut metadata) = probe.get_json::<AuthorizationServerMetadata>(&metadata_url).await {
                        metadata.issuer.get_or_insert(server);
                        return Some(metadata);
                    }
                }
            }
        }

        probe
            .get_json::<AuthorizationServerMetadata>(&format!("{origin}{AUTHORIZATION_SERVER_PATH}"))
            .await
    }
}

/// Copy endpoint fields. Returns whether the document named any endpoint.
fn apply_server_metadata(result: &mut OAuthDiscovery, metadata: AuthorizationServerMetadata) -> bool {
    let has_endpoints = metadata.authorization_endpoint.is_some() || metadata.token_endpoint.is_some();
    if metadata.issuer.is_some() {
        result.issuer = metadata.issuer;
    }
    if metadata.authorization_endpoint.is_some() {
        result.authorization_url = metadata.authorization_endpoint;
    }
    if metadata.token_endpoint.is_some() {
        result.token_url = metadata.token_endpoint;
    }
    if result.scopes_supported.is_none() {
        result.scopes_supported = metadata.scopes_supported;
    }
    result.registration_endpoint = metadata.registration_endpoint;
    if has_endpoints {
        result.required = true;
    }
    has_endpoints
}

// ─── Tests ───────────────────────────────────────────────────────────────────
