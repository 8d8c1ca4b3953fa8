//! Connection layer configuration.
//!
//! Reads `agent-deck.yaml` and resolves environment variables. Every field
//! has a default, so an empty file (or no file at all) is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// File name searched for when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "agent-deck.yaml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "AGENT_DECK_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find {CONFIG_FILE_NAME}")]
    NotFound,

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration (mirrors `agent-deck.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub mcp: McpConfig,
    pub oauth: OAuthConfig,
    pub a2a: A2aConfig,
    pub logging: LoggingConfig,
}

/// MCP client identity and timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    /// Name announced as `clientInfo.name` during initialize.
    pub client_name: String,
    pub client_version: String,
    pub protocol_version: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Handshake timeout. Local servers that import heavy frameworks at
    /// startup need a generous value.
    pub init_timeout_ms: u64,
    /// Grace period between closing a local server's stdin and killing it.
    pub shutdown_timeout_ms: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            client_name: "agent-deck".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            protocol_version: "2025-03-26".into(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            init_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl McpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// A provider whose OAuth endpoints are known ahead of time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KnownProvider {
    pub name: String,
    /// Host names (no scheme) that identify the provider's authorization server.
    pub hosts: Vec<String>,
    pub authorization_url: String,
    pub token_url: String,
    /// Page where a human can register an OAuth app by hand.
    #[serde(default)]
    pub registration_url: Option<String>,
}

/// OAuth discovery and flow settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Timeout for each discovery request.
    pub probe_timeout_ms: u64,
    /// Most HTTP requests a single discovery run may issue.
    pub max_probes: usize,
    /// How long a pending authorization state stays valid.
    pub state_ttl_secs: u64,
    /// Tokens this close to expiry are refreshed before use.
    pub refresh_window_secs: i64,
    /// Add PKCE (S256) to authorization requests.
    pub use_pkce: bool,
    /// Timeout for token and registration requests.
    pub request_timeout_ms: u64,
    /// Appended to the built-in provider list.
    pub known_providers: Vec<KnownProvider>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 5_000,
            max_probes: 8,
            state_ttl_secs: 600,
            refresh_window_secs: 300,
            use_pkce: false,
            request_timeout_ms: 10_000,
            known_providers: Vec::new(),
        }
    }
}

impl OAuthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// A2A agent HTTP settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct A2aConfig {
    pub request_timeout_ms: u64,
}

impl Default for A2aConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
        }
    }
}

impl A2aConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Where and how much to log.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` overrides it.
    pub filter: String,
    /// Log file path. Logs go to stderr when unset.
    pub file: Option<String>,
    /// Rotated files kept next to `file`.
    pub keep_files: u32,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "agent_deck_connect=info,warn".into(),
            file: None,
            keep_files: 3,
            json: false,
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// `AGENT_DECK_CONFIG` wins when it names an existing file; otherwise the
/// search walks upward from `start`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points at a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(ConfigError::NotFound)
}

/// Load and parse a config file.
///
/// `${VAR_NAME}` and `${VAR_NAME:-default}` are interpolated before parsing.
pub fn load_config(path: &Path) -> Result<ConnectConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw)
}

/// Parse config text. Empty text yields the defaults.
pub fn parse_config(raw: &str) -> Result<ConnectConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(ConnectConfig::default());
    }
    let mut config: ConnectConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
    if let Some(file) = config.logging.file.take() {
        config.logging.file = Some(expand_tilde(&file));
    }
    Ok(config)
}

/// Find and load the config, falling back to defaults when no file exists.
pub fn load_or_default(start: &Path) -> Result<ConnectConfig, ConfigError> {
    match find_config_path(start) {
        Ok(path) => load_config(&path),
        Err(ConfigError::NotFound) => Ok(ConnectConfig::default()),
        Err(e) => Err(e),
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                expr.push(c);
            }
            result.push_str(&resolve_var_expr(&expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
