//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.adblocks/config.json`) and environment.
//! Credentials are never compiled in: BING_ACCOUNT_KEY and HIPCHAT_TOKEN override the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Bing image search credentials and endpoint.
    #[serde(default)]
    pub bing: BingConfig,

    /// HipChat credentials and endpoint.
    #[serde(default)]
    pub hipchat: HipChatConfig,

    /// Outbound client timeouts and inbound body limit.
    #[serde(default)]
    pub http: HttpConfig,
}

/// Listener settings. Command-line transport flags take precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// When absent and no flag is given, FastCGI over stdio is used.
    #[serde(default)]
    pub transport: Option<Transport>,
}

/// How the relay is exposed. Exactly one is active per process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum Transport {
    /// Plain HTTP listener, e.g. `0.0.0.0:8000`.
    Http { addr: String },
    /// FastCGI over a TCP listener.
    FcgiTcp { addr: String },
    /// FastCGI over a Unix-domain socket, e.g. `/tmp/adblocks.sock`.
    FcgiUnix { path: PathBuf },
    /// FastCGI on stdin/stdout (spawned by the front-end web server).
    #[default]
    FcgiStdio,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Http { addr } => write!(f, "http://{}", addr),
            Transport::FcgiTcp { addr } => write!(f, "fcgi+tcp://{}", addr),
            Transport::FcgiUnix { path } => write!(f, "fcgi+unix://{}", path.display()),
            Transport::FcgiStdio => f.write_str("fcgi+stdio"),
        }
    }
}

/// Bing image search settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BingConfig {
    /// Subscription key. Overridden by BING_ACCOUNT_KEY env when set.
    pub account_key: Option<String>,
    /// API base (default https://api.bing.microsoft.com/v7.0).
    pub base_url: Option<String>,
}

/// HipChat settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HipChatConfig {
    /// Room notification token. Overridden by HIPCHAT_TOKEN env when set.
    pub token: Option<String>,
    /// API base (default https://api.hipchat.com/v2); set for self-hosted HipChat Server.
    pub base_url: Option<String>,
}

/// Timeouts for the outbound client and the inbound body size limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    /// Whole-request timeout for image search and notification calls (default 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// TCP connect timeout for outbound calls (default 10).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Largest inbound webhook body accepted (default 1 MiB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Credentials required to serve the relay.
#[derive(Clone)]
pub struct Credentials {
    pub bing_account_key: String,
    pub hipchat_token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("bing_account_key", &"<redacted>")
            .field("hipchat_token", &"<redacted>")
            .finish()
    }
}

/// Env value wins over the configured one; blank values count as unset.
fn pick_secret(env_value: Option<String>, configured: Option<&str>) -> Option<String> {
    env_value
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            configured
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the Bing account key: env BING_ACCOUNT_KEY overrides config.
pub fn resolve_bing_account_key(config: &Config) -> Option<String> {
    pick_secret(
        std::env::var("BING_ACCOUNT_KEY").ok(),
        config.bing.account_key.as_deref(),
    )
}

/// Resolve the HipChat token: env HIPCHAT_TOKEN overrides config.
pub fn resolve_hipchat_token(config: &Config) -> Option<String> {
    pick_secret(
        std::env::var("HIPCHAT_TOKEN").ok(),
        config.hipchat.token.as_deref(),
    )
}

/// Both credentials, or an error naming the one that is missing.
pub fn resolve_credentials(config: &Config) -> Result<Credentials> {
    let bing_account_key = resolve_bing_account_key(config).context(
        "bing account key not configured (set bing.accountKey or BING_ACCOUNT_KEY)",
    )?;
    let hipchat_token = resolve_hipchat_token(config)
        .context("hipchat token not configured (set hipchat.token or HIPCHAT_TOKEN)")?;
    Ok(Credentials {
        bing_account_key,
        hipchat_token,
    })
}

/// Build the transport from the `--local` / `--tcp` / `--unix` flags.
/// Blank values count as unset; more than one set is a configuration error.
pub fn transport_from_flags(
    local: Option<String>,
    tcp: Option<String>,
    unix: Option<PathBuf>,
) -> Result<Option<Transport>> {
    let local = local.filter(|s| !s.trim().is_empty());
    let tcp = tcp.filter(|s| !s.trim().is_empty());
    let unix = unix.filter(|p| !p.as_os_str().is_empty());

    let mut chosen = Vec::new();
    if let Some(addr) = local {
        chosen.push(Transport::Http { addr });
    }
    if let Some(addr) = tcp {
        chosen.push(Transport::FcgiTcp { addr });
    }
    if let Some(path) = unix {
        chosen.push(Transport::FcgiUnix { path });
    }
    if chosen.len() > 1 {
        let names: Vec<String> = chosen.iter().map(|t| t.to_string()).collect();
        anyhow::bail!(
            "only one of --local, --tcp, --unix may be given (got {})",
            names.join(", ")
        );
    }
    Ok(chosen.pop())
}

/// Flag transport, else the configured one, else FastCGI over stdio.
pub fn resolve_transport(config: &Config, from_flags: Option<Transport>) -> Transport {
    from_flags
        .or_else(|| config.server.transport.clone())
        .unwrap_or_default()
}

/// Shared outbound client for image search and notifications.
pub fn build_http_client(http: &HttpConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(http.timeout_secs))
        .connect_timeout(Duration::from_secs(http.connect_timeout_secs))
        .user_agent(concat!("adblocks/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building http client")
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("ADBLOCKS_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".adblocks").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Missing file => default config.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
