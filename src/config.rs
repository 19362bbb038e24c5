use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

/// Outbound HTTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Sent when the client has no User-Agent of its own.
    /// A realistic browser string is generated when unset.
    pub user_agent: Option<String>,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
            user_agent: None,
        }
    }
}

/// Proxy server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path the proxy endpoint is served on, e.g. `/proxy`.
    pub mount_path: String,
    /// Session key used when a request names none.
    pub default_session: String,
    pub max_body_bytes: usize,
    pub inject_frame_shim: bool,
    /// Allow targets on loopback hosts. Only meant for local development.
    pub allow_loopback: bool,
    pub upstream: UpstreamConfig,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        let path = self.mount_path.as_str();
        if !path.starts_with('/') {
            bail!("MOUNT_PATH must start with '/', got {path:?}");
        }
        if matches!(path, "/" | "/health" | "/sessions") || path.starts_with("/sessions/") {
            bail!("MOUNT_PATH {path:?} collides with a built-in route");
        }
        if path.contains(['?', '#', '{', '}', '*']) {
            bail!("MOUNT_PATH {path:?} must be a plain path");
        }
        if self.default_session.trim().is_empty() {
            bail!("DEFAULT_SESSION must not be empty");
        }
        if self.upstream.timeout_secs == 0 {
            bail!("UPSTREAM_TIMEOUT_SECS must be greater than zero");
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            mount_path: "/proxy".to_string(),
            default_session: "default".to_string(),
            max_body_bytes: 10 * 1024 * 1024,
            inject_frame_shim: true,
            allow_loopback: false,
            upstream: UpstreamConfig::default(),
        }
    }
}

/// Load configuration from environment variables.
pub fn load_from_env() -> Result<ServerConfig> {
    from_lookup(|key| std::env::var(key).ok())
}

/// Build a configuration from any key lookup, falling back to defaults for
/// unset keys. Values that are set but unparsable are an error.
pub fn from_lookup<F>(lookup: F) -> Result<ServerConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = ServerConfig::default();
    let upstream_defaults = UpstreamConfig::default();

    let config = ServerConfig {
        host: lookup("HOST").unwrap_or(defaults.host),
        port: parse(&lookup, "PORT")?.unwrap_or(defaults.port),
        mount_path: lookup("MOUNT_PATH").unwrap_or(defaults.mount_path),
        default_session: lookup("DEFAULT_SESSION").unwrap_or(defaults.default_session),
        max_body_bytes: parse(&lookup, "MAX_BODY_BYTES")?.unwrap_or(defaults.max_body_bytes),
        inject_frame_shim: parse(&lookup, "INJECT_FRAME_SHIM")?
            .unwrap_or(defaults.inject_frame_shim),
        allow_loopback: parse(&lookup, "ALLOW_LOOPBACK")?.unwrap_or(defaults.allow_loopback),
        upstream: UpstreamConfig {
            timeout_secs: parse(&lookup, "UPSTREAM_TIMEOUT_SECS")?
                .unwrap_or(upstream_defaults.timeout_secs),
            connect_timeout_secs: parse(&lookup, "CONNECT_TIMEOUT_SECS")?
                .unwrap_or(upstream_defaults.connect_timeout_secs),
            user_agent: lookup("USER_AGENT").filter(|ua| !ua.trim().is_empty()),
        },
    };

    config.validate()?;
    Ok(config)
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("Invalid {key}: {raw:?}")),
    }
}
