/// Configuration management for the proxy
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Main configuration structure for the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listening address; Go-style `:8080` binds every interface
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Route configurations, in priority order for equal-length prefixes
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Per-request forwarding timeout in milliseconds (<= 0 uses the default)
    #[serde(default)]
    pub request_timeout_ms: i64,
    /// Extra forwarding attempts after a transport failure (< 0 means none)
    #[serde(default)]
    pub max_retries: i64,
    /// Response cache size in megabytes (<= 0 disables caching)
    #[serde(default)]
    pub cache_size_mb: i64,
    /// Seconds between health probe rounds (<= 0 disables health checks)
    #[serde(default)]
    pub health_check_interval_sec: i64,
    /// Path the metrics snapshot is served on
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path prefix this route claims
    pub path_prefix: String,
    /// Backend base URLs, e.g. `http://127.0.0.1:9001`
    #[serde(default)]
    pub backends: Vec<String>,
    /// Load balancing strategy for this route
    #[serde(default)]
    pub strategy: BalancingStrategy,
}

/// Load balancing strategies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum BalancingStrategy {
    /// Health-aware round robin
    #[default]
    #[serde(rename = "round_robin")]
    RoundRobin,
    /// Fewest active connections
    #[serde(rename = "least_conn")]
    LeastConnections,
}

impl BalancingStrategy {
    /// Strategy for a configured name; empty and unknown names fall back to
    /// round robin
    pub fn from_name(name: &str) -> Self {
        match name {
            "least_conn" => BalancingStrategy::LeastConnections,
            "round_robin" | "" => BalancingStrategy::RoundRobin,
            other => {
                log::warn!(
                    "Unknown load balancing strategy '{}', using round_robin",
                    other
                );
                BalancingStrategy::RoundRobin
            }
        }
    }
}

impl<'de> Deserialize<'de> for BalancingStrategy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(BalancingStrategy::from_name(&name))
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config file: {}", path))?
        } else if path.ends_with(".toml") {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config file: {}", path))?
        } else if path.ends_with(".json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config file: {}", path))?
        } else {
            return Err(anyhow!(
                "Unsupported config file format. Supported formats: .json, .yaml, .yml, .toml"
            ));
        };

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_listen_addr(&self.listen_address())?;

        if self.routes.is_empty() {
            return Err(anyhow!("At least one route must be configured"));
        }

        for route in &self.routes {
            if route.backends.is_empty() {
                log::warn!(
                    "Route '{}' has no backends; requests to it will fail",
                    route.path_prefix
                );
            }
            for backend in &route.backends {
                validate_backend_url(backend).with_context(|| {
                    format!("Route '{}' has an invalid backend", route.path_prefix)
                })?;
            }
        }

        if !self.metrics_path.starts_with('/') {
            return Err(anyhow!(
                "metrics_path '{}' must start with '/'",
                self.metrics_path
            ));
        }

        Ok(())
    }

    /// Listening address in `host:port` form
    pub fn listen_address(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }

    /// Forwarding timeout for a single attempt
    pub fn request_timeout(&self) -> Duration {
        if self.request_timeout_ms <= 0 {
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
        } else {
            Duration::from_millis(self.request_timeout_ms as u64)
        }
    }

    /// Number of retries after the first forwarding attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries.clamp(0, u32::MAX as i64) as u32
    }

    /// Cache capacity in bytes; zero means caching is disabled
    pub fn cache_bytes(&self) -> usize {
        if self.cache_size_mb <= 0 {
            0
        } else {
            (self.cache_size_mb as usize).saturating_mul(1024 * 1024)
        }
    }

    /// Health probe interval; zero means health checks are disabled
    pub fn health_check_interval(&self) -> Duration {
        if self.health_check_interval_sec <= 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(self.health_check_interval_sec as u64)
        }
    }
}

/// `host:port` with a non-empty host and a numeric port; hostnames are allowed
fn validate_listen_addr(addr: &str) -> Result<()> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Invalid listen address '{}': expected host:port", addr))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(anyhow!("Invalid listen address '{}': missing host", addr));
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid listen address '{}': bad port", addr))?;
    Ok(())
}

fn validate_backend_url(url: &str) -> Result<()> {
    let uri: http::Uri = url
        .parse()
        .with_context(|| format!("Backend URL '{}' is not a valid URI", url))?;

    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => return Err(anyhow!("Backend URL '{}' must use http or https", url)),
    }

    if uri.authority().is_none() {
        return Err(anyhow!("Backend URL '{}' has no host", url));
    }

    Ok(())
}

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

// Default value functions
fn default_listen_addr() -> String {
    ":8080".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}
