//! Runtime configuration.
//!
//! A single source of truth with sensible defaults and environment-variable
//! overrides; everything the server and the connection layer need to know
//! about timing and addressing lives here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default values for configuration
mod defaults {
    pub fn http_port() -> u16 { 3030 }
    pub fn bind_addr() -> String { "0.0.0.0".to_string() }
    pub fn path_prefix() -> String { "/api".to_string() }
    pub fn keepalive_interval_secs() -> u64 { 30 }
    pub fn request_timeout_secs() -> u64 { 30 }
}

/// Runtime configuration for one server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Address to bind the HTTP listener to.
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Port to bind the HTTP listener to.
    #[serde(default = "defaults::http_port")]
    pub http_port: u16,

    /// Fixed path prefix all RPC traffic is routed under; anything outside
    /// it is answered with 400.
    #[serde(default = "defaults::path_prefix")]
    pub path_prefix: String,

    /// Seconds between keepalive comments on push streams. Exists to defeat
    /// intermediary idle-connection timeouts on long-lived streams.
    #[serde(default = "defaults::keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Seconds a call may take to produce its response headers. Streaming
    /// bodies and upgraded sockets are unaffected; their liveness comes
    /// from keepalive frames.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            http_port: defaults::http_port(),
            path_prefix: defaults::path_prefix(),
            keepalive_interval_secs: defaults::keepalive_interval_secs(),
            request_timeout_secs: defaults::request_timeout_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables: `SWITCHBOARD_BIND_ADDR`, `SWITCHBOARD_HTTP_PORT`,
    /// `SWITCHBOARD_PATH_PREFIX`, `SWITCHBOARD_KEEPALIVE_SECS`,
    /// `SWITCHBOARD_REQUEST_TIMEOUT_SECS`.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("SWITCHBOARD_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(port) = std::env::var("SWITCHBOARD_HTTP_PORT") {
            config.http_port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("SWITCHBOARD_HTTP_PORT is not a port: {port}"))?;
        }
        if let Ok(prefix) = std::env::var("SWITCHBOARD_PATH_PREFIX") {
            config.path_prefix = prefix;
        }
        if let Ok(secs) = std::env::var("SWITCHBOARD_KEEPALIVE_SECS") {
            config.keepalive_interval_secs = secs.parse().map_err(|_| {
                anyhow::anyhow!("SWITCHBOARD_KEEPALIVE_SECS is not a number: {secs}")
            })?;
        }
        if let Ok(secs) = std::env::var("SWITCHBOARD_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = secs.parse().map_err(|_| {
                anyhow::anyhow!("SWITCHBOARD_REQUEST_TIMEOUT_SECS is not a number: {secs}")
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.path_prefix.starts_with('/') || self.path_prefix.len() < 2 {
            anyhow::bail!(
                "path prefix must start with '/' and be non-empty: {}",
                self.path_prefix
            );
        }
        if self.keepalive_interval_secs == 0 {
            anyhow::bail!("keepalive interval must be non-zero");
        }
        Ok(())
    }

    /// Keepalive interval as a [`Duration`].
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// `addr:port` string the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.http_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.path_prefix, "/api");
        assert_eq!(config.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(config.listen_addr(), "0.0.0.0:3030");
    }

    #[test]
    fn test_validation_rejects_bad_prefix() {
        let config = RuntimeConfig {
            path_prefix: "noslash".to_string(),
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RuntimeConfig {
            path_prefix: "/".to_string(),
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_keepalive() {
        let config = RuntimeConfig {
            keepalive_interval_secs: 0,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
