//! Proxy configuration.

use crate::fetch::FETCH_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Configuration for the proxy server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Bind port (0 = pick a free port)
    #[serde(default)]
    pub port: u16,

    /// Path the proxy endpoint is mounted on. Every rewritten reference
    /// points back at it.
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,

    /// Upstream fetch budget in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: 0,
            endpoint_path: default_endpoint_path(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl ProxyConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Endpoint path with exactly one leading slash and no trailing one.
    pub fn normalized_endpoint(&self) -> String {
        let trimmed = self.endpoint_path.trim().trim_matches('/');
        if trimmed.is_empty() {
            default_endpoint_path()
        } else {
            format!("/{}", trimmed)
        }
    }
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

fn default_endpoint_path() -> String {
    "/proxy".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    FETCH_TIMEOUT.as_secs()
}
