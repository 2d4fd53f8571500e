use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default port used for host candidates and the direct TCP listener.
pub const DEFAULT_ICE_PORT: u16 = 9009;

/// Default STUN servers queried for server-reflexive candidates.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// Outbound proxy settings handed to HTTP-based transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Proxy URL, e.g. `http://proxy.corp.example:3128`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Session-wide configuration passed to every endpoint's `setup`.
///
/// Immutable once a session starts. All fields have defaults; list-valued
/// fields can be seeded from the environment:
///
/// | Variable | Field |
/// |---|---|
/// | `SLUICE_RELAY_SERVERS` | relay base URLs (comma separated) |
/// | `SLUICE_STUN_SERVERS` | STUN `host:port` list |
/// | `SLUICE_TURN_SERVERS` | TURN hosts |
/// | `SLUICE_PROXY_URL` | outbound proxy |
/// | `SLUICE_PEER_ADDR` | direct peer `ip:port` |
/// | `SLUICE_TIMEOUT_SECS` | per-operation timeout |
///
/// ```rust
/// use sluice_transport::TransportConfig;
/// use std::time::Duration;
///
/// let config = TransportConfig::new()
///     .relay_server("https://relay.example.net")
///     .timeout(Duration::from_secs(20));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Base URLs of HTTPS relay servers, tried in order.
    pub relay_servers: Vec<String>,
    /// STUN servers (`host:port`) for server-reflexive discovery.
    pub stun_servers: Vec<String>,
    /// TURN servers (`host` or `host:port`) for relay candidates.
    pub turn_servers: Vec<String>,
    /// Optional outbound proxy.
    pub proxy: Option<ProxySettings>,
    /// Address of the remote peer for direct transports.
    pub peer_addr: Option<SocketAddr>,
    /// Fixed port for host candidates.
    pub ice_port: u16,
    /// Upper bound on a single send/receive operation.
    pub timeout: Duration,
    /// Timeout for each STUN server query.
    pub stun_timeout: Duration,
    /// Timeout for each ICE candidate connectivity test.
    pub candidate_timeout: Duration,
    /// Largest payload a receiver accepts.
    pub max_payload_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relay_servers: Vec::new(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn_servers: Vec::new(),
            proxy: None,
            peer_addr: None,
            ice_port: DEFAULT_ICE_PORT,
            timeout: Duration::from_secs(30),
            stun_timeout: Duration::from_secs(5),
            candidate_timeout: Duration::from_secs(8),
            max_payload_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl TransportConfig {
    /// Create a config from defaults, then apply any `SLUICE_*` environment
    /// variables that are set.
    pub fn new() -> Self {
        let mut config = Self::default();

        if let Some(list) = env_list("SLUICE_RELAY_SERVERS") {
            config.relay_servers = list;
        }
        if let Some(list) = env_list("SLUICE_STUN_SERVERS") {
            config.stun_servers = list;
        }
        if let Some(list) = env_list("SLUICE_TURN_SERVERS") {
            config.turn_servers = list;
        }
        if let Ok(url) = std::env::var("SLUICE_PROXY_URL") {
            if !url.trim().is_empty() {
                config.proxy = Some(ProxySettings {
                    url: url.trim().to_string(),
                    username: std::env::var("SLUICE_PROXY_USERNAME").ok(),
                    password: std::env::var("SLUICE_PROXY_PASSWORD").ok(),
                });
            }
        }
        config.peer_addr = std::env::var("SLUICE_PEER_ADDR")
            .ok()
            .and_then(|s| s.trim().parse().ok());
        if let Some(secs) = std::env::var("SLUICE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            config.timeout = Duration::from_secs(secs);
        }

        config
    }

    /// Append a relay server base URL.
    pub fn relay_server(mut self, url: impl Into<String>) -> Self {
        self.relay_servers.push(url.into());
        self
    }

    /// Replace the STUN server list.
    pub fn stun_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stun_servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Append a TURN server.
    pub fn turn_server(mut self, host: impl Into<String>) -> Self {
        self.turn_servers.push(host.into());
        self
    }

    /// Route HTTP transports through a proxy.
    pub fn proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Set the remote peer address for direct transports.
    pub fn peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Set the host candidate port (default: 9009).
    pub fn ice_port(mut self, port: u16) -> Self {
        self.ice_port = port;
        self
    }

    /// Set the per-operation timeout (default: 30s).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-server STUN timeout (default: 5s).
    pub fn stun_timeout(mut self, timeout: Duration) -> Self {
        self.stun_timeout = timeout;
        self
    }

    /// Set the per-candidate connectivity test timeout (default: 8s).
    pub fn candidate_timeout(mut self, timeout: Duration) -> Self {
        self.candidate_timeout = timeout;
        self
    }

    /// Set the maximum accepted payload size (default: 64 MB).
    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}
