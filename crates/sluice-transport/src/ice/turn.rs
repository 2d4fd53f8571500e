//! TURN relay discovery.
//!
//! Only candidate discovery: the server is resolved and advertised as a relay
//! candidate on the TURN port. No ALLOCATE, refresh or permission requests
//! are sent, so a relay candidate only works if something at that address
//! accepts the probe itself.

use std::net::IpAddr;

use hickory_resolver::TokioAsyncResolver;
use rand::distr::Alphanumeric;
use rand::Rng;

use crate::TransportError;

/// Standard TURN port.
pub const TURN_PORT: u16 = 3478;

pub const ENV_TURN_USERNAME: &str = "SLUICE_TURN_USERNAME";
pub const ENV_TURN_PASSWORD: &str = "SLUICE_TURN_PASSWORD";

const ANONYMOUS_USER: &str = "anonymous";

/// Long-term credentials presented to a TURN server.
#[derive(Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
}

impl TurnCredentials {
    /// Credentials from the environment, else an anonymous identity with a
    /// random per-session password.
    pub fn from_env() -> Self {
        let username = std::env::var(ENV_TURN_USERNAME)
            .ok()
            .filter(|u| !u.is_empty());
        let password = std::env::var(ENV_TURN_PASSWORD)
            .ok()
            .filter(|p| !p.is_empty());
        Self::resolve(username, password)
    }

    fn resolve(username: Option<String>, password: Option<String>) -> Self {
        match (username, password) {
            (Some(username), Some(password)) => Self { username, password },
            (Some(username), None) => Self {
                username,
                password: session_password(),
            },
            _ => Self {
                username: ANONYMOUS_USER.to_string(),
                password: session_password(),
            },
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username == ANONYMOUS_USER
    }
}

impl std::fmt::Debug for TurnCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn session_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// Strip `turn:`/`turns:` schemes, query strings and a trailing port.
pub fn server_host(server: &str) -> &str {
    let host = server
        .strip_prefix("turns:")
        .or_else(|| server.strip_prefix("turn:"))
        .unwrap_or(server);
    let host = host.split('?').next().unwrap_or(host);
    if let Some(inner) = host.strip_prefix('[') {
        // [v6]:port
        return inner.split(']').next().unwrap_or(inner);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => name,
        _ => host,
    }
}

/// Resolve `server` to the address its relay candidate is advertised on.
///
/// IPv4 answers are preferred; literal addresses skip DNS.
pub async fn resolve_relay(
    resolver: &TokioAsyncResolver,
    server: &str,
) -> Result<IpAddr, TransportError> {
    let host = server_host(server);
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let answer = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| TransportError::Resolve {
            endpoint: "turn".into(),
            host: host.to_string(),
            reason: e.to_string(),
        })?;
    let addrs: Vec<IpAddr> = answer.iter().collect();
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::Resolve {
            endpoint: "turn".into(),
            host: host.to_string(),
            reason: "no addresses".into(),
        })
}
