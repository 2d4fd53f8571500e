use std::net::SocketAddr;
use std::time::Duration;

/// Errors returned by sluice transport endpoints.
///
/// Display output keeps the low-level text (OS error strings, resolver and
/// HTTP messages) intact: the failover layer classifies errors by matching
/// keywords in that text.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{endpoint}: connect to {addr} failed: {source}")]
    Connect {
        endpoint: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{endpoint}: i/o error: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{endpoint}: operation timed out after {after:?}")]
    Timeout { endpoint: String, after: Duration },

    #[error("{endpoint}: dns resolution of {host} failed: {reason}")]
    Resolve {
        endpoint: String,
        host: String,
        reason: String,
    },

    #[error("{endpoint}: http request failed: {detail}")]
    Request { endpoint: String, detail: String },

    #[error("{endpoint}: http status {status}: {body}")]
    HttpStatus {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("stun: {0}")]
    Stun(String),

    /// `last` keeps the final candidate's error text for classification.
    #[error("all {attempted} ICE candidates failed (last: {last})")]
    CandidatesExhausted { attempted: usize, last: String },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("{endpoint}: not configured: {reason}")]
    NotConfigured { endpoint: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{endpoint}: endpoint is closed")]
    Closed { endpoint: String },

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Wrap an I/O error, attributing it to `endpoint`.
    pub fn io(endpoint: &str, source: std::io::Error) -> Self {
        TransportError::Io {
            endpoint: endpoint.to_string(),
            source,
        }
    }

    /// Wrap an error whose full source chain must stay visible in the text.
    pub fn request(endpoint: &str, err: &(dyn std::error::Error + 'static)) -> Self {
        TransportError::Request {
            endpoint: endpoint.to_string(),
            detail: error_chain(err),
        }
    }

    /// Build a timeout error for `endpoint`.
    pub fn timeout(endpoint: &str, after: Duration) -> Self {
        TransportError::Timeout {
            endpoint: endpoint.to_string(),
            after,
        }
    }
}

/// Render an error and all of its sources as `outer: inner: root`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let inner_text = inner.to_string();
        if !text.contains(&inner_text) {
            text.push_str(": ");
            text.push_str(&inner_text);
        }
        source = inner.source();
    }
    text
}
