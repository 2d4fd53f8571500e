use sluice_transport::TransportError;

use crate::network::NetworkRestriction;
use crate::ErrorCategory;

/// Errors returned by the failover engine.
///
/// Individual transport failures are absorbed by the retry loop; callers see
/// one of these only when the whole transfer cannot proceed.
#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    #[error("a transfer is already in progress")]
    AlreadyInProgress,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("no transports registered")]
    NoTransports,

    #[error(
        "all transports failed after {attempts} attempts (last: {category}: {last_error}). {user_action}{}",
        restriction_summary(.restrictions)
    )]
    Exhausted {
        attempts: usize,
        category: ErrorCategory,
        suggested_transports: Vec<String>,
        user_action: String,
        last_error: String,
        restrictions: Vec<NetworkRestriction>,
    },

    #[error("orchestrator is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

fn restriction_summary(restrictions: &[NetworkRestriction]) -> String {
    if restrictions.is_empty() {
        return String::new();
    }
    let mut text = String::from(" Detected restrictions:");
    for r in restrictions {
        text.push_str(&format!(" [{r}]"));
    }
    text
}
