//! Error classification: maps raw transport error text to a category.
//!
//! Classification is a fixed, ordered keyword table matched
//! case-insensitively; the first row with a matching keyword wins, so the
//! result for a given text never changes.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How much a failure or restriction hurts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// What kind of network interference an error points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    DeepPacketInspection,
    PortBlock,
    DnsFiltering,
    ProxyRequired,
    SslInspection,
    BandwidthThrottling,
    GeoBlocking,
    ApplicationBlock,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::DeepPacketInspection => "deep-packet-inspection",
            ErrorCategory::PortBlock => "port-block",
            ErrorCategory::DnsFiltering => "dns-filtering",
            ErrorCategory::ProxyRequired => "proxy-required",
            ErrorCategory::SslInspection => "ssl-inspection",
            ErrorCategory::BandwidthThrottling => "bandwidth-throttling",
            ErrorCategory::GeoBlocking => "geo-blocking",
            ErrorCategory::ApplicationBlock => "application-block",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Connectivity-type failures that warrant a longer backoff.
    pub fn escalates_backoff(&self) -> bool {
        matches!(
            self,
            ErrorCategory::PortBlock | ErrorCategory::BandwidthThrottling
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True when retrying the same path may succeed.
///
/// Throttling and unrecognized failures are transient; every blocking
/// category (DPI, port block, proxy, filtering, inspection) is not.
pub fn is_transient_error(category: ErrorCategory) -> bool {
    matches!(
        category,
        ErrorCategory::BandwidthThrottling | ErrorCategory::Unknown
    )
}

/// Retry guidance attached to a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed on the same transport within one transfer.
    pub max_attempts: u32,
    /// Minimum delay before the next attempt.
    pub initial_delay: Duration,
}

/// Result of classifying one failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub severity: Severity,
    /// Transport names worth trying next, best first.
    pub suggested_transports: Vec<String>,
    pub user_action: String,
    /// The raw error text that was classified.
    pub technical_details: String,
    pub retry: RetryPolicy,
}

struct Rule {
    category: ErrorCategory,
    keywords: &'static [&'static str],
    severity: Severity,
    suggested: &'static [&'static str],
    user_action: &'static str,
    max_attempts: u32,
    initial_delay_ms: u64,
}

const RULES: &[Rule] = &[
    Rule {
        category: ErrorCategory::DeepPacketInspection,
        keywords: &["reset", "broken pipe", "tls handshake", "unexpected eof", "early eof"],
        severity: Severity::Critical,
        suggested: &["https-relay"],
        user_action: "Traffic is being inspected and cut. Use the HTTPS relay, which looks like ordinary web traffic.",
        max_attempts: 1,
        initial_delay_ms: 5_000,
    },
    Rule {
        category: ErrorCategory::PortBlock,
        keywords: &["connection refused", "no route", "unreachable"],
        severity: Severity::High,
        suggested: &["https-relay", "ice"],
        user_action: "The destination port is blocked. Use a transport on port 443 or ask the network administrator to open the port.",
        max_attempts: 1,
        initial_delay_ms: 2_000,
    },
    Rule {
        category: ErrorCategory::DnsFiltering,
        keywords: &["dns", "no such host", "name resolution", "failed to lookup"],
        severity: Severity::Medium,
        suggested: &["tcp-direct", "ice"],
        user_action: "Name resolution is filtered. Connect by IP address or configure another DNS resolver.",
        max_attempts: 2,
        initial_delay_ms: 1_000,
    },
    Rule {
        category: ErrorCategory::ProxyRequired,
        keywords: &["proxy", "407"],
        severity: Severity::Medium,
        suggested: &["https-relay"],
        user_action: "Outbound traffic must go through a proxy. Set SLUICE_PROXY_URL (and credentials if required).",
        max_attempts: 1,
        initial_delay_ms: 0,
    },
    Rule {
        category: ErrorCategory::SslInspection,
        keywords: &["certificate", "x509", "self-signed", "self signed"],
        severity: Severity::High,
        suggested: &["ice", "tcp-direct"],
        user_action: "TLS is being intercepted. Payloads stay encrypted end to end; prefer a non-TLS transport or trust the inspection CA.",
        max_attempts: 1,
        initial_delay_ms: 0,
    },
    Rule {
        category: ErrorCategory::BandwidthThrottling,
        keywords: &["timeout", "timed out", "429", "rate limit", "too many requests"],
        severity: Severity::Medium,
        suggested: &["ice", "https-relay"],
        user_action: "The connection is slow or rate limited. Retry later or try a different transport.",
        max_attempts: 3,
        initial_delay_ms: 5_000,
    },
    Rule {
        category: ErrorCategory::GeoBlocking,
        keywords: &["451", "region", "unavailable for legal reasons"],
        severity: Severity::High,
        suggested: &["https-relay"],
        user_action: "The service is blocked in this region. Use a relay server hosted elsewhere.",
        max_attempts: 1,
        initial_delay_ms: 0,
    },
    Rule {
        category: ErrorCategory::ApplicationBlock,
        keywords: &["403", "forbidden", "access denied"],
        severity: Severity::High,
        suggested: &["https-relay", "ice"],
        user_action: "A firewall policy rejects this application. Try another transport or request an exception.",
        max_attempts: 1,
        initial_delay_ms: 0,
    },
];

const UNKNOWN_SUGGESTED: &[&str] = &["https-relay", "ice", "tcp-direct"];

/// Keyword-table error classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an error by its display text.
    pub fn classify(&self, error: &str) -> ErrorClassification {
        let text = error.to_lowercase();
        let rule = RULES
            .iter()
            .find(|rule| rule.keywords.iter().any(|k| text.contains(k)));

        match rule {
            Some(rule) => ErrorClassification {
                category: rule.category,
                severity: rule.severity,
                suggested_transports: rule.suggested.iter().map(|s| s.to_string()).collect(),
                user_action: rule.user_action.to_string(),
                technical_details: error.to_string(),
                retry: RetryPolicy {
                    max_attempts: rule.max_attempts,
                    initial_delay: Duration::from_millis(rule.initial_delay_ms),
                },
            },
            None => ErrorClassification {
                category: ErrorCategory::Unknown,
                severity: Severity::Medium,
                suggested_transports: UNKNOWN_SUGGESTED.iter().map(|s| s.to_string()).collect(),
                user_action: "The failure was not recognized. Check connectivity and try again."
                    .to_string(),
                technical_details: error.to_string(),
                retry: RetryPolicy {
                    max_attempts: 2,
                    initial_delay: Duration::from_secs(1),
                },
            },
        }
    }

    /// Classify any error through its `Display` output.
    pub fn classify_error(&self, error: &dyn std::error::Error) -> ErrorClassification {
        self.classify(&error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category(text: &str) -> ErrorCategory {
        ErrorClassifier::new().classify(text).category
    }

    #[test]
    fn os_error_texts() {
        assert_eq!(
            category("tcp-direct: connect to 10.0.0.1:9009 failed: Connection refused (os error 111)"),
            ErrorCategory::PortBlock
        );
        assert_eq!(
            category("Connection reset by peer (os error 104)"),
            ErrorCategory::DeepPacketInspection
        );
        assert_eq!(category("No route to host"), ErrorCategory::PortBlock);
        assert_eq!(
            category("ice: operation timed out after 8s"),
            ErrorCategory::BandwidthThrottling
        );
    }

    #[test]
    fn http_status_texts() {
        assert_eq!(
            category("https-relay: http status 407: Proxy Authentication Required"),
            ErrorCategory::ProxyRequired
        );
        assert_eq!(
            category("https-relay: http status 403: Forbidden"),
            ErrorCategory::ApplicationBlock
        );
        assert_eq!(
            category("https-relay: http status 451: Unavailable For Legal Reasons"),
            ErrorCategory::GeoBlocking
        );
        assert_eq!(
            category("https-relay: http status 429: Too Many Requests"),
            ErrorCategory::BandwidthThrottling
        );
    }

    #[test]
    fn resolver_and_tls_texts() {
        assert_eq!(
            category("dns error: failed to lookup address information"),
            ErrorCategory::DnsFiltering
        );
        assert_eq!(
            category("invalid peer certificate: UnknownIssuer"),
            ErrorCategory::SslInspection
        );
    }

    #[test]
    fn truncated_stream_texts() {
        // tokio's read_exact reports "early eof" on a cut stream
        assert_eq!(
            category("frame: i/o error: early eof"),
            ErrorCategory::DeepPacketInspection
        );
        assert_eq!(
            category("ice: i/o error: unexpected eof from 10.0.0.1:9010"),
            ErrorCategory::DeepPacketInspection
        );
    }

    #[test]
    fn first_matching_row_wins() {
        // "reset" (DPI row) comes before "timed out" (throttling row)
        assert_eq!(
            category("stream reset after operation timed out"),
            ErrorCategory::DeepPacketInspection
        );
    }

    #[test]
    fn matching_ignores_case() {
        assert_eq!(category("CONNECTION REFUSED"), ErrorCategory::PortBlock);
    }

    #[test]
    fn unmatched_is_unknown_with_suggestions() {
        let c = ErrorClassifier::new().classify("something odd happened");
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert!(!c.suggested_transports.is_empty());
        assert_eq!(c.technical_details, "something odd happened");
    }

    #[test]
    fn classification_is_deterministic() {
        let classifier = ErrorClassifier::new();
        let a = classifier.classify("Connection refused");
        let b = classifier.classify("Connection refused");
        assert_eq!(a, b);
    }

    #[test]
    fn transient_categories() {
        assert!(is_transient_error(ErrorCategory::BandwidthThrottling));
        assert!(is_transient_error(ErrorCategory::Unknown));
        assert!(!is_transient_error(ErrorCategory::DeepPacketInspection));
        assert!(!is_transient_error(ErrorCategory::PortBlock));
        assert!(!is_transient_error(ErrorCategory::ProxyRequired));
        assert!(!is_transient_error(ErrorCategory::GeoBlocking));
    }

    #[test]
    fn category_serializes_kebab_case() {
        let json = serde_json::to_string(&ErrorCategory::DeepPacketInspection).unwrap();
        assert_eq!(json, "\"deep-packet-inspection\"");
        assert_eq!(ErrorCategory::PortBlock.to_string(), "port-block");
    }
}
