//! Network profile types and signal fusion.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Severity;

/// Transport preferred on restrictive networks: looks like web traffic.
pub const FIREWALL_FRIENDLY_TRANSPORT: &str = "https-relay";

/// Number of probes in one classification cycle.
pub const PROBE_COUNT: usize = 10;

/// One heuristic probe that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Signal {
    /// A known-good domain resolved to a private or internal address.
    CorporateDns,
    /// A proxy auto-config file is served on the network.
    ProxyAutoConfig,
    /// Reverse DNS of the local address carries corporate naming.
    CorporateDomain,
    HighLatency,
    /// The local address sits in an institutional private range.
    PrivateRange,
    PortBlocking,
    DnsFiltering,
    UdpBlocked,
    TransparentProxy,
    DeepPacketInspection,
}

impl Signal {
    /// Restriction emitted when this signal fires.
    pub fn restriction(self) -> RestrictionKind {
        match self {
            Signal::CorporateDns => RestrictionKind::CorporateDns,
            Signal::ProxyAutoConfig => RestrictionKind::Pac,
            Signal::CorporateDomain => RestrictionKind::CorporateDomain,
            Signal::HighLatency => RestrictionKind::HighLatency,
            Signal::PrivateRange => RestrictionKind::PrivateRange,
            Signal::PortBlocking => RestrictionKind::PortBlocking,
            Signal::DnsFiltering => RestrictionKind::DnsFiltering,
            Signal::UdpBlocked => RestrictionKind::UdpBlocked,
            Signal::TransparentProxy => RestrictionKind::TransparentProxy,
            Signal::DeepPacketInspection => RestrictionKind::Dpi,
        }
    }
}

/// Kinds of restriction reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestrictionKind {
    PortBlocking,
    DnsFiltering,
    Dpi,
    /// Traffic must go through an explicitly configured proxy.
    Proxy,
    TransparentProxy,
    UdpBlocked,
    HighLatency,
    CorporateDns,
    CorporateDomain,
    PrivateRange,
    Pac,
}

impl RestrictionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestrictionKind::PortBlocking => "port-blocking",
            RestrictionKind::DnsFiltering => "dns-filtering",
            RestrictionKind::Dpi => "dpi",
            RestrictionKind::Proxy => "proxy",
            RestrictionKind::TransparentProxy => "transparent-proxy",
            RestrictionKind::UdpBlocked => "udp-blocked",
            RestrictionKind::HighLatency => "high-latency",
            RestrictionKind::CorporateDns => "corporate-dns",
            RestrictionKind::CorporateDomain => "corporate-domain",
            RestrictionKind::PrivateRange => "private-range",
            RestrictionKind::Pac => "pac",
        }
    }
}

impl fmt::Display for RestrictionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the restriction table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictionRule {
    pub kind: RestrictionKind,
    pub severity: Severity,
    pub confidence: f64,
    pub description: String,
    pub workaround: String,
}

impl RestrictionRule {
    fn new(
        kind: RestrictionKind,
        severity: Severity,
        confidence: f64,
        description: &str,
        workaround: &str,
    ) -> Self {
        Self {
            kind,
            severity,
            confidence,
            description: description.to_string(),
            workaround: workaround.to_string(),
        }
    }
}

/// The built-in restriction table.
#[rustfmt::skip]
pub fn default_restriction_table() -> Vec<RestrictionRule> {
    use RestrictionKind as K;
    use Severity as S;
    vec![
        RestrictionRule::new(K::PortBlocking, S::High, 0.9,
            "Outbound connections to many ports are blocked",
            "Use the HTTPS relay on port 443"),
        RestrictionRule::new(K::DnsFiltering, S::Medium, 0.8,
            "Some domains do not resolve",
            "Use IP-based transports or an alternative DNS resolver"),
        RestrictionRule::new(K::Dpi, S::Critical, 0.7,
            "Peer-to-peer handshakes are cut by deep packet inspection",
            "Use the HTTPS relay so traffic looks like ordinary web browsing"),
        RestrictionRule::new(K::Proxy, S::Medium, 0.85,
            "Outbound traffic goes through a configured proxy",
            "Keep the proxy settings in SLUICE_PROXY_URL; relay traffic is routed through it"),
        RestrictionRule::new(K::TransparentProxy, S::Medium, 0.75,
            "HTTP traffic is intercepted by a transparent proxy",
            "Prefer TLS transports; plain HTTP may be altered"),
        RestrictionRule::new(K::UdpBlocked, S::Medium, 0.8,
            "UDP traffic (STUN) gets no response",
            "Use TCP-based transports; server-reflexive candidates are unavailable"),
        RestrictionRule::new(K::HighLatency, S::Low, 0.6,
            "Round trips are slow",
            "Expect longer transfers; timeouts are extended automatically"),
        RestrictionRule::new(K::CorporateDns, S::Medium, 0.7,
            "Public names resolve to internal addresses",
            "The network is likely managed; use the HTTPS relay"),
        RestrictionRule::new(K::CorporateDomain, S::Medium, 0.7,
            "The local address belongs to a corporate domain",
            "The network is likely managed; use the HTTPS relay"),
        RestrictionRule::new(K::PrivateRange, S::Low, 0.5,
            "The local address is in an institutional private range",
            "Direct inbound connections are unlikely to work; use relayed transports"),
        RestrictionRule::new(K::Pac, S::Medium, 0.8,
            "A proxy auto-config file is published on this network",
            "Configure the proxy from the PAC file in SLUICE_PROXY_URL"),
    ]
}

/// A detected restriction, regenerated every classification cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRestriction {
    pub kind: RestrictionKind,
    pub description: String,
    pub severity: Severity,
    pub workaround: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

impl fmt::Display for NetworkRestriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {}; {}",
            self.kind, self.severity, self.description, self.workaround
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Home,
    Corporate,
    University,
    Public,
    Mobile,
    Institutional,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkType::Home => "home",
            NetworkType::Corporate => "corporate",
            NetworkType::University => "university",
            NetworkType::Public => "public",
            NetworkType::Mobile => "mobile",
            NetworkType::Institutional => "institutional",
        };
        f.write_str(s)
    }
}

/// Everything one classification cycle learned about the network.
///
/// Built in full, then swapped in; never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub is_restrictive: bool,
    /// Fired signals over total probes, in [0, 1].
    pub restrictiveness: f64,
    pub available_ports: Vec<u16>,
    pub latency_ms: Option<u64>,
    pub bandwidth_kbps: Option<u64>,
    pub blocked_domains: Vec<String>,
    pub has_tor_access: bool,
    pub has_webrtc: bool,
    pub supports_udp: bool,
    pub preferred_transport: Option<String>,
    pub network_type: NetworkType,
    pub proxy_detected: bool,
    pub dpi_detected: bool,
    pub signals: Vec<Signal>,
}

impl NetworkProfile {
    /// Conservative stand-in used until the first classification lands.
    pub fn assumed_restrictive() -> Self {
        Self {
            is_restrictive: true,
            restrictiveness: 1.0,
            available_ports: vec![443],
            latency_ms: None,
            bandwidth_kbps: None,
            blocked_domains: Vec::new(),
            has_tor_access: false,
            has_webrtc: false,
            supports_udp: false,
            preferred_transport: Some(FIREWALL_FRIENDLY_TRANSPORT.to_string()),
            network_type: NetworkType::Institutional,
            proxy_detected: false,
            dpi_detected: false,
            signals: Vec::new(),
        }
    }
}

/// Raw probe results of one classification cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    pub signals: Vec<Signal>,
    pub available_ports: Vec<u16>,
    pub blocked_domains: Vec<String>,
    pub latency_ms: Option<u64>,
    pub bandwidth_kbps: Option<u64>,
    pub supports_udp: bool,
    /// An outbound proxy is configured explicitly.
    pub proxy_configured: bool,
}

impl ProbeReport {
    pub fn fired(&self, signal: Signal) -> bool {
        self.signals.contains(&signal)
    }
}

/// Fuse probe results into a profile and its restrictions.
pub fn fuse(
    report: &ProbeReport,
    restrictive_threshold: usize,
    table: &[RestrictionRule],
) -> (NetworkProfile, Vec<NetworkRestriction>) {
    let mut signals: Vec<Signal> = Vec::with_capacity(report.signals.len());
    for signal in &report.signals {
        if !signals.contains(signal) {
            signals.push(*signal);
        }
    }
    let fired = signals.len();
    let is_restrictive = fired >= restrictive_threshold.max(1);

    let network_type = if !is_restrictive {
        NetworkType::Home
    } else if report.fired(Signal::CorporateDns) || report.fired(Signal::CorporateDomain) {
        NetworkType::Corporate
    } else if report.fired(Signal::PrivateRange) {
        NetworkType::University
    } else {
        NetworkType::Institutional
    };

    let mut kinds: Vec<RestrictionKind> = signals.iter().map(|s| s.restriction()).collect();
    if report.proxy_configured {
        kinds.push(RestrictionKind::Proxy);
    }
    let restrictions = kinds
        .into_iter()
        .filter_map(|kind| table.iter().find(|rule| rule.kind == kind))
        .map(|rule| NetworkRestriction {
            kind: rule.kind,
            description: rule.description.clone(),
            severity: rule.severity,
            workaround: rule.workaround.clone(),
            confidence: rule.confidence.clamp(0.0, 1.0),
        })
        .collect();

    let profile = NetworkProfile {
        is_restrictive,
        restrictiveness: (fired as f64 / PROBE_COUNT as f64).min(1.0),
        available_ports: report.available_ports.clone(),
        latency_ms: report.latency_ms,
        bandwidth_kbps: report.bandwidth_kbps,
        blocked_domains: report.blocked_domains.clone(),
        has_tor_access: !report
            .blocked_domains
            .iter()
            .any(|d| d.contains("torproject")),
        has_webrtc: report.supports_udp,
        supports_udp: report.supports_udp,
        preferred_transport: is_restrictive.then(|| FIREWALL_FRIENDLY_TRANSPORT.to_string()),
        network_type,
        proxy_detected: report.proxy_configured
            || report.fired(Signal::ProxyAutoConfig)
            || report.fired(Signal::TransparentProxy),
        dpi_detected: report.fired(Signal::DeepPacketInspection),
        signals,
    };

    (profile, restrictions)
}
