//! Network classification: fingerprints the local network from a battery
//! of independent probes.
//!
//! The classifier never sits on the transfer path: the orchestrator runs it
//! in the background and reads the latest [`NetworkProfile`].

mod probes;
mod profile;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;

pub use probes::{
    bittorrent_handshake, connection_quality, has_corporate_hint, has_proxy_headers, in_ranges,
    is_internal, PortScan,
};
pub use profile::{
    default_restriction_table, fuse, NetworkProfile, NetworkRestriction, NetworkType, ProbeReport,
    RestrictionKind, RestrictionRule, Signal, FIREWALL_FRIENDLY_TRANSPORT, PROBE_COUNT,
};

use crate::FailoverError;

/// Source of network assessments. Implemented by [`NetworkClassifier`];
/// tests substitute canned answers.
#[async_trait::async_trait]
pub trait NetworkAssessor: Send + Sync {
    /// Run one full classification cycle.
    async fn classify(&self) -> (NetworkProfile, Vec<NetworkRestriction>);

    /// Network quality on a 0–10 scale.
    async fn quality_score(&self) -> f64;
}

/// Probe targets, thresholds and the restriction table.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Domain expected to resolve to a public address.
    pub known_good_domain: String,
    /// Canary domains; the first entry is the known-good control.
    pub canary_domains: Vec<String>,
    pub pac_urls: Vec<String>,
    /// DNS labels that mark a corporate reverse name.
    pub corporate_domain_hints: Vec<String>,
    /// `host:port` used for the latency probe.
    pub latency_target: String,
    pub latency_threshold: Duration,
    /// Host that accepts connections on any port.
    pub port_probe_host: String,
    pub standard_ports: Vec<u16>,
    pub p2p_ports: Vec<u16>,
    /// Blocked fraction above which the port signal fires.
    pub port_block_threshold: f64,
    pub stun_servers: Vec<String>,
    /// Plain-HTTP URL inspected for proxy headers.
    pub http_probe_url: String,
    /// `host:port` receiving the P2P handshake.
    pub dpi_target: String,
    /// Ranges that mark an institutional network.
    pub institutional_ranges: Vec<(Ipv4Addr, u8)>,
    /// Address used to find the local outbound IP (nothing is sent).
    pub outbound_probe_addr: SocketAddr,
    /// Timeout of each probe.
    pub probe_timeout: Duration,
    /// Timeout of each port connection in the port probe.
    pub port_probe_timeout: Duration,
    /// Fired signals needed to call the network restrictive.
    pub restrictive_threshold: usize,
    /// `host:port` targets for the quality score.
    pub quality_targets: Vec<String>,
    pub restriction_table: Vec<RestrictionRule>,
    /// An outbound proxy is configured explicitly.
    pub proxy_configured: bool,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            known_good_domain: "www.google.com".into(),
            canary_domains: strings(&[
                "www.google.com",
                "www.torproject.org",
                "www.bittorrent.com",
                "signal.org",
                "protonvpn.com",
            ]),
            pac_urls: strings(&[
                "http://wpad/wpad.dat",
                "http://wpad.local/wpad.dat",
                "http://proxy/proxy.pac",
            ]),
            corporate_domain_hints: strings(&[
                "corp", "corporate", "internal", "intra", "intranet", "local", "lan", "ad",
            ]),
            latency_target: "1.1.1.1:443".into(),
            latency_threshold: Duration::from_millis(300),
            port_probe_host: "portquiz.net".into(),
            standard_ports: vec![21, 22, 53, 80, 443, 993, 995],
            p2p_ports: vec![1080, 6881, 6969, 8080, 9009, 9010, 51413],
            port_block_threshold: 0.3,
            stun_servers: strings(sluice_transport::DEFAULT_STUN_SERVERS),
            http_probe_url: "http://captive.apple.com/hotspot-detect.html".into(),
            dpi_target: "portquiz.net:6881".into(),
            institutional_ranges: vec![
                (Ipv4Addr::new(10, 0, 0, 0), 8),
                (Ipv4Addr::new(172, 16, 0, 0), 12),
            ],
            outbound_probe_addr: SocketAddr::from(([8, 8, 8, 8], 80)),
            probe_timeout: Duration::from_secs(5),
            port_probe_timeout: Duration::from_secs(3),
            restrictive_threshold: 3,
            quality_targets: strings(&["1.1.1.1:443", "8.8.8.8:443", "9.9.9.9:443"]),
            restriction_table: default_restriction_table(),
            proxy_configured: false,
        }
    }
}

impl ClassifierConfig {
    /// Defaults aligned with a transport configuration (STUN servers, proxy).
    pub fn for_transport(transport: &sluice_transport::TransportConfig) -> Self {
        let mut config = Self::default();
        if !transport.stun_servers.is_empty() {
            config.stun_servers = transport.stun_servers.clone();
        }
        config.proxy_configured = transport.proxy.is_some();
        config
    }
}

/// Probe-driven [`NetworkAssessor`].
pub struct NetworkClassifier {
    config: ClassifierConfig,
    resolver: TokioAsyncResolver,
    http: reqwest::Client,
}

impl NetworkClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self, FailoverError> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(config.probe_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FailoverError::Config(format!("probe http client: {e}")))?;
        Ok(Self {
            config,
            resolver: sluice_transport::dns::system_resolver(),
            http,
        })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Run every probe concurrently, each under its own timeout.
    pub async fn probe(&self) -> ProbeReport {
        let cfg = &self.config;
        let limit = cfg.probe_timeout;
        let local_ip = probes::bounded(limit, None, probes::local_outbound_ip(cfg.outbound_probe_addr)).await;

        let mut ports = cfg.standard_ports.clone();
        ports.extend(cfg.p2p_ports.iter().copied());
        // The scan runs its ports in parallel; allow for slow connects
        let scan_limit = limit.max(cfg.port_probe_timeout) + Duration::from_secs(1);

        let (corp_dns, pac, corp_domain, latency, scan, blocked, udp, http, dpi) = tokio::join!(
            probes::bounded(limit, false, probes::corporate_dns(&self.resolver, &cfg.known_good_domain)),
            probes::bounded(limit, false, probes::proxy_auto_config(&self.http, &cfg.pac_urls)),
            probes::bounded(limit, false, async {
                match local_ip {
                    Some(ip) => probes::corporate_domain(&self.resolver, ip, &cfg.corporate_domain_hints).await,
                    None => false,
                }
            }),
            probes::bounded(limit, None, probes::connect_latency(&cfg.latency_target)),
            probes::bounded(
                scan_limit,
                PortScan::default(),
                probes::port_connectivity(&cfg.port_probe_host, &ports, cfg.port_probe_timeout)
            ),
            probes::bounded(limit, Vec::new(), probes::dns_filtering(&self.resolver, &cfg.canary_domains)),
            probes::bounded(limit, false, probes::udp_reachable(&cfg.stun_servers, limit / 2)),
            probes::bounded(limit, probes::HttpProbe::default(), probes::transparent_proxy(&self.http, &cfg.http_probe_url)),
            probes::bounded(limit, false, probes::deep_packet_inspection(&cfg.dpi_target, limit / 2)),
        );

        let mut signals = Vec::new();
        if corp_dns {
            signals.push(Signal::CorporateDns);
        }
        if pac {
            signals.push(Signal::ProxyAutoConfig);
        }
        if corp_domain {
            signals.push(Signal::CorporateDomain);
        }
        if latency.is_some_and(|rtt| rtt > cfg.latency_threshold) {
            signals.push(Signal::HighLatency);
        }
        if local_ip.is_some_and(|ip| in_ranges(ip, &cfg.institutional_ranges)) {
            signals.push(Signal::PrivateRange);
        }
        if scan.blocked_fraction > cfg.port_block_threshold {
            signals.push(Signal::PortBlocking);
        }
        if !blocked.is_empty() {
            signals.push(Signal::DnsFiltering);
        }
        if !udp {
            signals.push(Signal::UdpBlocked);
        }
        if http.proxied {
            signals.push(Signal::TransparentProxy);
        }
        if dpi {
            signals.push(Signal::DeepPacketInspection);
        }

        ProbeReport {
            signals,
            available_ports: scan.open,
            blocked_domains: blocked,
            latency_ms: latency.map(|rtt| rtt.as_millis() as u64),
            bandwidth_kbps: http.bandwidth_kbps,
            supports_udp: udp,
            proxy_configured: cfg.proxy_configured,
        }
    }
}

#[async_trait::async_trait]
impl NetworkAssessor for NetworkClassifier {
    async fn classify(&self) -> (NetworkProfile, Vec<NetworkRestriction>) {
        let report = self.probe().await;
        let (profile, restrictions) = fuse(
            &report,
            self.config.restrictive_threshold,
            &self.config.restriction_table,
        );
        tracing::info!(
            "network classified as {} (restrictive: {}, {} signals)",
            profile.network_type,
            profile.is_restrictive,
            profile.signals.len()
        );
        (profile, restrictions)
    }

    async fn quality_score(&self) -> f64 {
        connection_quality(&self.config.quality_targets, self.config.probe_timeout).await
    }
}
