//! The heuristic probes behind network classification.
//!
//! Every probe answers "did this signal fire?" and treats its own failures
//! as "signal absent": a probe that cannot reach its target proves nothing.
//! Callers bound each probe with [`bounded`].

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use hickory_resolver::TokioAsyncResolver;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinSet;

/// Run `fut` for at most `limit`, yielding `default` on expiry.
pub async fn bounded<T, F>(limit: Duration, default: T, fut: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, fut).await.unwrap_or(default)
}

// ── Pure helpers ────────────────────────────────────────────────────

/// Private, loopback, link-local or carrier-grade NAT address.
pub fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || (a == 100 && (64..128).contains(&b))
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || v6.is_unspecified() || (first & 0xfe00) == 0xfc00
        }
    }
}

/// True if `ip` falls in any `(network, prefix_len)` range.
pub fn in_ranges(ip: IpAddr, ranges: &[(Ipv4Addr, u8)]) -> bool {
    let IpAddr::V4(v4) = ip else {
        return false;
    };
    let addr = u32::from(v4);
    ranges.iter().any(|(network, prefix)| {
        let prefix = u32::from((*prefix).min(32));
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        addr & mask == u32::from(*network) & mask
    })
}

/// True if any DNS label of `name` is one of `hints`.
pub fn has_corporate_hint(name: &str, hints: &[String]) -> bool {
    name.trim_end_matches('.')
        .split('.')
        .map(str::to_ascii_lowercase)
        .any(|label| hints.iter().any(|hint| label == hint.as_str()))
}

/// Response headers that betray an intercepting proxy.
pub const PROXY_HEADERS: &[&str] = &["via", "x-forwarded-for", "x-cache", "proxy-connection"];

pub fn has_proxy_headers(headers: &reqwest::header::HeaderMap) -> bool {
    PROXY_HEADERS.iter().any(|h| headers.contains_key(*h))
}

/// A BitTorrent handshake: the classic DPI fingerprint.
pub fn bittorrent_handshake() -> [u8; 68] {
    let mut msg = [0u8; 68];
    msg[0] = 19;
    msg[1..20].copy_from_slice(b"BitTorrent protocol");
    // 8 reserved bytes stay zero; info hash and peer id are random
    let tail: [u8; 40] = std::array::from_fn(|_| rand::random());
    msg[28..].copy_from_slice(&tail);
    msg
}

// ── Network probes ──────────────────────────────────────────────────

/// Local address used for outbound traffic. No packet is sent.
pub async fn local_outbound_ip(via: SocketAddr) -> Option<IpAddr> {
    let bind: SocketAddr = if via.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(via).await.ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// Probe 1: a public domain resolving to an internal address.
pub async fn corporate_dns(resolver: &TokioAsyncResolver, domain: &str) -> bool {
    match resolver.lookup_ip(domain).await {
        Ok(answer) => {
            let internal = answer.iter().any(is_internal);
            if internal {
                tracing::debug!("probe: {domain} resolves to an internal address");
            }
            internal
        }
        Err(e) => {
            tracing::debug!("probe: corporate dns lookup of {domain} failed: {e}");
            false
        }
    }
}

/// Probe 2: any well-known PAC URL answers with success.
pub async fn proxy_auto_config(client: &reqwest::Client, urls: &[String]) -> bool {
    for url in urls {
        match client.head(url).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!("probe: proxy auto-config served at {url}");
                return true;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("probe: PAC {url} unreachable: {e}"),
        }
    }
    false
}

/// Probe 3: PTR names of `ip` carry corporate naming.
pub async fn corporate_domain(resolver: &TokioAsyncResolver, ip: IpAddr, hints: &[String]) -> bool {
    match resolver.reverse_lookup(ip).await {
        Ok(names) => names
            .iter()
            .map(|name| name.to_string())
            .any(|name| has_corporate_hint(&name, hints)),
        Err(e) => {
            tracing::debug!("probe: reverse lookup of {ip} failed: {e}");
            false
        }
    }
}

/// Probe 4: TCP connect time to `target`, `None` if unreachable.
pub async fn connect_latency(target: &str) -> Option<Duration> {
    let started = Instant::now();
    match TcpStream::connect(target).await {
        Ok(_) => Some(started.elapsed()),
        Err(e) => {
            tracing::debug!("probe: latency target {target} unreachable: {e}");
            None
        }
    }
}

/// Result of the port connectivity probe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortScan {
    pub open: Vec<u16>,
    pub blocked_fraction: f64,
}

/// Probe 6: connect to `host` on every port concurrently.
///
/// An unresolvable host yields an empty scan with nothing blocked.
pub async fn port_connectivity(host: &str, ports: &[u16], per_port: Duration) -> PortScan {
    if ports.is_empty() {
        return PortScan::default();
    }
    let ip = match tokio::net::lookup_host((host, 0)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr.ip(),
            None => return PortScan::default(),
        },
        Err(e) => {
            tracing::debug!("probe: port probe host {host} unresolvable: {e}");
            return PortScan::default();
        }
    };

    let mut set = JoinSet::new();
    for &port in ports {
        set.spawn(async move {
            let open = tokio::time::timeout(per_port, TcpStream::connect((ip, port)))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            (port, open)
        });
    }

    let mut open = Vec::new();
    while let Some(joined) = set.join_next().await {
        if let Ok((port, true)) = joined {
            open.push(port);
        }
    }
    open.sort_unstable();
    let blocked = ports.len() - open.len().min(ports.len());
    PortScan {
        blocked_fraction: blocked as f64 / ports.len() as f64,
        open,
    }
}

/// Probe 7: canary domains that fail to resolve.
///
/// The first entry is the known-good control; if it fails too, DNS is simply
/// broken and nothing is reported as filtered.
pub async fn dns_filtering(resolver: &TokioAsyncResolver, canaries: &[String]) -> Vec<String> {
    let Some((control, rest)) = canaries.split_first() else {
        return Vec::new();
    };
    if resolver.lookup_ip(control.as_str()).await.is_err() {
        tracing::debug!("probe: control domain {control} does not resolve, skipping filter check");
        return Vec::new();
    }
    let mut blocked = Vec::new();
    for domain in rest {
        if let Err(e) = resolver.lookup_ip(domain.as_str()).await {
            tracing::debug!("probe: canary {domain} blocked: {e}");
            blocked.push(domain.clone());
        }
    }
    blocked
}

/// Probe 8: any STUN server answers a binding request.
pub async fn udp_reachable(stun_servers: &[String], per_server: Duration) -> bool {
    for server in stun_servers {
        match sluice_transport::ice::stun::query(server, per_server).await {
            Ok(_) => return true,
            Err(e) => tracing::debug!("probe: STUN {server} failed: {e}"),
        }
    }
    false
}

/// Result of the plain-HTTP probe.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HttpProbe {
    pub proxied: bool,
    pub bandwidth_kbps: Option<u64>,
}

/// Probe 9: intercepting-proxy headers on a plain HTTP response.
///
/// The body download doubles as a rough bandwidth sample.
pub async fn transparent_proxy(client: &reqwest::Client, url: &str) -> HttpProbe {
    let started = Instant::now();
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("probe: http probe {url} failed: {e}");
            return HttpProbe::default();
        }
    };
    let proxied = has_proxy_headers(response.headers());
    let bandwidth_kbps = match response.bytes().await {
        Ok(body) if !body.is_empty() => {
            let secs = started.elapsed().as_secs_f64().max(1e-3);
            Some(((body.len() as f64 * 8.0 / 1000.0) / secs) as u64)
        }
        _ => None,
    };
    HttpProbe {
        proxied,
        bandwidth_kbps,
    }
}

/// Probe 10: a P2P handshake that gets reset or cut off.
///
/// Connect failures prove nothing; a reply or a quiet open stream means the
/// handshake passed.
pub async fn deep_packet_inspection(target: &str, read_wait: Duration) -> bool {
    let mut stream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("probe: dpi target {target} unreachable: {e}");
            return false;
        }
    };
    if let Err(e) = stream.write_all(&bittorrent_handshake()).await {
        tracing::debug!("probe: handshake write to {target} failed: {e}");
        return true;
    }
    let mut buf = [0u8; 64];
    match tokio::time::timeout(read_wait, stream.read(&mut buf)).await {
        Ok(Ok(0)) => true,
        Ok(Ok(_)) => false,
        Ok(Err(e)) => {
            tracing::debug!("probe: handshake to {target} cut: {e}");
            matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            )
        }
        Err(_) => false,
    }
}

/// 0–10 network quality from connect times to well-known endpoints.
pub async fn connection_quality(targets: &[String], per_target: Duration) -> f64 {
    if targets.is_empty() {
        return 5.0;
    }
    let mut set = JoinSet::new();
    for target in targets {
        let target = target.clone();
        set.spawn(async move {
            bounded(per_target, None, connect_latency(&target)).await
        });
    }
    let mut total = 0.0;
    while let Some(joined) = set.join_next().await {
        total += match joined {
            Ok(Some(rtt)) => latency_quality(rtt),
            _ => 0.0,
        };
    }
    10.0 * total / targets.len() as f64
}

fn latency_quality(rtt: Duration) -> f64 {
    match rtt.as_millis() {
        0..=100 => 1.0,
        101..=300 => 0.7,
        301..=1000 => 0.4,
        _ => 0.2,
    }
}
