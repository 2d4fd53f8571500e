//! ICE-style connectivity establishment.
//!
//! Gathers host, server-reflexive (STUN) and relay (TURN) candidates, sorts
//! them by RFC 8445 priority and tests them one at a time until a stream
//! opens. [`IceEndpoint`] runs a framed transfer over that stream.

pub mod candidate;
pub mod stun;
pub mod turn;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub use candidate::{compute_priority, sort_candidates, CandidateType, IceCandidate};
pub use turn::{TurnCredentials, TURN_PORT};

use crate::protocol::{self, ACK};
use crate::{TransferMetadata, TransportConfig, TransportEndpoint, TransportError};

const NAME: &str = "ice";

/// Tag of the probe frame written to a candidate before it is used.
pub const PROBE_TAG: &[u8] = b"SLUICE_ICE:";

/// How long a candidate test waits for the peer's acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// IPv4 addresses of local interfaces that are up and not loopback.
pub fn host_addresses() -> Vec<IpAddr> {
    netdev::get_interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && !iface.is_loopback())
        .flat_map(|iface| {
            iface
                .ipv4
                .iter()
                .map(|net| IpAddr::V4(net.addr()))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn probe_frame(transfer_id: &str) -> Vec<u8> {
    let mut frame = PROBE_TAG.to_vec();
    frame.extend_from_slice(transfer_id.as_bytes());
    frame
}

/// A stream that passed its candidate test.
#[derive(Debug)]
pub struct IceConnection {
    pub stream: TcpStream,
    pub candidate: IceCandidate,
    /// `false` when the peer stayed silent and the read timeout was taken
    /// as success.
    pub acknowledged: bool,
}

/// Candidate gathering and sequential connectivity checks.
#[derive(Debug, Clone)]
pub struct IceEstablisher {
    stun_servers: Vec<String>,
    turn_servers: Vec<String>,
    port: u16,
    stun_timeout: Duration,
    candidate_timeout: Duration,
    ack_timeout: Duration,
}

impl IceEstablisher {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            stun_servers: config.stun_servers.clone(),
            turn_servers: config.turn_servers.clone(),
            port: config.ice_port,
            stun_timeout: config.stun_timeout,
            candidate_timeout: config.candidate_timeout,
            ack_timeout: DEFAULT_ACK_TIMEOUT.min(config.candidate_timeout),
        }
    }

    /// Override how long a candidate test waits for an acknowledgement.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// One host candidate per local interface address, on the ICE port.
    pub fn host_candidates(&self) -> Vec<IceCandidate> {
        host_addresses()
            .into_iter()
            .enumerate()
            .map(|(i, ip)| IceCandidate::new(CandidateType::Host, ip, self.port, i))
            .collect()
    }

    /// Reflexive candidate from the first STUN server that answers.
    pub async fn srflx_candidate(&self) -> Option<IceCandidate> {
        for server in &self.stun_servers {
            match stun::query(server, self.stun_timeout).await {
                Ok(mapped) => {
                    tracing::debug!("ice: {server} reports reflexive address {mapped}");
                    return Some(IceCandidate::new(
                        CandidateType::Srflx,
                        IpAddr::V4(*mapped.ip()),
                        mapped.port(),
                        0,
                    ));
                }
                Err(e) => tracing::warn!("ice: STUN server {server} skipped: {e}"),
            }
        }
        None
    }

    /// One relay candidate per resolvable TURN server.
    pub async fn relay_candidates(&self) -> Vec<IceCandidate> {
        if self.turn_servers.is_empty() {
            return Vec::new();
        }
        let credentials = TurnCredentials::from_env();
        if credentials.is_anonymous() {
            tracing::debug!("ice: no TURN credentials configured, using anonymous identity");
        }

        let resolver = crate::dns::system_resolver();
        let mut candidates = Vec::new();
        for server in &self.turn_servers {
            match turn::resolve_relay(&resolver, server).await {
                Ok(ip) => {
                    let index = candidates.len();
                    tracing::debug!(
                        "ice: relay candidate {ip}:{TURN_PORT} via {server} as {}",
                        credentials.username
                    );
                    candidates.push(IceCandidate::new(CandidateType::Relay, ip, TURN_PORT, index));
                }
                Err(e) => tracing::warn!("ice: TURN server {server} skipped: {e}"),
            }
        }
        candidates
    }

    /// All candidates, highest priority first.
    pub async fn gather(&self) -> Vec<IceCandidate> {
        let mut candidates = self.host_candidates();
        candidates.extend(self.srflx_candidate().await);
        candidates.extend(self.relay_candidates().await);
        sort_candidates(&mut candidates);
        tracing::debug!("ice: gathered {} candidates", candidates.len());
        candidates
    }

    /// Open a stream to `candidate` and run the probe exchange.
    pub async fn test_candidate(
        &self,
        candidate: &IceCandidate,
        transfer_id: &str,
    ) -> Result<(TcpStream, bool), TransportError> {
        let addr = candidate.socket_addr();
        let check = async {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|source| TransportError::Connect {
                    endpoint: NAME.into(),
                    addr,
                    source,
                })?;
            protocol::write_framed(&mut stream, &probe_frame(transfer_id))
                .await
                .map_err(|e| TransportError::io(NAME, e))?;

            let mut byte = [0u8; 1];
            match tokio::time::timeout(self.ack_timeout, stream.read(&mut byte)).await {
                Ok(Ok(1)) if byte[0] == ACK => Ok((stream, true)),
                Ok(Ok(1)) => Err(TransportError::Frame(format!(
                    "unexpected probe reply 0x{:02x} from {addr}",
                    byte[0]
                ))),
                Ok(Ok(_)) => Err(TransportError::io(
                    NAME,
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("unexpected eof from {addr} during probe"),
                    ),
                )),
                Ok(Err(e)) => Err(TransportError::io(NAME, e)),
                // A silent peer is accepted unacknowledged
                Err(_) => Ok((stream, false)),
            }
        };

        tokio::time::timeout(self.candidate_timeout, check)
            .await
            .map_err(|_| TransportError::timeout(NAME, self.candidate_timeout))?
    }

    /// Test `candidates` in order and return the first that works.
    pub async fn connect(
        &self,
        candidates: &[IceCandidate],
        transfer_id: &str,
    ) -> Result<IceConnection, TransportError> {
        let mut last_err = None;
        for candidate in candidates {
            match self.test_candidate(candidate, transfer_id).await {
                Ok((stream, acknowledged)) => {
                    if acknowledged {
                        tracing::info!("ice: connected via {candidate}");
                    } else {
                        tracing::info!("ice: connected via {candidate} (unacknowledged)");
                    }
                    return Ok(IceConnection {
                        stream,
                        candidate: candidate.clone(),
                        acknowledged,
                    });
                }
                Err(e) => {
                    tracing::debug!("ice: candidate {candidate} failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        Err(TransportError::CandidatesExhausted {
            attempted: candidates.len(),
            last: last_err.map_or_else(|| "no candidates gathered".to_string(), |e| e.to_string()),
        })
    }

    /// Gather, sort and test candidates for `transfer_id`.
    pub async fn establish(&self, transfer_id: &str) -> Result<IceConnection, TransportError> {
        let candidates = self.gather().await;
        self.connect(&candidates, transfer_id).await
    }
}

/// Transport that reaches the peer through the best working ICE candidate.
pub struct IceEndpoint {
    establisher: Option<IceEstablisher>,
    timeout: Duration,
    max_payload_size: usize,
    priority: i32,
    closed: AtomicBool,
}

impl IceEndpoint {
    pub fn new() -> Self {
        let defaults = TransportConfig::default();
        Self {
            establisher: None,
            timeout: defaults.timeout,
            max_payload_size: defaults.max_payload_size,
            priority: 70,
            closed: AtomicBool::new(false),
        }
    }

    /// Override the static priority (default: 70).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn establisher(&self) -> Result<&IceEstablisher, TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed {
                endpoint: NAME.into(),
            });
        }
        self.establisher
            .as_ref()
            .ok_or_else(|| TransportError::NotConfigured {
                endpoint: NAME.into(),
                reason: "setup has not run".into(),
            })
    }
}

impl Default for IceEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TransportEndpoint for IceEndpoint {
    async fn setup(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        self.establisher = Some(IceEstablisher::from_config(config));
        self.timeout = config.timeout;
        self.max_payload_size = config.max_payload_size;
        self.closed.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn send(&self, payload: &[u8], meta: &TransferMetadata) -> Result<(), TransportError> {
        let mut conn = self.establisher()?.establish(&meta.transfer_id).await?;
        let exchange = async {
            protocol::write_transfer(&mut conn.stream, meta, payload).await?;
            protocol::read_ack(&mut conn.stream).await
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::timeout(NAME, self.timeout))?
    }

    async fn receive(&self, meta: &TransferMetadata) -> Result<Vec<u8>, TransportError> {
        let mut conn = self.establisher()?.establish(&meta.transfer_id).await?;
        let max = self.max_payload_size;
        let exchange = async {
            protocol::write_framed(&mut conn.stream, &protocol::pull_request(&meta.transfer_id))
                .await
                .map_err(|e| TransportError::io(NAME, e))?;
            let (_, payload) = protocol::read_transfer(&mut conn.stream, max).await?;
            conn.stream
                .write_all(&[ACK])
                .await
                .map_err(|e| TransportError::io(NAME, e))?;
            Ok(payload)
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::timeout(NAME, self.timeout))?
    }

    async fn is_available(&self) -> bool {
        let Ok(establisher) = self.establisher() else {
            return false;
        };
        !host_addresses().is_empty()
            || !establisher.stun_servers.is_empty()
            || !establisher.turn_servers.is_empty()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        NAME
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ── Peer side ───────────────────────────────────────────────────────

/// Read a candidate probe and acknowledge it. Returns the probed transfer id.
pub async fn answer_probe(stream: &mut TcpStream) -> Result<String, TransportError> {
    let frame = protocol::read_framed(stream, protocol::MAX_HEADER_SIZE).await?;
    let id = frame
        .strip_prefix(PROBE_TAG)
        .ok_or_else(|| TransportError::Frame("expected ICE probe".into()))?;
    let id = String::from_utf8_lossy(id).into_owned();
    stream
        .write_all(&[ACK])
        .await
        .map_err(|e| TransportError::io(NAME, e))?;
    Ok(id)
}
