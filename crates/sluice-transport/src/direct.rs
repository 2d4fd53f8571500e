//! Direct TCP transport: one framed stream per transfer to a known peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::protocol::{self, ACK};
use crate::{TransferMetadata, TransportConfig, TransportEndpoint, TransportError};

const NAME: &str = "tcp-direct";

/// Transport that connects straight to `TransportConfig::peer_addr`.
///
/// Works on open networks and LANs; first to fail behind strict firewalls.
pub struct DirectTcpEndpoint {
    peer: Option<SocketAddr>,
    timeout: Duration,
    max_payload_size: usize,
    priority: i32,
    closed: AtomicBool,
}

impl DirectTcpEndpoint {
    pub fn new() -> Self {
        let defaults = TransportConfig::default();
        Self {
            peer: None,
            timeout: defaults.timeout,
            max_payload_size: defaults.max_payload_size,
            priority: 80,
            closed: AtomicBool::new(false),
        }
    }

    /// Override the static priority (default: 80).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn peer(&self) -> Result<SocketAddr, TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed {
                endpoint: NAME.into(),
            });
        }
        self.peer.ok_or_else(|| TransportError::NotConfigured {
            endpoint: NAME.into(),
            reason: "no peer address".into(),
        })
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(TransportError::Connect {
                endpoint: NAME.into(),
                addr,
                source,
            }),
            Err(_) => Err(TransportError::timeout(NAME, self.timeout)),
        }
    }
}

impl Default for DirectTcpEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TransportEndpoint for DirectTcpEndpoint {
    async fn setup(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        self.peer = config.peer_addr;
        self.timeout = config.timeout;
        self.max_payload_size = config.max_payload_size;
        self.closed.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn send(&self, payload: &[u8], meta: &TransferMetadata) -> Result<(), TransportError> {
        let addr = self.peer()?;
        let mut stream = self.connect(addr).await?;

        let exchange = async {
            protocol::write_transfer(&mut stream, meta, payload).await?;
            protocol::read_ack(&mut stream).await
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(NAME, self.timeout)),
        }
    }

    async fn receive(&self, meta: &TransferMetadata) -> Result<Vec<u8>, TransportError> {
        let addr = self.peer()?;
        let mut stream = self.connect(addr).await?;
        let max = self.max_payload_size;

        let exchange = async {
            protocol::write_framed(&mut stream, &protocol::pull_request(&meta.transfer_id))
                .await
                .map_err(|e| TransportError::io(NAME, e))?;
            let (got, payload) = protocol::read_transfer(&mut stream, max).await?;
            if got.transfer_id != meta.transfer_id {
                return Err(TransportError::Frame(format!(
                    "peer answered transfer {} instead of {}",
                    got.transfer_id, meta.transfer_id
                )));
            }
            stream
                .write_all(&[ACK])
                .await
                .map_err(|e| TransportError::io(NAME, e))?;
            Ok(payload)
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(NAME, self.timeout)),
        }
    }

    /// Opens and drops a TCP connection to the peer, so a listening peer
    /// sees one accepted stream that ends before its first frame.
    async fn is_available(&self) -> bool {
        match self.peer() {
            Ok(addr) => TcpStream::connect(addr).await.is_ok(),
            Err(_) => false,
        }
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

/// Accept one pushed transfer on `stream` and acknowledge it.
///
/// A stream that closes before any frame (an availability check) fails with
/// an eof error; callers should keep accepting.
pub async fn accept_push(
    stream: &mut TcpStream,
    max_payload: usize,
) -> Result<(TransferMetadata, Vec<u8>), TransportError> {
    let (meta, payload) = protocol::read_transfer(stream, max_payload).await?;
    stream
        .write_all(&[ACK])
        .await
        .map_err(|e| TransportError::io(NAME, e))?;
    Ok((meta, payload))
}

/// Answer one pull request on `stream` with `payload`.
///
/// Returns the transfer id the peer asked for.
pub async fn serve_pull(
    stream: &mut TcpStream,
    meta: &TransferMetadata,
    payload: &[u8],
) -> Result<String, TransportError> {
    let request = protocol::read_framed(stream, protocol::MAX_HEADER_SIZE).await?;
    let requested = request
        .strip_prefix(protocol::PULL_TAG)
        .ok_or_else(|| TransportError::Frame("expected pull request".into()))?;
    let requested = String::from_utf8_lossy(requested).into_owned();
    protocol::write_transfer(stream, meta, payload).await?;
    protocol::read_ack(stream).await?;
    Ok(requested)
}
