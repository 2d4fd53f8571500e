//! sluice transport layer.
//!
//! Defines the [`TransportEndpoint`] contract every transfer protocol
//! implements, plus three implementations:
//!
//! - [`DirectTcpEndpoint`] (`tcp-direct`): framed stream to a known peer
//! - [`IceEndpoint`] (`ice`): host/STUN/TURN candidates tested in priority order
//! - [`HttpsRelayEndpoint`] (`https-relay`): store-and-forward over HTTPS
//!
//! Payloads are opaque bytes; encryption happens before they get here.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use sluice_transport::{DirectTcpEndpoint, TransferMetadata, TransportConfig, TransportEndpoint};
//!
//! # async fn example() -> Result<(), sluice_transport::TransportError> {
//! let config = TransportConfig::new().peer_addr("192.0.2.10:9009".parse().unwrap());
//! let mut endpoint = DirectTcpEndpoint::new();
//! endpoint.setup(&config).await?;
//!
//! let meta = TransferMetadata::new("report.pdf.enc", 11, "9f86d081");
//! endpoint.send(b"ciphertext!", &meta).await?;
//! endpoint.close().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod direct;
pub mod dns;
mod endpoint;
mod error;
mod https;
pub mod ice;
mod metadata;
pub mod protocol;

pub use config::{ProxySettings, TransportConfig, DEFAULT_ICE_PORT, DEFAULT_STUN_SERVERS};
pub use direct::{accept_push, serve_pull, DirectTcpEndpoint};
pub use endpoint::TransportEndpoint;
pub use error::{error_chain, TransportError};
pub use https::{transfer_url, HttpsRelayEndpoint};
pub use ice::{CandidateType, IceCandidate, IceConnection, IceEndpoint, IceEstablisher};
pub use metadata::{now_ms, TransferMetadata};
