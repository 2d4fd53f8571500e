use crate::{TransferMetadata, TransportConfig, TransportError};

/// Contract every transport protocol implements.
///
/// Endpoints are reused sequentially across transfers; concurrent transfers
/// on one instance are never issued (the orchestrator allows one active
/// transfer at a time). Errors must carry the underlying text unchanged so
/// they can be classified by keyword.
#[async_trait::async_trait]
pub trait TransportEndpoint: Send + Sync {
    /// Apply the session configuration. Called once before first use.
    async fn setup(&mut self, config: &TransportConfig) -> Result<(), TransportError>;

    /// Deliver an opaque (already encrypted) payload to the peer.
    async fn send(&self, payload: &[u8], meta: &TransferMetadata) -> Result<(), TransportError>;

    /// Fetch the payload of the transfer described by `meta`.
    async fn receive(&self, meta: &TransferMetadata) -> Result<Vec<u8>, TransportError>;

    /// Cheap reachability check. Callers bound it with their own timeout.
    async fn is_available(&self) -> bool;

    /// Static preference; higher values are tried first on equal scores.
    fn priority(&self) -> i32;

    /// Stable transport name used for scoring, cooldowns, and reports.
    fn name(&self) -> &str;

    /// Release any resources held by the endpoint.
    async fn close(&self) -> Result<(), TransportError>;
}
