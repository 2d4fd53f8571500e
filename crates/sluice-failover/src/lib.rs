//! sluice failover engine.
//!
//! Moves opaque payloads between peers over whichever transport the local
//! network allows. [`AdaptiveOrchestrator`] ranks the registered
//! [`TransportEndpoint`](sluice_transport::TransportEndpoint)s by learned
//! reliability, falls through them on failure and reports one aggregate
//! error when everything fails. Failures are categorized by
//! [`ErrorClassifier`]; a background [`NetworkClassifier`] fingerprints the
//! network (proxies, port blocking, DPI, corporate DNS) so ordering and
//! backoff adapt to it.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use sluice_failover::{AdaptiveOrchestrator, OrchestratorConfig};
//! use sluice_transport::TransferMetadata;
//!
//! # async fn example() -> Result<(), sluice_failover::FailoverError> {
//! let orchestrator = AdaptiveOrchestrator::with_default_transports(OrchestratorConfig::new()).await?;
//!
//! let meta = TransferMetadata::new("report.pdf.enc", 11, "9f86d081");
//! let outcome = orchestrator.send_with_failover(b"ciphertext!", &meta).await?;
//! println!("sent via {} in {:?}", outcome.transport, outcome.elapsed);
//!
//! orchestrator.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod classify;
pub mod error;
pub mod events;
pub mod network;
mod orchestrator;
pub mod scoring;

pub use backoff::{attempt_timeout, timeout_multiplier, BackoffPolicy};
pub use classify::{
    is_transient_error, ErrorCategory, ErrorClassification, ErrorClassifier, RetryPolicy, Severity,
};
pub use error::FailoverError;
pub use events::{
    Direction, Outcome, SkipReason, StatusEvent, TransferLedger, TransferOutcome, TransferRecord,
    TransportStatus,
};
pub use network::{
    ClassifierConfig, NetworkAssessor, NetworkClassifier, NetworkProfile, NetworkRestriction,
    NetworkType, RestrictionKind,
};
pub use orchestrator::{AdaptiveOrchestrator, OrchestratorBuilder, OrchestratorConfig};
pub use scoring::{
    ProgressiveReliability, ScoringStrategy, TransportScore, WindowedReliability,
};
