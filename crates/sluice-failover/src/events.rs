//! What the orchestrator reports to the outside: status events, per-transport
//! status snapshots and ledger records.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::NetworkType;
use crate::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Failed within the cooldown window.
    CoolingDown,
    /// `is_available` returned false or timed out.
    Unavailable,
}

/// Milestones pushed to the optional status sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    ClassificationComplete {
        network_type: NetworkType,
        restrictive: bool,
        restrictions: usize,
    },
    AttemptStarted {
        transfer_id: String,
        transport: String,
        attempt: u32,
    },
    AttemptFailed {
        transfer_id: String,
        transport: String,
        category: ErrorCategory,
        error: String,
    },
    TransportSkipped {
        transfer_id: String,
        transport: String,
        reason: SkipReason,
    },
    Succeeded {
        transfer_id: String,
        transport: String,
        attempts: u32,
        elapsed: Duration,
    },
    Exhausted {
        transfer_id: String,
        attempts: u32,
    },
    Cancelled {
        transfer_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Cancelled,
}

/// One attempt, as handed to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub direction: Direction,
    pub outcome: Outcome,
    pub transport: String,
    pub bytes: u64,
    pub duration: Duration,
    pub category: Option<ErrorCategory>,
    /// Unix ms when the attempt ended.
    pub timestamp: u64,
}

/// Audit sink for attempt records.
///
/// Called fire-and-forget: a failing ledger is logged and never fails the
/// transfer.
#[async_trait::async_trait]
pub trait TransferLedger: Send + Sync {
    async fn record(&self, record: TransferRecord) -> Result<(), String>;
}

/// Per-transport status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportStatus {
    pub name: String,
    pub priority: i32,
    pub success_rate: f64,
    pub avg_latency: Option<Duration>,
    pub reliability: f64,
    pub attempts: u64,
    pub failures: u64,
    pub cooling_down: bool,
    pub last_category: Option<ErrorCategory>,
}

/// How a successful transfer went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub transfer_id: String,
    /// Transport that completed the transfer.
    pub transport: String,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let event = StatusEvent::TransportSkipped {
            transfer_id: "t1".into(),
            transport: "ice".into(),
            reason: SkipReason::CoolingDown,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "transport_skipped");
        assert_eq!(json["reason"], "cooling_down");
    }

    #[test]
    fn record_roundtrips_through_json() {
        let record = TransferRecord {
            transfer_id: "t1".into(),
            direction: Direction::Send,
            outcome: Outcome::Failure,
            transport: "tcp-direct".into(),
            bytes: 0,
            duration: Duration::from_millis(120),
            category: Some(ErrorCategory::PortBlock),
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: TransferRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
