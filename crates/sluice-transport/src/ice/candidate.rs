use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Component id used for every candidate (single data stream).
pub const COMPONENT_ID: u16 = 1;

/// The kind of network path a candidate represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    /// Address of a local interface.
    Host,
    /// Public address learned through STUN (server reflexive).
    Srflx,
    /// Address of a TURN relay.
    Relay,
}

impl CandidateType {
    /// RFC 8445 type preference. Strictly ordered host > srflx > relay.
    pub fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::Srflx => 100,
            CandidateType::Relay => 0,
        }
    }
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateType::Host => write!(f, "host"),
            CandidateType::Srflx => write!(f, "srflx"),
            CandidateType::Relay => write!(f, "relay"),
        }
    }
}

/// One possible network path to try. Built per connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub kind: CandidateType,
    pub address: IpAddr,
    pub port: u16,
    pub priority: u32,
    pub foundation: String,
    pub component: u16,
}

impl IceCandidate {
    /// Build a candidate; `index` is its discovery position within its tier.
    pub fn new(kind: CandidateType, address: IpAddr, port: u16, index: usize) -> Self {
        Self {
            kind,
            address,
            port,
            priority: compute_priority(kind, index, COMPONENT_ID),
            foundation: format!("{kind}{index}"),
            component: COMPONENT_ID,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl std::fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}:{} (prio {}, foundation {})",
            self.kind, self.address, self.port, self.priority, self.foundation
        )
    }
}

/// RFC 8445 §5.1.2.1 priority:
/// `2^24 * type_pref + 2^8 * local_pref + (256 - component)`.
///
/// The type preference dominates, so every host candidate outranks every
/// srflx candidate, which outranks every relay candidate. Within a tier,
/// earlier discovery gets a higher local preference.
pub fn compute_priority(kind: CandidateType, index: usize, component: u16) -> u32 {
    let local_pref = 65_535u32.saturating_sub(index.min(65_535) as u32);
    let component = u32::from(component.clamp(1, 256));
    (kind.type_preference() << 24) + (local_pref << 8) + (256 - component)
}

/// Sort candidates by descending priority, keeping discovery order on ties.
pub fn sort_candidates(candidates: &mut [IceCandidate]) {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
}
