use crate::error::ErrorReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{Identity, VerificationMethod};
use uuid::Uuid;

/// Transport-local identifier for a peer
pub type PeerId = String;

/// A nearby peer reported by a discovery provider
///
/// Peer ids are scoped to the transport that produced them and are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCandidate {
    pub peer_id: PeerId,
    pub display_name: String,
}

impl PeerCandidate {
    pub fn new(peer_id: impl Into<PeerId>, display_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Channel through which the remote identity was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Wireless,
    Qr,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Wireless => write!(f, "wireless"),
            Transport::Qr => write!(f, "qr"),
        }
    }
}

/// Confidence attached to a ranging sample, ordered low to high
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// One distance reading from a ranging provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangingSample {
    pub distance_meters: f64,
    pub confidence: Confidence,
    pub captured_at: DateTime<Utc>,
}

impl RangingSample {
    pub fn new(distance_meters: f64, confidence: Confidence) -> Self {
        Self {
            distance_meters,
            confidence,
            captured_at: Utc::now(),
        }
    }
}

/// Terminal artifact of a verified session, consumed by the finalizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub session_id: Uuid,
    pub peer_identity: Identity,
    pub method: VerificationMethod,
    pub distance_meters: Option<f64>,
    pub verified_at: DateTime<Utc>,
}

/// Externally visible state of the verification state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VerificationState {
    Idle,
    Scanning,
    /// Peers currently in range, in order of appearance
    Found { peers: Vec<PeerCandidate> },
    Connecting { peer: PeerCandidate },
    Measuring { peer: PeerCandidate, remote: Identity },
    Verified { result: VerificationResult },
    Error { reason: ErrorReason },
}

impl VerificationState {
    pub fn name(&self) -> &'static str {
        match self {
            VerificationState::Idle => "idle",
            VerificationState::Scanning => "scanning",
            VerificationState::Found { .. } => "found",
            VerificationState::Connecting { .. } => "connecting",
            VerificationState::Measuring { .. } => "measuring",
            VerificationState::Verified { .. } => "verified",
            VerificationState::Error { .. } => "error",
        }
    }

    /// Discovery is running and no peer has been committed to yet
    pub fn is_scanning(&self) -> bool {
        matches!(
            self,
            VerificationState::Scanning | VerificationState::Found { .. }
        )
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationState::Verified { .. })
    }
}

impl std::fmt::Display for VerificationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationState::Found { peers } => write!(f, "found({} peers)", peers.len()),
            VerificationState::Connecting { peer } => write!(f, "connecting({})", peer.peer_id),
            VerificationState::Measuring { peer, .. } => write!(f, "measuring({})", peer.peer_id),
            VerificationState::Verified { result } => write!(f, "verified({})", result.method),
            VerificationState::Error { reason } => write!(f, "error({})", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}
