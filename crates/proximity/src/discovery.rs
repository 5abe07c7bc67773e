// Peer discovery - capability interface over a local wireless transport

use crate::{PeerCandidate, PeerId, Result};
use async_trait::async_trait;
use shared::Identity;
use tokio::sync::mpsc;

/// Events emitted by a running discovery provider
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    PeerAppeared(PeerCandidate),
    PeerLost(PeerId),
    /// A hello exchange completed, outbound or inbound
    SessionEstablished { peer_id: PeerId, remote: Identity },
    SessionFailed { peer_id: PeerId, reason: String },
}

impl DiscoveryEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            DiscoveryEvent::PeerAppeared(candidate) => &candidate.peer_id,
            DiscoveryEvent::PeerLost(peer_id)
            | DiscoveryEvent::SessionEstablished { peer_id, .. }
            | DiscoveryEvent::SessionFailed { peer_id, .. } => peer_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryEvent::PeerAppeared(_) => "peer_appeared",
            DiscoveryEvent::PeerLost(_) => "peer_lost",
            DiscoveryEvent::SessionEstablished { .. } => "session_established",
            DiscoveryEvent::SessionFailed { .. } => "session_failed",
        }
    }
}

/// Advertise the local identity and browse for peers
///
/// `start` must fail synchronously with `DiscoveryUnavailable` when the device
/// has no usable transport. `stop` must end advertising and browsing even when
/// a `connect` is still in flight.
#[async_trait]
pub trait PeerDiscoveryProvider: Send + Sync {
    fn start(&self, identity: &Identity) -> Result<mpsc::Receiver<DiscoveryEvent>>;

    /// Ask for a session with `peer_id`
    ///
    /// Completion is reported as `SessionEstablished` or `SessionFailed` on the
    /// event stream. An `Err` here means the attempt could not be started.
    async fn connect(&self, peer_id: &PeerId) -> Result<()>;

    fn stop(&self);

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_peer_id() {
        let appeared = DiscoveryEvent::PeerAppeared(PeerCandidate::new("p1", "Alice"));
        assert_eq!(appeared.peer_id(), "p1");
        assert_eq!(appeared.kind(), "peer_appeared");

        let established = DiscoveryEvent::SessionEstablished {
            peer_id: "p2".to_string(),
            remote: Identity::new("user-2", "Bob"),
        };
        assert_eq!(established.peer_id(), "p2");
        assert_eq!(established.kind(), "session_established");
    }
}
