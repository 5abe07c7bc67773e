// mDNS-based WiFi discovery implementation

use crate::discovery::{DiscoveryEvent, PeerDiscoveryProvider};
use crate::handshake::{self, Hello};
use crate::{PeerCandidate, PeerId, ProximityError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use shared::Identity;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SERVICE_TYPE: &str = "_realmet._tcp.local.";
const INSTANCE_PREFIX: &str = "realmet-";
const PROTOCOL_VERSION: &str = "1";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct ActiveDiscovery {
    daemon: ServiceDaemon,
    fullname: String,
    token: CancellationToken,
    events: mpsc::Sender<DiscoveryEvent>,
    peers: Arc<DashMap<PeerId, SocketAddr>>,
    hello: Hello,
}

/// Advertises the local identity over mDNS and browses for peers
///
/// Each device runs a small TCP listener whose port is advertised in the
/// service record; sessions are established with a hello exchange on it.
pub struct MdnsDiscoveryProvider {
    peer_id: PeerId,
    active: Mutex<Option<ActiveDiscovery>>,
}

impl MdnsDiscoveryProvider {
    pub fn new() -> Self {
        Self::with_peer_id(Uuid::new_v4().simple().to_string())
    }

    pub fn with_peer_id(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            active: Mutex::new(None),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn is_running(&self) -> bool {
        self.active().is_some()
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveDiscovery>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn instance_name(&self) -> String {
        format!("{}{}", INSTANCE_PREFIX, self.peer_id)
    }

    fn bind_listener() -> Result<TcpListener> {
        let listener = std::net::TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
            .map_err(|e| ProximityError::DiscoveryUnavailable(format!("Failed to bind listener: {}", e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| ProximityError::DiscoveryUnavailable(format!("Failed to configure listener: {}", e)))?;
        TcpListener::from_std(listener)
            .map_err(|e| ProximityError::DiscoveryUnavailable(format!("Failed to register listener: {}", e)))
    }

    fn service_info(&self, identity: &Identity, port: u16) -> Result<ServiceInfo> {
        let instance_name = self.instance_name();
        let host_name = format!("{}.local.", instance_name);
        let properties = [
            ("peer_id", self.peer_id.as_str()),
            ("name", identity.display_name.as_str()),
            ("version", PROTOCOL_VERSION),
        ];

        ServiceInfo::new(SERVICE_TYPE, &instance_name, &host_name, "", port, &properties[..])
            .map(|info| info.enable_addr_auto())
            .map_err(|e| ProximityError::DiscoveryUnavailable(format!("Failed to create service info: {}", e)))
    }

    /// Parse a resolved service into a candidate and its hello address
    fn parse_service_info(info: &ServiceInfo) -> Option<(PeerCandidate, SocketAddr)> {
        let peer_id = info.get_property_val_str("peer_id")?.to_string();
        let display_name = info.get_property_val_str("name")?.to_string();

        if let Some(version) = info.get_property_val_str("version") {
            if version != PROTOCOL_VERSION {
                warn!("Incompatible protocol version: {} (expected {})", version, PROTOCOL_VERSION);
                return None;
            }
        }

        let ip = info
            .get_addresses()
            .iter()
            .map(|ip| IpAddr::from(*ip))
            .min_by_key(|ip| ip.is_ipv6())?;

        Some((
            PeerCandidate::new(peer_id, display_name),
            SocketAddr::new(ip, info.get_port()),
        ))
    }

    /// Extract peer_id from mDNS fullname
    fn extract_peer_id(fullname: &str) -> Option<PeerId> {
        // Fullname format: "realmet-{peer_id}._realmet._tcp.local."
        let instance_name = fullname.split('.').next()?;
        instance_name
            .strip_prefix(INSTANCE_PREFIX)
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string())
    }

    fn spawn_listener(
        listener: TcpListener,
        hello: Hello,
        events: mpsc::Sender<DiscoveryEvent>,
        token: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                let (mut stream, addr) = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept hello connection: {}", e);
                            continue;
                        }
                    },
                };

                let hello = hello.clone();
                let events = events.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    let exchange = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake::respond(&mut stream, &hello));
                    let outcome = tokio::select! {
                        _ = token.cancelled() => return,
                        outcome = exchange => outcome,
                    };

                    match outcome {
                        Ok(Ok(remote)) => {
                            info!("Inbound session from peer {} ({})", remote.peer_id, addr);
                            let _ = events
                                .send(DiscoveryEvent::SessionEstablished {
                                    peer_id: remote.peer_id,
                                    remote: remote.identity,
                                })
                                .await;
                        }
                        Ok(Err(e)) => warn!("Inbound hello from {} failed: {}", addr, e),
                        Err(_) => warn!("Inbound hello from {} timed out", addr),
                    }
                });
            }

            debug!("Hello listener terminated");
        });
    }
}

impl Default for MdnsDiscoveryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerDiscoveryProvider for MdnsDiscoveryProvider {
    fn start(&self, identity: &Identity) -> Result<mpsc::Receiver<DiscoveryEvent>> {
        if self.is_running() {
            warn!("mDNS discovery already active, restarting");
            self.stop();
        }

        info!("Starting mDNS discovery for peer: {}", self.peer_id);

        let daemon = ServiceDaemon::new()
            .map_err(|e| ProximityError::DiscoveryUnavailable(format!("Failed to create mDNS daemon: {}", e)))?;
        let listener = Self::bind_listener()?;
        let port = listener
            .local_addr()
            .map_err(|e| ProximityError::DiscoveryUnavailable(format!("Failed to read listener port: {}", e)))?
            .port();

        let service_info = self.service_info(identity, port)?;
        let fullname = service_info.get_fullname().to_string();
        daemon
            .register(service_info)
            .map_err(|e| ProximityError::DiscoveryUnavailable(format!("Failed to register mDNS service: {}", e)))?;
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| ProximityError::DiscoveryUnavailable(format!("Failed to browse mDNS services: {}", e)))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let token = CancellationToken::new();
        let peers = Arc::new(DashMap::new());
        let hello = Hello::new(self.peer_id.clone(), identity.clone());

        {
            let events = events_tx.clone();
            let peers = Arc::clone(&peers);
            let token = token.clone();
            let own_peer_id = self.peer_id.clone();

            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = token.cancelled() => break,
                        event = receiver.recv_async() => match event {
                            Ok(event) => event,
                            Err(_) => break,
                        },
                    };

                    let forwarded = match event {
                        ServiceEvent::ServiceResolved(info) => {
                            debug!("mDNS service resolved: {}", info.get_fullname());
                            match Self::parse_service_info(&info) {
                                Some((candidate, _)) if candidate.peer_id == own_peer_id => None,
                                Some((candidate, addr)) => {
                                    peers.insert(candidate.peer_id.clone(), addr);
                                    Some(DiscoveryEvent::PeerAppeared(candidate))
                                }
                                None => None,
                            }
                        }
                        ServiceEvent::ServiceRemoved(_, fullname) => {
                            debug!("mDNS service removed: {}", fullname);
                            Self::extract_peer_id(&fullname)
                                .filter(|peer_id| peers.remove(peer_id).is_some())
                                .map(DiscoveryEvent::PeerLost)
                        }
                        other => {
                            debug!("Unhandled mDNS event: {:?}", other);
                            None
                        }
                    };

                    if let Some(event) = forwarded {
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                }

                debug!("mDNS browse loop terminated");
            });
        }
        Self::spawn_listener(listener, hello.clone(), events_tx.clone(), token.clone());

        *self.active() = Some(ActiveDiscovery {
            daemon,
            fullname,
            token,
            events: events_tx,
            peers,
            hello,
        });

        info!("mDNS discovery started on port {}", port);
        Ok(events_rx)
    }

    async fn connect(&self, peer_id: &PeerId) -> Result<()> {
        let (addr, hello, events, token) = {
            let active = self.active();
            let active = active
                .as_ref()
                .ok_or_else(|| ProximityError::NetworkError("mDNS discovery not running".to_string()))?;
            let addr = active
                .peers
                .get(peer_id)
                .map(|entry| *entry.value())
                .ok_or_else(|| ProximityError::PeerNotFound(peer_id.clone()))?;
            (addr, active.hello.clone(), active.events.clone(), active.token.child_token())
        };

        info!("Connecting to peer {} at {}", peer_id, addr);
        let exchange = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| ProximityError::NetworkError(format!("Failed to connect: {}", e)))?;
            handshake::initiate(&mut stream, &hello).await
        });

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                debug!("Connect to {} cancelled", peer_id);
                return Ok(());
            }
            outcome = exchange => outcome,
        };

        let event = match outcome {
            Ok(Ok(remote)) => {
                if &remote.peer_id != peer_id {
                    warn!("Peer {} answered as {}", peer_id, remote.peer_id);
                }
                DiscoveryEvent::SessionEstablished {
                    peer_id: peer_id.clone(),
                    remote: remote.identity,
                }
            }
            Ok(Err(e)) => DiscoveryEvent::SessionFailed {
                peer_id: peer_id.clone(),
                reason: e.to_string(),
            },
            Err(_) => DiscoveryEvent::SessionFailed {
                peer_id: peer_id.clone(),
                reason: "hello timed out".to_string(),
            },
        };

        events
            .send(event)
            .await
            .map_err(|_| ProximityError::NetworkError("mDNS discovery stopped".to_string()))
    }

    fn stop(&self) {
        let Some(active) = self.active().take() else {
            debug!("No active mDNS discovery to stop");
            return;
        };

        info!("Stopping mDNS discovery");
        active.token.cancel();

        if let Err(e) = active.daemon.unregister(&active.fullname) {
            warn!("Failed to unregister mDNS service: {}", e);
        }
        if let Err(e) = active.daemon.stop_browse(SERVICE_TYPE) {
            debug!("Failed to stop mDNS browse: {}", e);
        }
        if let Err(e) = active.daemon.shutdown() {
            debug!("Failed to shut down mDNS daemon: {}", e);
        }

        info!("mDNS discovery stopped");
    }

    fn name(&self) -> &str {
        "mdns"
    }
}
