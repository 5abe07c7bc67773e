// Verification core - single-writer transition logic, free of I/O
//
// Operations and session-tagged events go in, `Action`s come out. The
// orchestrator in `verifier` executes the actions and feeds results back as
// new events, so every state change happens here, one input at a time.

use crate::discovery::DiscoveryEvent;
use crate::error::{ErrorReason, ProximityError, Result};
use crate::qr::QrPayload;
use crate::ranging::RangingWindow;
use crate::session::VerificationSession;
use crate::{PeerCandidate, PeerId, RangingSample, Transport, VerificationResult, VerificationState};
use chrono::{DateTime, Utc};
use shared::{Identity, VerificationConfig, VerificationMethod};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Discovery,
    Connect,
    Ranging,
    SessionExpiry,
}

/// A specific arming of a timer; re-arming the same kind bumps `seq`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub kind: TimerKind,
    pub seq: u64,
}

/// Inputs produced outside the core, always tagged with their session
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Discovery(DiscoveryEvent),
    ConnectFailed { peer_id: PeerId, error: String },
    RangingAvailability { peer_id: PeerId, available: bool },
    RangingStartFailed { peer_id: PeerId, error: ProximityError },
    RangingSample(RangingSample),
    RangingEnded,
    TimerFired(TimerId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub session_id: Uuid,
    pub event: Event,
}

impl TaggedEvent {
    pub fn new(session_id: Uuid, event: Event) -> Self {
        Self { session_id, event }
    }
}

/// Side effects requested by the core, executed in order
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    BeginSession(Uuid),
    EndSession(Uuid),
    StartDiscovery { session_id: Uuid, identity: Identity },
    StopDiscovery,
    Connect { session_id: Uuid, peer_id: PeerId },
    CheckRanging { session_id: Uuid, peer_id: PeerId },
    StartRanging { session_id: Uuid, peer_id: PeerId },
    StopRanging,
    StartTimer { session_id: Uuid, timer: TimerId, after: Duration },
    CancelTimer(TimerKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryStatus {
    Inactive,
    Starting,
    Active,
    Unavailable(String),
}

/// Outcome of `start_scanning` / `retry` as seen by the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStatus {
    Discovering,
    /// Wireless discovery is unavailable; offer the QR code instead
    QrOnly { reason: String },
    AlreadyScanning,
}

pub struct VerificationCore {
    config: VerificationConfig,
    identity: Option<Identity>,
    state: VerificationState,
    session: Option<VerificationSession>,
    discovery: DiscoveryStatus,
    ranging_active: bool,
    window: Option<RangingWindow>,
    timers: HashMap<TimerKind, u64>,
    next_timer_seq: u64,
}

impl VerificationCore {
    pub fn new(config: VerificationConfig) -> Self {
        Self {
            config,
            identity: None,
            state: VerificationState::Idle,
            session: None,
            discovery: DiscoveryStatus::Inactive,
            ranging_active: false,
            window: None,
            timers: HashMap::new(),
            next_timer_seq: 0,
        }
    }

    pub fn state(&self) -> &VerificationState {
        &self.state
    }

    pub fn session(&self) -> Option<&VerificationSession> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.session_id)
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn discovery_status(&self) -> &DiscoveryStatus {
        &self.discovery
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Set the local identity used by every session started afterwards
    pub fn configure(&mut self, identity: Identity) -> Result<()> {
        identity.validate()?;
        info!(user_id = %identity.user_id, "Local identity configured");
        self.identity = Some(identity);
        Ok(())
    }

    pub fn start_scanning(&mut self, now: DateTime<Utc>) -> Result<Vec<Action>> {
        let identity = self.identity.clone().ok_or(ProximityError::NotConfigured)?;

        if self.state.is_scanning() {
            debug!("Already scanning");
            return Ok(Vec::new());
        }

        Ok(self.begin_scanning(identity, now))
    }

    /// Discovery started for `session_id`; arm the discovery timeout
    pub fn discovery_started(&mut self, session_id: Uuid) -> Vec<Action> {
        if !self.is_current(session_id) {
            return Vec::new();
        }

        self.discovery = DiscoveryStatus::Active;
        let mut actions = Vec::new();
        if matches!(self.state, VerificationState::Scanning) {
            self.arm(TimerKind::Discovery, self.config.discovery_timeout(), &mut actions);
        }
        actions
    }

    /// Discovery could not start; keep the session alive for the QR path
    pub fn discovery_unavailable(
        &mut self,
        session_id: Uuid,
        reason: String,
        now: DateTime<Utc>,
    ) -> Vec<Action> {
        if !self.is_current(session_id) {
            return Vec::new();
        }

        warn!(session_id = %session_id, reason = %reason, "Discovery unavailable, QR fallback only");
        self.discovery = DiscoveryStatus::Unavailable(reason);

        let mut actions = Vec::new();
        self.cancel(TimerKind::Discovery, &mut actions);
        let remaining = self
            .session
            .as_ref()
            .map(|s| s.remaining(now))
            .unwrap_or_default();
        self.arm(TimerKind::SessionExpiry, remaining, &mut actions);
        actions
    }

    pub fn connect_to(&mut self, peer_id: &str) -> Result<Vec<Action>> {
        if self.identity.is_none() {
            return Err(ProximityError::NotConfigured);
        }

        let peer = match &self.state {
            VerificationState::Scanning => None,
            VerificationState::Found { peers } => {
                peers.iter().find(|p| p.peer_id == peer_id).cloned()
            }
            other => {
                return Err(ProximityError::InvalidState {
                    operation: "connect_to",
                    state: other.name(),
                })
            }
        }
        .ok_or_else(|| ProximityError::PeerNotFound(peer_id.to_string()))?;

        let session_id = self.session_id().ok_or(ProximityError::Unavailable)?;

        let mut actions = Vec::new();
        self.cancel(TimerKind::Discovery, &mut actions);
        actions.push(Action::Connect {
            session_id,
            peer_id: peer.peer_id.clone(),
        });
        self.arm(TimerKind::Connect, self.config.connect_timeout(), &mut actions);

        info!(session_id = %session_id, peer_id = %peer.peer_id, "Connecting to peer");
        self.state = VerificationState::Connecting { peer };
        Ok(actions)
    }

    /// Build the QR offer for the live session
    pub fn generate_qr_data(&self, now: DateTime<Utc>) -> Result<QrPayload> {
        let session = self.session.as_ref().ok_or(ProximityError::Unavailable)?;

        match self.state {
            VerificationState::Scanning
            | VerificationState::Found { .. }
            | VerificationState::Connecting { .. } => {}
            ref other => {
                return Err(ProximityError::InvalidState {
                    operation: "generate_qr_data",
                    state: other.name(),
                })
            }
        }

        Ok(QrPayload::offer(session, now, self.config.qr_offer_ttl_chrono()))
    }

    /// Accept a scanned offer and move straight to `Verified`
    ///
    /// Rejected payloads leave the state untouched so the user can rescan.
    pub fn process_scanned_qr(
        &mut self,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<(VerificationResult, Vec<Action>)> {
        let identity = self.identity.clone().ok_or(ProximityError::NotConfigured)?;

        if self.state.is_verified() {
            return Err(ProximityError::InvalidState {
                operation: "process_scanned_qr",
                state: self.state.name(),
            });
        }

        let payload = QrPayload::from_text(text)?;
        payload.validate(now)?;
        if payload.user_id == identity.user_id {
            return Err(ProximityError::InvalidInput(
                "cannot verify against your own code".to_string(),
            ));
        }
        let remote = payload.identity();
        remote.validate()?;

        let mut actions = Vec::new();
        if self.session.is_none() {
            self.begin_session(identity, Transport::Qr, now, &mut actions);
        }
        actions.extend(self.stop_providers());

        let result = self.verify(remote, Transport::Qr, VerificationMethod::Qr, None, now);
        debug!(offer_session_id = %payload.session_id, "Accepted scanned QR offer");
        Ok((result, actions))
    }

    pub fn retry(&mut self, now: DateTime<Utc>) -> Result<Vec<Action>> {
        if !matches!(self.state, VerificationState::Error { .. }) {
            return Err(ProximityError::InvalidState {
                operation: "retry",
                state: self.state.name(),
            });
        }
        let identity = self.identity.clone().ok_or(ProximityError::NotConfigured)?;

        Ok(self.begin_scanning(identity, now))
    }

    /// Tear everything down and return to `Idle`; safe to repeat
    pub fn stop_scanning(&mut self) -> Vec<Action> {
        let actions = self.teardown();
        if !matches!(self.state, VerificationState::Idle) {
            info!(from = %self.state.name(), "Verification cancelled");
            self.state = VerificationState::Idle;
        }
        actions
    }

    /// Result and local identity of the verified session
    pub fn verified_result(&self) -> Result<(VerificationResult, Identity)> {
        match (&self.state, &self.session) {
            (VerificationState::Verified { result }, Some(session)) => {
                Ok((result.clone(), session.local_identity.clone()))
            }
            (state, _) => Err(ProximityError::InvalidState {
                operation: "finalize_verification",
                state: state.name(),
            }),
        }
    }

    pub fn handle(&mut self, tagged: TaggedEvent, now: DateTime<Utc>) -> Vec<Action> {
        if !self.is_current(tagged.session_id) {
            debug!(
                error = %ProximityError::SessionSuperseded(tagged.session_id),
                "Dropping stale event"
            );
            return Vec::new();
        }

        match tagged.event {
            Event::Discovery(DiscoveryEvent::PeerAppeared(candidate)) => self.on_peer_appeared(candidate),
            Event::Discovery(DiscoveryEvent::PeerLost(peer_id)) => self.on_peer_lost(peer_id),
            Event::Discovery(DiscoveryEvent::SessionEstablished { peer_id, remote }) => {
                self.on_session_established(peer_id, remote)
            }
            Event::Discovery(DiscoveryEvent::SessionFailed { peer_id, reason }) => {
                self.on_connect_failed(peer_id, reason)
            }
            Event::ConnectFailed { peer_id, error } => self.on_connect_failed(peer_id, error),
            Event::RangingAvailability { peer_id, available } => {
                self.on_ranging_availability(peer_id, available, now)
            }
            Event::RangingStartFailed { peer_id, error } => self.on_ranging_start_failed(peer_id, error, now),
            Event::RangingSample(sample) => self.on_ranging_sample(sample, now),
            Event::RangingEnded => match self.state {
                VerificationState::Measuring { .. } => {
                    self.fail(ErrorReason::RangingFailed("ranging stream ended".to_string()))
                }
                _ => Vec::new(),
            },
            Event::TimerFired(timer) => self.on_timer(timer),
        }
    }

    fn on_peer_appeared(&mut self, candidate: PeerCandidate) -> Vec<Action> {
        let mut peers = match &self.state {
            VerificationState::Scanning => Vec::new(),
            VerificationState::Found { peers } => peers.clone(),
            other => {
                debug!(peer_id = %candidate.peer_id, state = %other.name(), "Ignoring peer appearance");
                return Vec::new();
            }
        };

        if let Some(existing) = peers.iter_mut().find(|p| p.peer_id == candidate.peer_id) {
            existing.display_name = candidate.display_name;
        } else if peers.len() >= self.config.max_nearby_peers {
            debug!(peer_id = %candidate.peer_id, "Nearby peer list full, ignoring");
            return Vec::new();
        } else {
            info!(peer_id = %candidate.peer_id, name = %candidate.display_name, "Peer appeared");
            peers.push(candidate);
        }

        let mut actions = Vec::new();
        if matches!(self.state, VerificationState::Scanning) {
            self.cancel(TimerKind::Discovery, &mut actions);
        }
        self.state = VerificationState::Found { peers };
        actions
    }

    fn on_peer_lost(&mut self, peer_id: PeerId) -> Vec<Action> {
        match &self.state {
            VerificationState::Found { peers } => {
                let remaining: Vec<PeerCandidate> = peers
                    .iter()
                    .filter(|p| p.peer_id != peer_id)
                    .cloned()
                    .collect();
                if remaining.len() == peers.len() {
                    return Vec::new();
                }

                info!(peer_id = %peer_id, "Peer lost");
                let mut actions = Vec::new();
                if remaining.is_empty() {
                    self.state = VerificationState::Scanning;
                    self.arm(TimerKind::Discovery, self.config.discovery_timeout(), &mut actions);
                } else {
                    self.state = VerificationState::Found { peers: remaining };
                }
                actions
            }
            VerificationState::Connecting { peer } | VerificationState::Measuring { peer, .. }
                if peer.peer_id == peer_id =>
            {
                self.fail(ErrorReason::PeerLost(peer_id))
            }
            _ => Vec::new(),
        }
    }

    fn on_session_established(&mut self, peer_id: PeerId, remote: Identity) -> Vec<Action> {
        let local_user = self.identity.as_ref().map(|i| i.user_id.clone());

        match &self.state {
            VerificationState::Scanning | VerificationState::Found { .. } => {
                if let Err(e) = remote.validate() {
                    warn!(peer_id = %peer_id, error = %e, "Ignoring inbound session with invalid identity");
                    return Vec::new();
                }
                if local_user.as_deref() == Some(remote.user_id.as_str()) {
                    warn!(peer_id = %peer_id, "Ignoring inbound session from our own identity");
                    return Vec::new();
                }

                let peer = match &self.state {
                    VerificationState::Found { peers } => {
                        peers.iter().find(|p| p.peer_id == peer_id).cloned()
                    }
                    _ => None,
                }
                .unwrap_or_else(|| PeerCandidate::new(peer_id.clone(), remote.display_name.clone()));

                info!(peer_id = %peer_id, remote_user = %remote.user_id, "Adopting inbound session");
                let mut actions = Vec::new();
                self.cancel(TimerKind::Discovery, &mut actions);
                self.arm(TimerKind::Connect, self.config.connect_timeout(), &mut actions);
                self.state = VerificationState::Connecting { peer };
                actions.extend(self.resolve_remote(peer_id, remote));
                actions
            }
            VerificationState::Connecting { peer } if peer.peer_id == peer_id => {
                if self.session.as_ref().is_some_and(|s| s.remote_identity.is_some()) {
                    debug!(peer_id = %peer_id, "Duplicate session establishment");
                    return Vec::new();
                }
                if let Err(e) = remote.validate() {
                    return self.fail(ErrorReason::ConnectionFailed(format!(
                        "invalid remote identity: {}",
                        e
                    )));
                }
                if local_user.as_deref() == Some(remote.user_id.as_str()) {
                    return self.fail(ErrorReason::ConnectionFailed(
                        "peer presented our own identity".to_string(),
                    ));
                }

                info!(peer_id = %peer_id, remote_user = %remote.user_id, "Session established");
                self.resolve_remote(peer_id, remote)
            }
            other => {
                debug!(peer_id = %peer_id, state = %other.name(), "Ignoring session establishment");
                Vec::new()
            }
        }
    }

    fn resolve_remote(&mut self, peer_id: PeerId, remote: Identity) -> Vec<Action> {
        match self.session.as_mut() {
            Some(session) => {
                session.resolve_remote(remote, Transport::Wireless);
                vec![Action::CheckRanging {
                    session_id: session.session_id,
                    peer_id,
                }]
            }
            None => Vec::new(),
        }
    }

    fn on_connect_failed(&mut self, peer_id: PeerId, reason: String) -> Vec<Action> {
        let resolved = self.session.as_ref().is_some_and(|s| s.remote_identity.is_some());
        match &self.state {
            VerificationState::Connecting { peer } if peer.peer_id == peer_id && !resolved => {
                self.fail(ErrorReason::ConnectionFailed(reason))
            }
            _ => {
                debug!(peer_id = %peer_id, reason = %reason, "Ignoring connect failure");
                Vec::new()
            }
        }
    }

    fn on_ranging_availability(
        &mut self,
        peer_id: PeerId,
        available: bool,
        now: DateTime<Utc>,
    ) -> Vec<Action> {
        let peer = match &self.state {
            VerificationState::Connecting { peer } if peer.peer_id == peer_id => peer.clone(),
            _ => return Vec::new(),
        };
        let (session_id, remote) = match &self.session {
            Some(VerificationSession {
                session_id,
                remote_identity: Some(remote),
                ..
            }) => (*session_id, remote.clone()),
            _ => return Vec::new(),
        };

        if !available {
            info!(peer_id = %peer_id, "Ranging unavailable, verifying without distance");
            let actions = self.stop_providers();
            self.verify(remote, Transport::Wireless, VerificationMethod::WirelessNoRanging, None, now);
            return actions;
        }

        let mut actions = Vec::new();
        self.cancel(TimerKind::Connect, &mut actions);
        self.window = Some(RangingWindow::new(
            self.config.ranging_window_size,
            self.config.proximity_threshold_meters,
        ));
        self.ranging_active = true;
        actions.push(Action::StartRanging { session_id, peer_id });
        self.arm(TimerKind::Ranging, self.config.ranging_timeout(), &mut actions);

        info!(session_id = %session_id, peer_id = %peer.peer_id, "Measuring distance");
        self.state = VerificationState::Measuring { peer, remote };
        actions
    }

    fn on_ranging_start_failed(
        &mut self,
        peer_id: PeerId,
        error: ProximityError,
        now: DateTime<Utc>,
    ) -> Vec<Action> {
        let remote = match &self.state {
            VerificationState::Measuring { peer, remote } if peer.peer_id == peer_id => remote.clone(),
            _ => return Vec::new(),
        };

        match error {
            ProximityError::RangingUnavailable(reason) => {
                info!(peer_id = %peer_id, reason = %reason, "Ranging unavailable, verifying without distance");
                let actions = self.stop_providers();
                self.verify(remote, Transport::Wireless, VerificationMethod::WirelessNoRanging, None, now);
                actions
            }
            other => self.fail(ErrorReason::RangingFailed(other.to_string())),
        }
    }

    fn on_ranging_sample(&mut self, sample: RangingSample, now: DateTime<Utc>) -> Vec<Action> {
        let remote = match &self.state {
            VerificationState::Measuring { remote, .. } => remote.clone(),
            _ => return Vec::new(),
        };
        let Some(window) = self.window.as_mut() else {
            return Vec::new();
        };

        debug!(
            distance = sample.distance_meters,
            confidence = ?sample.confidence,
            "Ranging sample"
        );
        match window.push(sample) {
            Some(distance) => {
                let actions = self.stop_providers();
                self.verify(
                    remote,
                    Transport::Wireless,
                    VerificationMethod::WirelessRanging,
                    Some(distance),
                    now,
                );
                actions
            }
            None => Vec::new(),
        }
    }

    fn on_timer(&mut self, timer: TimerId) -> Vec<Action> {
        if self.timers.get(&timer.kind) != Some(&timer.seq) {
            debug!(timer = ?timer, "Ignoring stale timer");
            return Vec::new();
        }
        self.timers.remove(&timer.kind);

        match (timer.kind, &self.state) {
            (TimerKind::Discovery, VerificationState::Scanning) => self.fail(ErrorReason::DiscoveryTimeout),
            (TimerKind::Connect, VerificationState::Connecting { .. }) => {
                self.fail(ErrorReason::ConnectionFailed("timed out".to_string()))
            }
            (TimerKind::Ranging, VerificationState::Measuring { .. }) => self.fail(ErrorReason::RangingTimeout),
            (TimerKind::SessionExpiry, state)
                if state.is_scanning() || matches!(state, VerificationState::Connecting { .. }) =>
            {
                self.fail(ErrorReason::SessionExpired)
            }
            (kind, state) => {
                debug!(timer = ?kind, state = %state.name(), "Timer fired in unrelated state");
                Vec::new()
            }
        }
    }

    fn begin_scanning(&mut self, identity: Identity, now: DateTime<Utc>) -> Vec<Action> {
        let mut actions = self.teardown();
        self.begin_session(identity.clone(), Transport::Wireless, now, &mut actions);

        if let Some(session_id) = self.session_id() {
            actions.push(Action::StartDiscovery {
                session_id,
                identity,
            });
            self.discovery = DiscoveryStatus::Starting;
            info!(session_id = %session_id, "Scanning for nearby peers");
        }
        self.state = VerificationState::Scanning;
        actions
    }

    fn begin_session(
        &mut self,
        identity: Identity,
        transport: Transport,
        now: DateTime<Utc>,
        actions: &mut Vec<Action>,
    ) {
        let session =
            VerificationSession::new(identity, transport, now, self.config.qr_offer_ttl_chrono());
        debug!(session_id = %session.session_id, transport = %transport, "Session started");
        actions.push(Action::BeginSession(session.session_id));
        self.session = Some(session);
    }

    fn verify(
        &mut self,
        remote: Identity,
        transport: Transport,
        method: VerificationMethod,
        distance_meters: Option<f64>,
        now: DateTime<Utc>,
    ) -> VerificationResult {
        self.window = None;
        let session_id = match self.session.as_mut() {
            Some(session) => {
                session.resolve_remote(remote.clone(), transport);
                session.session_id
            }
            None => Uuid::nil(),
        };

        let result = VerificationResult {
            session_id,
            peer_identity: remote,
            method,
            distance_meters,
            verified_at: now,
        };
        info!(
            session_id = %session_id,
            method = %method,
            distance = ?distance_meters,
            peer_user = %result.peer_identity.user_id,
            "Peer verified"
        );
        self.state = VerificationState::Verified {
            result: result.clone(),
        };
        result
    }

    fn fail(&mut self, reason: ErrorReason) -> Vec<Action> {
        warn!(
            session_id = ?self.session_id(),
            from = %self.state.name(),
            reason = %reason,
            "Verification failed"
        );
        let actions = self.teardown();
        self.state = VerificationState::Error { reason };
        actions
    }

    /// Stop ranging before discovery, then drop every armed timer
    fn stop_providers(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.ranging_active {
            self.ranging_active = false;
            actions.push(Action::StopRanging);
        }
        if matches!(self.discovery, DiscoveryStatus::Starting | DiscoveryStatus::Active) {
            actions.push(Action::StopDiscovery);
        }
        self.discovery = DiscoveryStatus::Inactive;

        let mut kinds: Vec<TimerKind> = self.timers.drain().map(|(kind, _)| kind).collect();
        kinds.sort_by_key(|kind| *kind as u8);
        actions.extend(kinds.into_iter().map(Action::CancelTimer));
        actions
    }

    fn teardown(&mut self) -> Vec<Action> {
        let mut actions = self.stop_providers();
        self.window = None;
        if let Some(session) = self.session.take() {
            debug!(session_id = %session.session_id, "Session ended");
            actions.push(Action::EndSession(session.session_id));
        }
        actions
    }

    fn arm(&mut self, kind: TimerKind, after: Duration, actions: &mut Vec<Action>) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        self.next_timer_seq += 1;
        let timer = TimerId {
            kind,
            seq: self.next_timer_seq,
        };
        self.timers.insert(kind, timer.seq);
        actions.push(Action::StartTimer {
            session_id,
            timer,
            after,
        });
    }

    fn cancel(&mut self, kind: TimerKind, actions: &mut Vec<Action>) {
        if self.timers.remove(&kind).is_some() {
            actions.push(Action::CancelTimer(kind));
        }
    }

    fn is_current(&self, session_id: Uuid) -> bool {
        self.session_id() == Some(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Confidence;

    fn alice() -> Identity {
        Identity::new("user-alice", "Alice")
    }

    fn bob() -> Identity {
        Identity::new("user-bob", "Bob")
    }

    fn core() -> VerificationCore {
        let mut core = VerificationCore::new(VerificationConfig::default());
        core.configure(alice()).unwrap();
        core
    }

    fn scanning(core: &mut VerificationCore) -> Uuid {
        core.start_scanning(Utc::now()).unwrap();
        let session_id = core.session_id().unwrap();
        core.discovery_started(session_id);
        session_id
    }

    fn event(core: &mut VerificationCore, session_id: Uuid, event: Event) -> Vec<Action> {
        core.handle(TaggedEvent::new(session_id, event), Utc::now())
    }

    fn appeared(peer_id: &str) -> Event {
        Event::Discovery(DiscoveryEvent::PeerAppeared(PeerCandidate::new(peer_id, "Bob")))
    }

    fn established(peer_id: &str) -> Event {
        Event::Discovery(DiscoveryEvent::SessionEstablished {
            peer_id: peer_id.to_string(),
            remote: bob(),
        })
    }

    fn armed(actions: &[Action], kind: TimerKind) -> Option<TimerId> {
        actions.iter().find_map(|a| match a {
            Action::StartTimer { timer, .. } if timer.kind == kind => Some(*timer),
            _ => None,
        })
    }

    #[test]
    fn test_requires_identity() {
        let mut core = VerificationCore::new(VerificationConfig::default());
        assert_eq!(core.start_scanning(Utc::now()), Err(ProximityError::NotConfigured));
        assert_eq!(core.connect_to("peer"), Err(ProximityError::NotConfigured));
        assert_eq!(core.state(), &VerificationState::Idle);
    }

    #[test]
    fn test_configure_rejects_invalid_identity() {
        let mut core = VerificationCore::new(VerificationConfig::default());
        assert!(matches!(
            core.configure(Identity::new("", "Nobody")),
            Err(ProximityError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_start_scanning_actions() {
        let mut core = core();
        let actions = core.start_scanning(Utc::now()).unwrap();
        let session_id = core.session_id().unwrap();

        assert_eq!(actions[0], Action::BeginSession(session_id));
        assert!(matches!(&actions[1], Action::StartDiscovery { identity, .. } if identity == &alice()));
        assert_eq!(core.state(), &VerificationState::Scanning);

        let actions = core.discovery_started(session_id);
        assert!(armed(&actions, TimerKind::Discovery).is_some());
        assert_eq!(core.discovery_status(), &DiscoveryStatus::Active);
    }

    #[test]
    fn test_start_scanning_is_idempotent() {
        let mut core = core();
        let session_id = scanning(&mut core);
        assert!(core.start_scanning(Utc::now()).unwrap().is_empty());
        assert_eq!(core.session_id(), Some(session_id));
    }

    #[test]
    fn test_found_tracks_peers() {
        let mut core = core();
        let session_id = scanning(&mut core);

        let actions = event(&mut core, session_id, appeared("p1"));
        assert!(actions.contains(&Action::CancelTimer(TimerKind::Discovery)));
        event(&mut core, session_id, appeared("p2"));
        event(&mut core, session_id, appeared("p1"));

        match core.state() {
            VerificationState::Found { peers } => {
                let ids: Vec<&str> = peers.iter().map(|p| p.peer_id.as_str()).collect();
                assert_eq!(ids, vec!["p1", "p2"]);
            }
            other => panic!("Expected Found, got {:?}", other),
        }

        event(&mut core, session_id, Event::Discovery(DiscoveryEvent::PeerLost("p1".into())));
        let actions = event(&mut core, session_id, Event::Discovery(DiscoveryEvent::PeerLost("p2".into())));
        assert_eq!(core.state(), &VerificationState::Scanning);
        assert!(armed(&actions, TimerKind::Discovery).is_some());
    }

    #[test]
    fn test_peer_list_capped() {
        let config = VerificationConfig {
            max_nearby_peers: 2,
            ..Default::default()
        };
        let mut core = VerificationCore::new(config);
        core.configure(alice()).unwrap();
        let session_id = scanning(&mut core);

        for id in ["p1", "p2", "p3"] {
            event(&mut core, session_id, appeared(id));
        }
        match core.state() {
            VerificationState::Found { peers } => assert_eq!(peers.len(), 2),
            other => panic!("Expected Found, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_to_unknown_peer() {
        let mut core = core();
        let session_id = scanning(&mut core);
        event(&mut core, session_id, appeared("p1"));

        assert_eq!(
            core.connect_to("ghost"),
            Err(ProximityError::PeerNotFound("ghost".to_string()))
        );
        assert!(matches!(core.state(), VerificationState::Found { .. }));
    }

    #[test]
    fn test_connect_to_from_idle_is_invalid() {
        let mut core = core();
        assert!(matches!(
            core.connect_to("p1"),
            Err(ProximityError::InvalidState { operation: "connect_to", state: "idle" })
        ));
    }

    #[test]
    fn test_wireless_ranging_path() {
        let mut core = core();
        let session_id = scanning(&mut core);
        event(&mut core, session_id, appeared("p1"));

        let actions = core.connect_to("p1").unwrap();
        assert!(actions.contains(&Action::Connect { session_id, peer_id: "p1".into() }));
        assert!(armed(&actions, TimerKind::Connect).is_some());

        let actions = event(&mut core, session_id, established("p1"));
        assert_eq!(actions, vec![Action::CheckRanging { session_id, peer_id: "p1".into() }]);

        let actions = event(
            &mut core,
            session_id,
            Event::RangingAvailability { peer_id: "p1".into(), available: true },
        );
        assert!(actions.contains(&Action::StartRanging { session_id, peer_id: "p1".into() }));
        assert!(armed(&actions, TimerKind::Ranging).is_some());
        assert!(matches!(core.state(), VerificationState::Measuring { .. }));

        for distance in [0.3, 0.3] {
            let sample = RangingSample::new(distance, Confidence::High);
            assert!(event(&mut core, session_id, Event::RangingSample(sample)).is_empty());
        }
        let actions = event(
            &mut core,
            session_id,
            Event::RangingSample(RangingSample::new(0.28, Confidence::High)),
        );
        assert_eq!(actions[0], Action::StopRanging);
        assert_eq!(actions[1], Action::StopDiscovery);

        let (result, local) = core.verified_result().unwrap();
        assert_eq!(result.method, VerificationMethod::WirelessRanging);
        assert_eq!(result.session_id, session_id);
        assert_eq!(result.peer_identity, bob());
        assert_eq!(local, alice());
        assert!((result.distance_meters.unwrap() - 0.293).abs() < 0.01);
    }

    #[test]
    fn test_no_ranging_path() {
        let mut core = core();
        let session_id = scanning(&mut core);
        event(&mut core, session_id, appeared("p1"));
        core.connect_to("p1").unwrap();
        event(&mut core, session_id, established("p1"));

        let actions = event(
            &mut core,
            session_id,
            Event::RangingAvailability { peer_id: "p1".into(), available: false },
        );
        assert!(armed(&actions, TimerKind::Ranging).is_none());
        let (result, _) = core.verified_result().unwrap();
        assert_eq!(result.method, VerificationMethod::WirelessNoRanging);
        assert_eq!(result.distance_meters, None);
    }

    #[test]
    fn test_ranging_start_unavailable_routes_to_no_ranging() {
        let mut core = core();
        let session_id = scanning(&mut core);
        event(&mut core, session_id, appeared("p1"));
        core.connect_to("p1").unwrap();
        event(&mut core, session_id, established("p1"));
        event(&mut core, session_id, Event::RangingAvailability { peer_id: "p1".into(), available: true });

        event(
            &mut core,
            session_id,
            Event::RangingStartFailed {
                peer_id: "p1".into(),
                error: ProximityError::RangingUnavailable("gone".into()),
            },
        );
        assert_eq!(
            core.verified_result().unwrap().0.method,
            VerificationMethod::WirelessNoRanging
        );
    }

    #[test]
    fn test_ranging_start_failure_is_error() {
        let mut core = core();
        let session_id = scanning(&mut core);
        event(&mut core, session_id, appeared("p1"));
        core.connect_to("p1").unwrap();
        event(&mut core, session_id, established("p1"));
        event(&mut core, session_id, Event::RangingAvailability { peer_id: "p1".into(), available: true });

        event(
            &mut core,
            session_id,
            Event::RangingStartFailed {
                peer_id: "p1".into(),
                error: ProximityError::BleError("adapter off".into()),
            },
        );
        assert!(matches!(
            core.state(),
            VerificationState::Error { reason: ErrorReason::RangingFailed(_) }
        ));
        assert!(core.session_id().is_none());
    }

    #[test]
    fn test_peer_lost_during_connect() {
        let mut core = core();
        let session_id = scanning(&mut core);
        event(&mut core, session_id, appeared("p1"));
        core.connect_to("p1").unwrap();

        let actions = event(&mut core, session_id, Event::Discovery(DiscoveryEvent::PeerLost("p1".into())));
        assert_eq!(
            core.state(),
            &VerificationState::Error { reason: ErrorReason::PeerLost("p1".into()) }
        );
        assert!(actions.contains(&Action::EndSession(session_id)));

        // The connect result arriving afterwards is stale
        assert!(event(&mut core, session_id, established("p1")).is_empty());
    }

    #[test]
    fn test_connect_failure() {
        let mut core = core();
        let session_id = scanning(&mut core);
        event(&mut core, session_id, appeared("p1"));
        core.connect_to("p1").unwrap();

        event(
            &mut core,
            session_id,
            Event::ConnectFailed { peer_id: "p1".into(), error: "refused".into() },
        );
        assert_eq!(
            core.state(),
            &VerificationState::Error { reason: ErrorReason::ConnectionFailed("refused".into()) }
        );
    }

    #[test]
    fn test_inbound_session_is_adopted() {
        let mut core = core();
        let session_id = scanning(&mut core);

        let actions = event(&mut core, session_id, established("p9"));
        assert!(actions.contains(&Action::CheckRanging { session_id, peer_id: "p9".into() }));
        match core.state() {
            VerificationState::Connecting { peer } => {
                assert_eq!(peer.peer_id, "p9");
                assert_eq!(peer.display_name, "Bob");
            }
            other => panic!("Expected Connecting, got {:?}", other),
        }
    }

    #[test]
    fn test_timers() {
        let mut core = core();
        let session_id = scanning(&mut core);
        let timer = TimerId { kind: TimerKind::Discovery, seq: 1 };

        event(&mut core, session_id, Event::TimerFired(timer));
        assert_eq!(
            core.state(),
            &VerificationState::Error { reason: ErrorReason::DiscoveryTimeout }
        );
    }

    #[test]
    fn test_stale_timer_ignored() {
        let mut core = core();
        let session_id = scanning(&mut core);
        event(&mut core, session_id, appeared("p1"));
        let actions = event(&mut core, session_id, Event::Discovery(DiscoveryEvent::PeerLost("p1".into())));
        let rearmed = armed(&actions, TimerKind::Discovery).unwrap();

        // The first arming was cancelled when the peer appeared
        let stale = TimerId { kind: TimerKind::Discovery, seq: rearmed.seq - 1 };
        assert!(event(&mut core, session_id, Event::TimerFired(stale)).is_empty());
        assert_eq!(core.state(), &VerificationState::Scanning);

        event(&mut core, session_id, Event::TimerFired(rearmed));
        assert!(matches!(core.state(), VerificationState::Error { .. }));
    }

    #[test]
    fn test_discovery_unavailable_keeps_session() {
        let mut core = core();
        core.start_scanning(Utc::now()).unwrap();
        let session_id = core.session_id().unwrap();

        let actions = core.discovery_unavailable(session_id, "no wifi".into(), Utc::now());
        let expiry = armed(&actions, TimerKind::SessionExpiry).unwrap();
        assert_eq!(core.state(), &VerificationState::Scanning);
        assert!(core.generate_qr_data(Utc::now()).is_ok());

        event(&mut core, session_id, Event::TimerFired(expiry));
        assert_eq!(
            core.state(),
            &VerificationState::Error { reason: ErrorReason::SessionExpired }
        );
        // Nothing to stop, discovery never ran
        assert_eq!(core.stop_scanning(), Vec::new());
    }

    #[test]
    fn test_generate_qr_data() {
        let mut core = core();
        assert_eq!(core.generate_qr_data(Utc::now()), Err(ProximityError::Unavailable));

        let session_id = scanning(&mut core);
        let payload = core.generate_qr_data(Utc::now()).unwrap();
        assert_eq!(payload.session_id, session_id);
        assert_eq!(payload.user_id, "user-alice");
        assert_eq!(payload.expires_at - payload.issued_at, 120);
    }

    #[test]
    fn test_process_scanned_qr_from_idle() {
        let mut bob_core = VerificationCore::new(VerificationConfig::default());
        bob_core.configure(bob()).unwrap();
        scanning(&mut bob_core);
        let text = bob_core.generate_qr_data(Utc::now()).unwrap().to_text().unwrap();

        let mut core = core();
        let (result, actions) = core.process_scanned_qr(&text, Utc::now()).unwrap();
        assert!(matches!(actions[0], Action::BeginSession(_)));
        assert_eq!(result.method, VerificationMethod::Qr);
        assert_eq!(result.peer_identity, bob());
        assert_eq!(Some(result.session_id), core.session_id());
        assert_eq!(core.session().unwrap().transport, Transport::Qr);
        assert!(core.state().is_verified());

        // A second scan in Verified is rejected
        assert!(matches!(
            core.process_scanned_qr(&text, Utc::now()),
            Err(ProximityError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_process_scanned_qr_rejections_keep_state() {
        let mut core = core();
        let session_id = scanning(&mut core);

        let own = core.generate_qr_data(Utc::now()).unwrap().to_text().unwrap();
        assert!(matches!(
            core.process_scanned_qr(&own, Utc::now()),
            Err(ProximityError::InvalidInput(_))
        ));

        let mut expired = core.generate_qr_data(Utc::now()).unwrap();
        expired.user_id = "user-bob".into();
        expired.issued_at -= 600;
        expired.expires_at = expired.issued_at + 60;
        assert_eq!(
            core.process_scanned_qr(&expired.to_text().unwrap(), Utc::now()).map(|r| r.0),
            Err(ProximityError::QrExpired)
        );

        assert!(matches!(
            core.process_scanned_qr("garbage", Utc::now()),
            Err(ProximityError::QrDecode(_))
        ));

        assert_eq!(core.state(), &VerificationState::Scanning);
        assert_eq!(core.session_id(), Some(session_id));
    }

    #[test]
    fn test_retry_only_from_error() {
        let mut core = core();
        let first = scanning(&mut core);
        assert!(matches!(core.retry(Utc::now()), Err(ProximityError::InvalidState { .. })));

        event(&mut core, first, Event::TimerFired(TimerId { kind: TimerKind::Discovery, seq: 1 }));
        core.retry(Utc::now()).unwrap();
        let second = core.session_id().unwrap();
        assert_ne!(first, second);
        assert_eq!(core.state(), &VerificationState::Scanning);
    }

    #[test]
    fn test_stop_is_repeatable() {
        let mut core = core();
        let session_id = scanning(&mut core);

        let actions = core.stop_scanning();
        assert!(actions.contains(&Action::StopDiscovery));
        assert!(actions.contains(&Action::EndSession(session_id)));
        assert_eq!(core.state(), &VerificationState::Idle);
        assert!(core.stop_scanning().is_empty());
    }

    #[test]
    fn test_new_session_supersedes_old() {
        let mut core = core();
        let old = scanning(&mut core);
        event(&mut core, old, appeared("p1"));
        core.connect_to("p1").unwrap();

        core.stop_scanning();
        let new = scanning(&mut core);
        assert_ne!(old, new);

        assert!(event(&mut core, old, established("p1")).is_empty());
        assert!(event(&mut core, old, appeared("p2")).is_empty());
        assert_eq!(core.state(), &VerificationState::Scanning);
    }

    #[test]
    fn test_verified_result_requires_verified() {
        let core = core();
        assert!(matches!(
            core.verified_result(),
            Err(ProximityError::InvalidState { operation: "finalize_verification", .. })
        ));
    }
}
