// Deterministic fakes for the provider, observer and storage seams

use crate::discovery::{DiscoveryEvent, PeerDiscoveryProvider};
use crate::finalizer::{ConnectionStore, InMemoryConnectionStore};
use crate::ranging::RangingProvider;
use crate::verifier::VerificationObserver;
use crate::{PeerCandidate, PeerId, ProximityError, RangingSample, Result, VerificationResult, VerificationState};
use async_trait::async_trait;
use shared::{Connection, Identity};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

const FAKE_CHANNEL_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What `FakeDiscoveryProvider::connect` does
#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    /// Emit `SessionEstablished` with this remote identity
    Establish(Identity),
    /// Emit `SessionFailed` with this reason
    Fail(String),
    /// Return an error from `connect` itself
    Error(ProximityError),
    /// Never resolve; the state machine has to time out or lose the peer
    Pending,
}

struct DiscoveryState {
    unavailable: Option<String>,
    behavior: ConnectBehavior,
    sender: Option<mpsc::Sender<DiscoveryEvent>>,
    identity: Option<Identity>,
    connects: Vec<PeerId>,
    starts: usize,
    stops: usize,
}

/// Scriptable in-process discovery transport
pub struct FakeDiscoveryProvider {
    state: Mutex<DiscoveryState>,
}

impl FakeDiscoveryProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DiscoveryState {
                unavailable: None,
                behavior: ConnectBehavior::Pending,
                sender: None,
                identity: None,
                connects: Vec::new(),
                starts: 0,
                stops: 0,
            }),
        }
    }

    /// A device without local wireless discovery
    pub fn unavailable(reason: impl Into<String>) -> Self {
        let fake = Self::new();
        lock(&fake.state).unavailable = Some(reason.into());
        fake
    }

    pub fn with_connect_behavior(self, behavior: ConnectBehavior) -> Self {
        self.set_connect_behavior(behavior);
        self
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        lock(&self.state).behavior = behavior;
    }

    /// Push an event to the current subscriber; false when not started
    pub fn emit(&self, event: DiscoveryEvent) -> bool {
        match lock(&self.state).sender.as_ref() {
            Some(sender) => sender.try_send(event).is_ok(),
            None => false,
        }
    }

    pub fn appear(&self, peer_id: &str, display_name: &str) -> bool {
        self.emit(DiscoveryEvent::PeerAppeared(PeerCandidate::new(peer_id, display_name)))
    }

    pub fn lose(&self, peer_id: &str) -> bool {
        self.emit(DiscoveryEvent::PeerLost(peer_id.to_string()))
    }

    pub fn establish(&self, peer_id: &str, remote: Identity) -> bool {
        self.emit(DiscoveryEvent::SessionEstablished {
            peer_id: peer_id.to_string(),
            remote,
        })
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).sender.is_some()
    }

    pub fn start_count(&self) -> usize {
        lock(&self.state).starts
    }

    pub fn stop_count(&self) -> usize {
        lock(&self.state).stops
    }

    pub fn connect_calls(&self) -> Vec<PeerId> {
        lock(&self.state).connects.clone()
    }

    pub fn advertised_identity(&self) -> Option<Identity> {
        lock(&self.state).identity.clone()
    }
}

impl Default for FakeDiscoveryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerDiscoveryProvider for FakeDiscoveryProvider {
    fn start(&self, identity: &Identity) -> Result<mpsc::Receiver<DiscoveryEvent>> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.unavailable {
            return Err(ProximityError::DiscoveryUnavailable(reason.clone()));
        }

        let (tx, rx) = mpsc::channel(FAKE_CHANNEL_CAPACITY);
        state.sender = Some(tx);
        state.identity = Some(identity.clone());
        state.starts += 1;
        Ok(rx)
    }

    async fn connect(&self, peer_id: &PeerId) -> Result<()> {
        let (behavior, sender) = {
            let mut state = lock(&self.state);
            state.connects.push(peer_id.clone());
            (state.behavior.clone(), state.sender.clone())
        };

        let event = match behavior {
            ConnectBehavior::Establish(remote) => DiscoveryEvent::SessionEstablished {
                peer_id: peer_id.clone(),
                remote,
            },
            ConnectBehavior::Fail(reason) => DiscoveryEvent::SessionFailed {
                peer_id: peer_id.clone(),
                reason,
            },
            ConnectBehavior::Error(error) => return Err(error),
            ConnectBehavior::Pending => return Ok(()),
        };

        match sender {
            Some(sender) => sender
                .send(event)
                .await
                .map_err(|_| ProximityError::NetworkError("discovery stopped".to_string())),
            None => Err(ProximityError::NetworkError("discovery not started".to_string())),
        }
    }

    fn stop(&self) {
        let mut state = lock(&self.state);
        state.sender = None;
        state.stops += 1;
    }

    fn name(&self) -> &str {
        "fake-discovery"
    }
}

struct RangingState {
    available: bool,
    start_error: Option<ProximityError>,
    scripted: Vec<RangingSample>,
    sender: Option<mpsc::Sender<RangingSample>>,
    starts: usize,
    stops: usize,
}

/// Scriptable ranging capability
pub struct FakeRangingProvider {
    state: Mutex<RangingState>,
}

impl FakeRangingProvider {
    pub fn available() -> Self {
        Self::with_availability(true)
    }

    pub fn unavailable() -> Self {
        Self::with_availability(false)
    }

    fn with_availability(available: bool) -> Self {
        Self {
            state: Mutex::new(RangingState {
                available,
                start_error: None,
                scripted: Vec::new(),
                sender: None,
                starts: 0,
                stops: 0,
            }),
        }
    }

    /// Samples delivered as soon as ranging starts
    pub fn with_samples(self, samples: Vec<RangingSample>) -> Self {
        lock(&self.state).scripted = samples;
        self
    }

    /// Make `start` fail after availability was reported
    pub fn with_start_error(self, error: ProximityError) -> Self {
        lock(&self.state).start_error = Some(error);
        self
    }

    pub fn push_sample(&self, sample: RangingSample) -> bool {
        match lock(&self.state).sender.as_ref() {
            Some(sender) => sender.try_send(sample).is_ok(),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).sender.is_some()
    }

    pub fn start_count(&self) -> usize {
        lock(&self.state).starts
    }

    pub fn stop_count(&self) -> usize {
        lock(&self.state).stops
    }
}

#[async_trait]
impl RangingProvider for FakeRangingProvider {
    async fn is_available(&self, _peer_id: &PeerId) -> bool {
        lock(&self.state).available
    }

    async fn start(&self, _peer_id: &PeerId) -> Result<mpsc::Receiver<RangingSample>> {
        let mut state = lock(&self.state);
        state.starts += 1;
        if let Some(error) = state.start_error.clone() {
            return Err(error);
        }

        let (tx, rx) = mpsc::channel(FAKE_CHANNEL_CAPACITY);
        for sample in &state.scripted {
            let _ = tx.try_send(*sample);
        }
        state.sender = Some(tx);
        Ok(rx)
    }

    fn stop(&self) {
        let mut state = lock(&self.state);
        state.sender = None;
        state.stops += 1;
    }

    fn name(&self) -> &str {
        "fake-ranging"
    }
}

/// Observer that records every callback on channels
pub struct RecordingObserver {
    states_tx: mpsc::UnboundedSender<VerificationState>,
    states_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<VerificationState>>,
    history: Mutex<Vec<VerificationState>>,
    completions: Mutex<Vec<Connection>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        let (states_tx, states_rx) = mpsc::unbounded_channel();
        Self {
            states_tx,
            states_rx: tokio::sync::Mutex::new(states_rx),
            history: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
        }
    }

    /// Next state change not yet consumed, waiting up to `timeout`
    pub async fn next_state(&self, timeout: Duration) -> Option<VerificationState> {
        let mut rx = self.states_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Consume state changes until one matches `predicate`
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> Option<VerificationState>
    where
        F: FnMut(&VerificationState) -> bool,
    {
        let mut rx = self.states_rx.lock().await;
        tokio::time::timeout(timeout, async {
            while let Some(state) = rx.recv().await {
                if predicate(&state) {
                    return Some(state);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Every state published so far, in order
    pub fn history(&self) -> Vec<VerificationState> {
        lock(&self.history).clone()
    }

    pub fn completions(&self) -> Vec<Connection> {
        lock(&self.completions).clone()
    }
}

impl Default for RecordingObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl VerificationObserver for RecordingObserver {
    fn on_state_change(&self, state: &VerificationState) {
        lock(&self.history).push(state.clone());
        let _ = self.states_tx.send(state.clone());
    }

    fn on_verification_complete(&self, connection: &Connection) {
        lock(&self.completions).push(connection.clone());
    }
}

/// Store that fails the first `failures` saves, then behaves like memory
pub struct FailingConnectionStore {
    remaining_failures: AtomicUsize,
    attempts: AtomicUsize,
    delay: Option<Duration>,
    inner: InMemoryConnectionStore,
}

impl FailingConnectionStore {
    pub fn new(failures: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            delay: None,
            inner: InMemoryConnectionStore::new(),
        }
    }

    /// Hold every save for `delay`, widening race windows
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn saved(&self) -> Vec<Connection> {
        self.inner.connections().await
    }
}

#[async_trait]
impl ConnectionStore for FailingConnectionStore {
    async fn save_connection(&self, result: &VerificationResult, local: &Identity) -> Result<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ProximityError::PersistenceError("storage offline".to_string()));
        }

        self.inner.save_connection(result, local).await
    }
}
