// Verification state machine - actor that owns the core and its providers
//
// Commands from the UI, provider events, timer expiries and async results all
// travel over one queue and are handled one at a time by the actor task.

use crate::discovery::{DiscoveryEvent, PeerDiscoveryProvider};
use crate::error::{ErrorContext, ProximityError, Result};
use crate::finalizer::ConnectionFinalizer;
use crate::machine::{Action, DiscoveryStatus, Event, ScanStatus, TaggedEvent, TimerId, TimerKind, VerificationCore};
use crate::qr::QrPayload;
use crate::ranging::RangingProvider;
use crate::{PeerId, VerificationResult, VerificationState};
use chrono::Utc;
use shared::{Connection, Identity, VerificationConfig};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INPUT_QUEUE_CAPACITY: usize = 256;

/// UI collaborator notified from the actor task
pub trait VerificationObserver: Send + Sync {
    fn on_state_change(&self, state: &VerificationState);

    /// Called once per session, after its connection was persisted
    fn on_verification_complete(&self, connection: &Connection);
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Configure(Identity, Reply<()>),
    StartScanning(Reply<ScanStatus>),
    ConnectTo(PeerId, Reply<()>),
    ProcessScannedQr(String, Reply<VerificationResult>),
    GenerateQrData(Reply<QrPayload>),
    Retry(Reply<ScanStatus>),
    StopScanning(Reply<()>),
    Finalize(Reply<Connection>),
    Shutdown(Reply<()>),
}

enum Input {
    Command(Command),
    Event(TaggedEvent),
    Finalized {
        session_id: Uuid,
        outcome: Result<Connection>,
        reply: Option<Reply<Connection>>,
    },
}

/// Handle to the verification actor
///
/// Cheap to clone. The actor stops, tearing its providers down, when the last
/// handle is dropped or `shutdown()` is called.
#[derive(Clone)]
pub struct VerificationStateMachine {
    tx: mpsc::Sender<Input>,
    state: watch::Receiver<VerificationState>,
}

impl VerificationStateMachine {
    pub fn spawn(
        config: VerificationConfig,
        discovery: Arc<dyn PeerDiscoveryProvider>,
        ranging: Arc<dyn RangingProvider>,
        finalizer: Arc<ConnectionFinalizer>,
        observer: Option<Arc<dyn VerificationObserver>>,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(VerificationState::Idle);

        info!(
            discovery = %discovery.name(),
            ranging = %ranging.name(),
            auto_finalize = config.auto_finalize,
            "Starting verification state machine"
        );

        let actor = Actor {
            auto_finalize: config.auto_finalize,
            core: VerificationCore::new(config),
            rx,
            weak: tx.downgrade(),
            discovery,
            ranging,
            finalizer,
            observer,
            state_tx,
            published: VerificationState::Idle,
            session: None,
            ranging_token: None,
            timers: HashMap::new(),
            completed: HashSet::new(),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            tx,
            state: state_rx,
        })
    }

    pub async fn configure(&self, identity: Identity) -> Result<()> {
        self.request(|reply| Command::Configure(identity, reply)).await
    }

    pub async fn start_scanning(&self) -> Result<ScanStatus> {
        self.request(Command::StartScanning).await
    }

    pub async fn connect_to(&self, peer_id: impl Into<PeerId>) -> Result<()> {
        let peer_id = peer_id.into();
        self.request(|reply| Command::ConnectTo(peer_id, reply)).await
    }

    /// Accept the text decoded from a peer's QR code
    pub async fn process_scanned_qr(&self, text: impl Into<String>) -> Result<VerificationResult> {
        let text = text.into();
        self.request(|reply| Command::ProcessScannedQr(text, reply)).await
    }

    pub async fn generate_qr_data(&self) -> Result<QrPayload> {
        self.request(Command::GenerateQrData).await
    }

    pub async fn retry(&self) -> Result<ScanStatus> {
        self.request(Command::Retry).await
    }

    pub async fn stop_scanning(&self) -> Result<()> {
        self.request(Command::StopScanning).await
    }

    pub async fn finalize_verification(&self) -> Result<Connection> {
        self.request(Command::Finalize).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    pub fn state(&self) -> VerificationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<VerificationState> {
        self.state.clone()
    }

    /// Wait until the published state satisfies `predicate`
    ///
    /// Only the latest state is observed; use an observer to see every transition.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> Result<VerificationState>
    where
        F: FnMut(&VerificationState) -> bool,
    {
        let mut rx = self.state.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
            rx.changed().await.map_err(|_| ProximityError::ShutDown)?;
        }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Input::Command(make(reply)))
            .await
            .map_err(|_| ProximityError::ShutDown)?;
        rx.await.map_err(|_| ProximityError::ShutDown)?
    }
}

struct Actor {
    core: VerificationCore,
    auto_finalize: bool,
    rx: mpsc::Receiver<Input>,
    weak: mpsc::WeakSender<Input>,
    discovery: Arc<dyn PeerDiscoveryProvider>,
    ranging: Arc<dyn RangingProvider>,
    finalizer: Arc<ConnectionFinalizer>,
    observer: Option<Arc<dyn VerificationObserver>>,
    state_tx: watch::Sender<VerificationState>,
    published: VerificationState,
    session: Option<(Uuid, CancellationToken)>,
    ranging_token: Option<CancellationToken>,
    timers: HashMap<TimerKind, CancellationToken>,
    completed: HashSet<Uuid>,
}

impl Actor {
    async fn run(mut self) {
        while let Some(input) = self.rx.recv().await {
            let shutdown = match input {
                Input::Command(command) => self.on_command(command),
                Input::Event(tagged) => {
                    let actions = self.core.handle(tagged, Utc::now());
                    self.execute(actions);
                    false
                }
                Input::Finalized {
                    session_id,
                    outcome,
                    reply,
                } => {
                    self.on_finalized(session_id, outcome, reply);
                    false
                }
            };
            self.publish();

            if shutdown {
                break;
            }
        }

        let actions = self.core.stop_scanning();
        self.execute(actions);
        self.publish();
        info!("Verification state machine stopped");
    }

    fn on_command(&mut self, command: Command) -> bool {
        let now = Utc::now();
        match command {
            Command::Configure(identity, reply) => {
                let outcome = self.core.configure(identity);
                self.respond(reply, outcome);
            }
            Command::StartScanning(reply) => {
                let was_scanning = self.core.state().is_scanning();
                let outcome = match self.core.start_scanning(now) {
                    Ok(actions) => {
                        self.execute(actions);
                        Ok(self.scan_status(was_scanning))
                    }
                    Err(e) => Err(e),
                };
                self.respond(reply, outcome);
            }
            Command::ConnectTo(peer_id, reply) => {
                let outcome = self.core.connect_to(&peer_id).map(|actions| self.execute(actions));
                self.respond(reply, outcome);
            }
            Command::ProcessScannedQr(text, reply) => {
                let outcome = self.core.process_scanned_qr(&text, now).map(|(result, actions)| {
                    self.execute(actions);
                    result
                });
                if let Err(e) = &outcome {
                    debug!(error = %e, "Rejected scanned QR code");
                }
                self.respond(reply, outcome);
            }
            Command::GenerateQrData(reply) => {
                let outcome = self.core.generate_qr_data(now);
                self.respond(reply, outcome);
            }
            Command::Retry(reply) => {
                let outcome = match self.core.retry(now) {
                    Ok(actions) => {
                        self.execute(actions);
                        Ok(self.scan_status(false))
                    }
                    Err(e) => Err(e),
                };
                self.respond(reply, outcome);
            }
            Command::StopScanning(reply) => {
                let actions = self.core.stop_scanning();
                self.execute(actions);
                self.respond(reply, Ok(()));
            }
            Command::Finalize(reply) => self.begin_finalize(Some(reply)),
            Command::Shutdown(reply) => {
                let actions = self.core.stop_scanning();
                self.execute(actions);
                self.respond(reply, Ok(()));
                return true;
            }
        }
        false
    }

    /// Publish before replying so callers observe the new state on return
    fn respond<T>(&mut self, reply: Reply<T>, outcome: Result<T>) {
        self.publish();
        let _ = reply.send(outcome);
    }

    fn scan_status(&self, was_scanning: bool) -> ScanStatus {
        if was_scanning {
            return ScanStatus::AlreadyScanning;
        }
        match self.core.discovery_status() {
            DiscoveryStatus::Unavailable(reason) => ScanStatus::QrOnly {
                reason: reason.clone(),
            },
            _ => ScanStatus::Discovering,
        }
    }

    fn publish(&mut self) {
        if self.core.state() == &self.published {
            return;
        }

        let state = self.core.state().clone();
        debug!(from = %self.published.name(), to = %state, "State changed");
        self.published = state.clone();
        self.state_tx.send_replace(state.clone());
        if let Some(observer) = &self.observer {
            observer.on_state_change(&state);
        }

        if self.auto_finalize && state.is_verified() {
            self.begin_finalize(None);
        }
    }

    fn begin_finalize(&mut self, reply: Option<Reply<Connection>>) {
        let (result, local) = match self.core.verified_result() {
            Ok(verified) => verified,
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                return;
            }
        };

        let finalizer = Arc::clone(&self.finalizer);
        let weak = self.weak.clone();
        tokio::spawn(async move {
            let outcome = finalizer.persist(&result, &local).await;
            let input = Input::Finalized {
                session_id: result.session_id,
                outcome,
                reply,
            };

            let undelivered = match weak.upgrade() {
                Some(tx) => tx.send(input).await.err().map(|e| e.0),
                None => Some(input),
            };
            // Actor is gone; answer the caller directly
            if let Some(Input::Finalized {
                outcome,
                reply: Some(reply),
                ..
            }) = undelivered
            {
                let _ = reply.send(outcome);
            }
        });
    }

    fn on_finalized(
        &mut self,
        session_id: Uuid,
        outcome: Result<Connection>,
        reply: Option<Reply<Connection>>,
    ) {
        match &outcome {
            Ok(connection) => {
                if self.completed.insert(session_id) {
                    info!(
                        session_id = %session_id,
                        connection_id = %connection.id,
                        "Verification complete"
                    );
                    if let Some(observer) = &self.observer {
                        observer.on_verification_complete(connection);
                    }
                }
            }
            Err(e) => {
                let mut context = ErrorContext::new().with_session_id(session_id);
                if let Some(identity) = self.core.identity() {
                    context = context.with_user_id(identity.user_id.clone());
                }
                e.log_with_context(&context);
            }
        }

        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    fn execute(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            debug!(action = ?action, "Executing action");
            match action {
                Action::BeginSession(session_id) => {
                    if let Some((_, token)) = self.session.take() {
                        token.cancel();
                    }
                    self.session = Some((session_id, CancellationToken::new()));
                }
                Action::EndSession(session_id) => {
                    if let Some((current, token)) = self.session.take() {
                        if current != session_id {
                            warn!(session_id = %session_id, current = %current, "Ending unexpected session");
                        }
                        token.cancel();
                    }
                    self.timers.clear();
                    self.ranging_token = None;
                }
                Action::StartDiscovery {
                    session_id,
                    identity,
                } => {
                    let follow_up = match self.discovery.start(&identity) {
                        Ok(events) => {
                            self.forward_discovery(session_id, events);
                            self.core.discovery_started(session_id)
                        }
                        Err(e) => {
                            let reason = match e {
                                ProximityError::DiscoveryUnavailable(reason) => reason,
                                other => other.to_string(),
                            };
                            self.core.discovery_unavailable(session_id, reason, Utc::now())
                        }
                    };
                    for action in follow_up.into_iter().rev() {
                        queue.push_front(action);
                    }
                }
                Action::StopDiscovery => self.discovery.stop(),
                Action::Connect {
                    session_id,
                    peer_id,
                } => self.spawn_connect(session_id, peer_id),
                Action::CheckRanging {
                    session_id,
                    peer_id,
                } => self.spawn_ranging_check(session_id, peer_id),
                Action::StartRanging {
                    session_id,
                    peer_id,
                } => self.spawn_ranging(session_id, peer_id),
                Action::StopRanging => {
                    if let Some(token) = self.ranging_token.take() {
                        token.cancel();
                    }
                    self.ranging.stop();
                }
                Action::StartTimer {
                    session_id,
                    timer,
                    after,
                } => self.spawn_timer(session_id, timer, after),
                Action::CancelTimer(kind) => {
                    if let Some(token) = self.timers.remove(&kind) {
                        token.cancel();
                    }
                }
            }
        }
    }

    /// Token scoped to the live session, already cancelled when there is none
    fn session_child(&self) -> CancellationToken {
        match &self.session {
            Some((_, token)) => token.child_token(),
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    fn forward_discovery(&self, session_id: Uuid, mut events: mpsc::Receiver<DiscoveryEvent>) {
        let token = self.session_child();
        let weak = self.weak.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            debug!(session_id = %session_id, kind = event.kind(), peer_id = %event.peer_id(), "Discovery event");
                            if !inject(&weak, session_id, Event::Discovery(event)).await {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    fn spawn_connect(&self, session_id: Uuid, peer_id: PeerId) {
        let token = self.session_child();
        let weak = self.weak.clone();
        let discovery = Arc::clone(&self.discovery);

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                outcome = discovery.connect(&peer_id) => outcome,
            };
            if let Err(e) = outcome {
                warn!(session_id = %session_id, peer_id = %peer_id, error = %e, "Connect attempt failed");
                inject(
                    &weak,
                    session_id,
                    Event::ConnectFailed {
                        peer_id,
                        error: e.to_string(),
                    },
                )
                .await;
            }
        });
    }

    fn spawn_ranging_check(&self, session_id: Uuid, peer_id: PeerId) {
        let token = self.session_child();
        let weak = self.weak.clone();
        let ranging = Arc::clone(&self.ranging);

        tokio::spawn(async move {
            let available = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                available = ranging.is_available(&peer_id) => available,
            };
            inject(
                &weak,
                session_id,
                Event::RangingAvailability { peer_id, available },
            )
            .await;
        });
    }

    fn spawn_ranging(&mut self, session_id: Uuid, peer_id: PeerId) {
        let token = self.session_child();
        if let Some(previous) = self.ranging_token.replace(token.clone()) {
            previous.cancel();
        }
        let weak = self.weak.clone();
        let ranging = Arc::clone(&self.ranging);

        tokio::spawn(async move {
            let started = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                started = ranging.start(&peer_id) => started,
            };
            let mut samples = match started {
                Ok(samples) => samples,
                Err(error) => {
                    inject(&weak, session_id, Event::RangingStartFailed { peer_id, error }).await;
                    return;
                }
            };

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    sample = samples.recv() => match sample {
                        Some(sample) => {
                            if !inject(&weak, session_id, Event::RangingSample(sample)).await {
                                break;
                            }
                        }
                        None => {
                            inject(&weak, session_id, Event::RangingEnded).await;
                            break;
                        }
                    },
                }
            }
        });
    }

    fn spawn_timer(&mut self, session_id: Uuid, timer: TimerId, after: Duration) {
        let token = self.session_child();
        if let Some(previous) = self.timers.insert(timer.kind, token.clone()) {
            previous.cancel();
        }
        let weak = self.weak.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    debug!(session_id = %session_id, timer = ?timer.kind, "Timer fired");
                    inject(&weak, session_id, Event::TimerFired(timer)).await;
                }
            }
        });
    }
}

/// Queue an event for the actor; false once the actor is gone
async fn inject(weak: &mpsc::WeakSender<Input>, session_id: Uuid, event: Event) -> bool {
    match weak.upgrade() {
        Some(tx) => tx
            .send(Input::Event(TaggedEvent::new(session_id, event)))
            .await
            .is_ok(),
        None => false,
    }
}
