//! Signaling sessions: offer/answer/candidate negotiation of a direct channel.
//!
//! A `SignalingSession` is the state machine; it owns the descriptions and
//! the candidate pool and talks to two capabilities:
//!   - `PeerChannel`: produces descriptions, consumes remote candidates,
//!     reports local candidates and path readiness.
//!   - `SignalingRelay`: carries `SignalMessage`s to the remote peer.
//!
//! Offerer:  Idle → OfferCreated → OfferSent → AnswerReceived → Connected
//! Answerer: Idle → OfferReceived → AnswerSent → Connected
//!
//! `Failed` and `Cancelled` are reachable from every other state and absorb
//! all further transitions. Transitions only ever move forward.
//!
//! `SessionDriver` runs one session as a task: it feeds relay messages and
//! channel events into the state machine, enforces the answer deadline, and
//! releases the relay subscription when the session ends.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use rand::RngCore;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant, Sleep};

use capsule_core::{PeerId, SignalKind, SignalMessage};

// ── States ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    TimedOut,
    Description(String),
    Relay(String),
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    OfferCreated,
    OfferSent,
    AnswerReceived,
    OfferReceived,
    AnswerSent,
    Connected,
    Failed(FailReason),
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed(_) | SessionState::Cancelled)
    }

    /// Position along the partial order. Roles share Idle, Connected and the
    /// terminal states.
    fn rank(&self) -> u8 {
        match self {
            SessionState::Idle => 0,
            SessionState::OfferCreated | SessionState::OfferReceived => 1,
            SessionState::OfferSent | SessionState::AnswerSent => 2,
            SessionState::AnswerReceived => 3,
            SessionState::Connected => 4,
            SessionState::Failed(_) | SessionState::Cancelled => 5,
        }
    }

    fn belongs_to(&self, role: Role) -> bool {
        match self {
            SessionState::OfferCreated | SessionState::OfferSent | SessionState::AnswerReceived => {
                role == Role::Offerer
            }
            SessionState::OfferReceived | SessionState::AnswerSent => role == Role::Answerer,
            _ => true,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "failed ({reason:?})"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("channel could not produce a description: {0}")]
    Description(String),
    #[error("signaling relay unreachable: {0}")]
    Relay(String),
    #[error("malformed signaling message: {0}")]
    Malformed(String),
    #[error("{op} not allowed in state {state}")]
    InvalidTransition { state: SessionState, op: &'static str },
    #[error("session already ended: {0}")]
    Terminal(SessionState),
    #[error("connected requires both a local and a remote description")]
    NotNegotiated,
    #[error("peer channel failed: {0}")]
    Transport(String),
}

// ── Capabilities ─────────────────────────────────────────────────────────────

/// Something the peer channel reports while connectivity is being established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    LocalCandidate(String),
    PathReady,
    PathFailed(String),
}

/// The direct-channel stack (ICE-like) under negotiation.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    async fn create_offer(&self) -> Result<String, SignalingError>;
    async fn create_answer(&self, offer: &str) -> Result<String, SignalingError>;
    async fn apply_answer(&self, answer: &str) -> Result<(), SignalingError>;
    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), SignalingError>;

    /// Event stream. May be taken once.
    async fn events(&self) -> Result<BoxStream<'static, ChannelEvent>, SignalingError>;
}

/// Builds a fresh channel for each negotiation with `remote`.
pub trait PeerChannelFactory: Send + Sync {
    fn open(&self, remote: PeerId) -> Arc<dyn PeerChannel>;
}

#[derive(Debug, Clone)]
pub struct RelayEnvelope {
    pub from: PeerId,
    pub message: SignalMessage,
}

/// Side channel carrying signaling messages between two peers.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn send(&self, from: PeerId, to: PeerId, message: SignalMessage)
        -> Result<(), SignalingError>;

    /// Messages addressed to `local` for one session, including any that
    /// arrived before the subscription existed.
    async fn subscribe(
        &self,
        local: PeerId,
        session_id: &str,
    ) -> Result<mpsc::Receiver<RelayEnvelope>, SignalingError>;

    fn unsubscribe(&self, local: PeerId, session_id: &str);

    /// Offers that open sessions `local` has not subscribed to yet.
    async fn listen(&self, local: PeerId) -> Result<mpsc::Receiver<RelayEnvelope>, SignalingError>;
}

pub fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ── Session ──────────────────────────────────────────────────────────────────

/// Upper bound on a single relay send.
pub const RELAY_SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SignalingSession {
    id: String,
    role: Role,
    local: PeerId,
    remote: PeerId,
    state: SessionState,
    local_description: Option<String>,
    remote_description: Option<String>,
    remote_candidates: Vec<String>,
    /// Local candidates found before our description went out.
    unsent_candidates: Vec<String>,
    channel: Arc<dyn PeerChannel>,
    relay: Arc<dyn SignalingRelay>,
    send_timeout: Duration,
}

impl SignalingSession {
    pub fn offerer(
        local: PeerId,
        remote: PeerId,
        channel: Arc<dyn PeerChannel>,
        relay: Arc<dyn SignalingRelay>,
    ) -> Self {
        Self::new(new_session_id(), Role::Offerer, local, remote, channel, relay)
    }

    pub fn answerer(
        session_id: impl Into<String>,
        local: PeerId,
        remote: PeerId,
        channel: Arc<dyn PeerChannel>,
        relay: Arc<dyn SignalingRelay>,
    ) -> Self {
        Self::new(session_id.into(), Role::Answerer, local, remote, channel, relay)
    }

    fn new(
        id: String,
        role: Role,
        local: PeerId,
        remote: PeerId,
        channel: Arc<dyn PeerChannel>,
        relay: Arc<dyn SignalingRelay>,
    ) -> Self {
        Self {
            id,
            role,
            local,
            remote,
            state: SessionState::Idle,
            local_description: None,
            remote_description: None,
            remote_candidates: Vec::new(),
            unsent_candidates: Vec::new(),
            channel,
            relay,
            send_timeout: RELAY_SEND_TIMEOUT,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn local_description(&self) -> Option<&str> {
        self.local_description.as_deref()
    }

    pub fn remote_description(&self) -> Option<&str> {
        self.remote_description.as_deref()
    }

    pub fn remote_candidates(&self) -> &[String] {
        &self.remote_candidates
    }

    /// Both descriptions are in place and our side of the exchange is done.
    pub fn is_negotiated(&self) -> bool {
        self.local_description.is_some()
            && self.remote_description.is_some()
            && matches!(
                self.state,
                SessionState::AnswerReceived | SessionState::AnswerSent
            )
    }

    fn guard(&self, expected: SessionState, op: &'static str) -> Result<(), SignalingError> {
        if self.state.is_terminal() {
            return Err(SignalingError::Terminal(self.state.clone()));
        }
        if self.state != expected {
            return Err(SignalingError::InvalidTransition {
                state: self.state.clone(),
                op,
            });
        }
        Ok(())
    }

    fn advance(&mut self, next: SessionState) -> Result<(), SignalingError> {
        if self.state.is_terminal() {
            return Err(SignalingError::Terminal(self.state.clone()));
        }
        if !next.belongs_to(self.role) || next.rank() <= self.state.rank() {
            return Err(SignalingError::InvalidTransition {
                state: self.state.clone(),
                op: "advance",
            });
        }
        tracing::debug!(session = %self.id, from = %self.state, to = %next, "signaling transition");
        self.state = next;
        if self.state.is_terminal() {
            self.release();
        }
        Ok(())
    }

    /// Force `Failed`. No-op once terminal.
    pub fn fail(&mut self, reason: FailReason) {
        if !self.state.is_terminal() {
            tracing::warn!(session = %self.id, peer = %self.remote, ?reason, "signaling session failed");
            let _ = self.advance(SessionState::Failed(reason));
        }
    }

    /// Force `Cancelled`. No-op once terminal.
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            let _ = self.advance(SessionState::Cancelled);
        }
    }

    /// Drop the relay subscription for this session.
    pub fn release(&self) {
        self.relay.unsubscribe(self.local, &self.id);
    }

    async fn send(&mut self, kind: SignalKind, payload: String) -> Result<(), SignalingError> {
        let message = SignalMessage::new(kind, self.id.clone(), payload);
        let sent = timeout(
            self.send_timeout,
            self.relay.send(self.local, self.remote, message),
        )
        .await
        .unwrap_or_else(|_| Err(SignalingError::Relay("relay send timed out".into())));
        if let Err(e) = sent {
            self.fail(FailReason::Relay(e.to_string()));
            return Err(e);
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) -> Result<(), SignalingError> {
        for candidate in std::mem::take(&mut self.unsent_candidates) {
            self.send(SignalKind::Candidate, candidate).await?;
        }
        Ok(())
    }

    // ── Offerer ──────────────────────────────────────────────────────────────

    pub async fn create_offer(&mut self) -> Result<&str, SignalingError> {
        self.guard(SessionState::Idle, "create_offer")?;
        if self.role != Role::Offerer {
            return Err(SignalingError::InvalidTransition {
                state: self.state.clone(),
                op: "create_offer",
            });
        }
        match self.channel.create_offer().await {
            Ok(description) if !description.is_empty() => {
                self.local_description = Some(description);
                self.advance(SessionState::OfferCreated)?;
                Ok(self.local_description.as_deref().unwrap_or_default())
            }
            Ok(_) => {
                let err = SignalingError::Description("empty offer".into());
                self.fail(FailReason::Description(err.to_string()));
                Err(err)
            }
            Err(e) => {
                self.fail(FailReason::Description(e.to_string()));
                Err(e)
            }
        }
    }

    pub async fn send_offer(&mut self) -> Result<(), SignalingError> {
        self.guard(SessionState::OfferCreated, "send_offer")?;
        let offer = self.local_description.clone().unwrap_or_default();
        self.send(SignalKind::Offer, offer).await?;
        self.advance(SessionState::OfferSent)?;
        self.flush_candidates().await
    }

    /// Record the remote answer. A malformed or out-of-order answer is
    /// rejected and the session stays where it was.
    pub async fn on_answer_received(&mut self, message: &SignalMessage) -> Result<(), SignalingError> {
        self.guard(SessionState::OfferSent, "on_answer_received")?;
        self.check_message(message, SignalKind::Answer)?;
        self.channel
            .apply_answer(&message.payload)
            .await
            .map_err(|e| SignalingError::Malformed(e.to_string()))?;
        self.remote_description = Some(message.payload.clone());
        self.advance(SessionState::AnswerReceived)
    }

    // ── Answerer ─────────────────────────────────────────────────────────────

    pub async fn on_offer_received(&mut self, message: &SignalMessage) -> Result<(), SignalingError> {
        self.guard(SessionState::Idle, "on_offer_received")?;
        if self.role != Role::Answerer {
            return Err(SignalingError::InvalidTransition {
                state: self.state.clone(),
                op: "on_offer_received",
            });
        }
        self.check_message(message, SignalKind::Offer)?;
        self.remote_description = Some(message.payload.clone());
        self.advance(SessionState::OfferReceived)
    }

    pub async fn send_answer(&mut self) -> Result<(), SignalingError> {
        self.guard(SessionState::OfferReceived, "send_answer")?;
        let offer = self.remote_description.clone().unwrap_or_default();
        let answer = match self.channel.create_answer(&offer).await {
            Ok(answer) if !answer.is_empty() => answer,
            Ok(_) => {
                let err = SignalingError::Description("empty answer".into());
                self.fail(FailReason::Description(err.to_string()));
                return Err(err);
            }
            Err(e) => {
                self.fail(FailReason::Description(e.to_string()));
                return Err(e);
            }
        };
        self.local_description = Some(answer.clone());
        self.send(SignalKind::Answer, answer).await?;
        self.advance(SessionState::AnswerSent)?;
        self.flush_candidates().await
    }

    // ── Candidates ───────────────────────────────────────────────────────────

    /// Forward a local candidate, or hold it until our description is out.
    pub async fn on_local_candidate(&mut self, candidate: String) -> Result<(), SignalingError> {
        if self.state.is_terminal() {
            return Err(SignalingError::Terminal(self.state.clone()));
        }
        let description_sent = matches!(
            self.state,
            SessionState::OfferSent
                | SessionState::AnswerReceived
                | SessionState::AnswerSent
                | SessionState::Connected
        );
        if description_sent {
            self.send(SignalKind::Candidate, candidate).await
        } else {
            self.unsent_candidates.push(candidate);
            Ok(())
        }
    }

    pub async fn on_remote_candidate(&mut self, message: &SignalMessage) -> Result<(), SignalingError> {
        if self.state.is_terminal() {
            return Err(SignalingError::Terminal(self.state.clone()));
        }
        self.check_message(message, SignalKind::Candidate)?;
        if self.remote_candidates.contains(&message.payload) {
            return Ok(());
        }
        self.remote_candidates.push(message.payload.clone());
        self.channel.add_remote_candidate(&message.payload).await
    }

    // ── Completion ───────────────────────────────────────────────────────────

    /// The channel reports a usable direct path.
    pub fn on_transport_ready(&mut self) -> Result<(), SignalingError> {
        if self.state.is_terminal() {
            return Err(SignalingError::Terminal(self.state.clone()));
        }
        if !self.is_negotiated() {
            return Err(SignalingError::NotNegotiated);
        }
        self.advance(SessionState::Connected)?;
        tracing::info!(session = %self.id, peer = %self.remote, role = ?self.role, "direct channel connected");
        Ok(())
    }

    fn check_message(&self, message: &SignalMessage, kind: SignalKind) -> Result<(), SignalingError> {
        if message.kind != kind {
            return Err(SignalingError::Malformed(format!(
                "expected {kind:?}, got {:?}",
                message.kind
            )));
        }
        if message.session_id != self.id {
            return Err(SignalingError::Malformed(format!(
                "session id {} does not match {}",
                message.session_id, self.id
            )));
        }
        if message.payload.is_empty() {
            return Err(SignalingError::Malformed("empty payload".into()));
        }
        Ok(())
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Owner's handle on a running session. Dropping it cancels the session.
pub struct SessionHandle {
    id: String,
    remote: PeerId,
    state: watch::Receiver<SessionState>,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<SessionState>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the session to end and return its final state.
    pub async fn finished(self) -> SessionState {
        let SessionHandle { task, cancel, .. } = self;
        let _keep_alive = cancel;
        task.await.unwrap_or(SessionState::Cancelled)
    }
}

/// Why a step of network work was abandoned.
enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Run `work` unless cancellation or the deadline comes first.
async fn interruptible<T>(
    work: impl Future<Output = T>,
    cancel: &mut oneshot::Receiver<()>,
    deadline: Pin<&mut Sleep>,
) -> Result<T, Interrupt> {
    tokio::select! {
        biased;
        _ = cancel => Err(Interrupt::Cancelled),
        _ = deadline => Err(Interrupt::TimedOut),
        out = work => Ok(out),
    }
}

pub struct SessionDriver {
    session: SignalingSession,
    inbox: mpsc::Receiver<RelayEnvelope>,
    timeout: Duration,
    state_tx: watch::Sender<SessionState>,
}

impl SessionDriver {
    /// Subscribe to the relay for this session, then run it on its own task.
    ///
    /// The subscription exists before any offer is sent, so an early answer
    /// cannot be missed. `timeout` bounds the wait for each remote step.
    pub async fn start(
        mut session: SignalingSession,
        timeout: Duration,
    ) -> Result<SessionHandle, SignalingError> {
        session.send_timeout = session.send_timeout.min(timeout);
        let inbox = tokio::time::timeout(timeout, session.relay.subscribe(session.local, &session.id))
            .await
            .map_err(|_| SignalingError::Relay("relay subscribe timed out".into()))??;
        let (state_tx, state_rx) = watch::channel(session.state.clone());
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let id = session.id.clone();
        let remote = session.remote;

        let driver = SessionDriver {
            session,
            inbox,
            timeout,
            state_tx,
        };
        let task = tokio::spawn(driver.run(cancel_rx));

        Ok(SessionHandle {
            id,
            remote,
            state: state_rx,
            cancel: Some(cancel_tx),
            task,
        })
    }

    async fn run(mut self, mut cancel: oneshot::Receiver<()>) -> SessionState {
        let deadline = sleep(self.timeout);
        tokio::pin!(deadline);

        let channel = self.session.channel.clone();
        let mut events = match interruptible(channel.events(), &mut cancel, deadline.as_mut()).await {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                self.session.fail(FailReason::Transport(e.to_string()));
                return self.finish();
            }
            Err(interrupt) => {
                self.interrupt(interrupt);
                return self.finish();
            }
        };

        if self.session.role == Role::Offerer {
            match interruptible(self.open(), &mut cancel, deadline.as_mut()).await {
                Ok(Ok(())) => deadline.as_mut().reset(Instant::now() + self.timeout),
                Ok(Err(e)) => {
                    tracing::warn!(session = %self.session.id, error = %e, "could not open negotiation");
                    return self.finish();
                }
                Err(interrupt) => {
                    self.interrupt(interrupt);
                    return self.finish();
                }
            }
        }

        let mut path_ready = false;

        loop {
            self.publish();
            if self.session.state.is_terminal() || self.session.state == SessionState::Connected {
                break;
            }
            let rank_before = self.session.state.rank();

            tokio::select! {
                _ = &mut cancel => self.session.cancel(),
                _ = &mut deadline => self.session.fail(FailReason::TimedOut),
                envelope = self.inbox.recv() => match envelope {
                    Some(envelope) => {
                        let handled =
                            interruptible(self.handle_message(envelope), &mut cancel, deadline.as_mut()).await;
                        if let Err(interrupt) = handled {
                            self.interrupt(interrupt);
                        }
                    }
                    None => self.session.fail(FailReason::Relay("subscription closed".into())),
                },
                event = events.next() => match event {
                    Some(ChannelEvent::LocalCandidate(candidate)) => {
                        let forwarded = interruptible(
                            self.session.on_local_candidate(candidate),
                            &mut cancel,
                            deadline.as_mut(),
                        )
                        .await;
                        match forwarded {
                            Ok(Err(e)) => {
                                tracing::debug!(session = %self.session.id, error = %e, "local candidate not forwarded")
                            }
                            Err(interrupt) => self.interrupt(interrupt),
                            Ok(Ok(())) => {}
                        }
                    }
                    Some(ChannelEvent::PathReady) => path_ready = true,
                    Some(ChannelEvent::PathFailed(reason)) => {
                        self.session.fail(FailReason::Transport(reason))
                    }
                    None => self
                        .session
                        .fail(FailReason::Transport("peer channel closed".into())),
                },
            }

            if path_ready && self.session.is_negotiated() {
                let _ = self.session.on_transport_ready();
            }
            if self.session.state.rank() > rank_before {
                deadline.as_mut().reset(Instant::now() + self.timeout);
            }
        }

        self.finish()
    }

    async fn open(&mut self) -> Result<(), SignalingError> {
        self.session.create_offer().await?;
        self.session.send_offer().await
    }

    async fn handle_message(&mut self, envelope: RelayEnvelope) {
        if envelope.from != self.session.remote {
            tracing::warn!(
                session = %self.session.id,
                from = %envelope.from,
                "signaling message from unexpected peer"
            );
            return;
        }
        let message = envelope.message;
        let result = match message.kind {
            SignalKind::Offer => match self.session.on_offer_received(&message).await {
                Ok(()) => self.session.send_answer().await,
                Err(e) => Err(e),
            },
            SignalKind::Answer => self.session.on_answer_received(&message).await,
            SignalKind::Candidate => self.session.on_remote_candidate(&message).await,
        };
        if let Err(e) = result {
            tracing::warn!(session = %self.session.id, kind = ?message.kind, error = %e, "signaling message rejected");
        }
    }

    fn interrupt(&mut self, interrupt: Interrupt) {
        match interrupt {
            Interrupt::Cancelled => self.session.cancel(),
            Interrupt::TimedOut => self.session.fail(FailReason::TimedOut),
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.session.state.clone());
    }

    fn finish(self) -> SessionState {
        self.session.release();
        self.publish();
        self.session.state.clone()
    }
}

/// Running sessions by id.
pub type SessionTable = Arc<DashMap<String, SessionHandle>>;

/// Accept inbound offers and run an answerer session for each.
pub async fn accept_loop(
    local: PeerId,
    relay: Arc<dyn SignalingRelay>,
    channels: Arc<dyn PeerChannelFactory>,
    sessions: SessionTable,
    timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), SignalingError> {
    let mut offers = relay.listen(local).await?;
    tracing::info!(peer = %local, "accepting signaling offers");

    loop {
        let envelope = tokio::select! {
            _ = shutdown.recv() => break,
            envelope = offers.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };
        if envelope.message.kind != SignalKind::Offer {
            continue;
        }
        let session_id = envelope.message.session_id.clone();
        if sessions.contains_key(&session_id) {
            continue;
        }
        sessions.retain(|_, handle| !handle.is_finished());

        let session = SignalingSession::answerer(
            session_id.clone(),
            local,
            envelope.from,
            channels.open(envelope.from),
            relay.clone(),
        );
        match SessionDriver::start(session, timeout).await {
            Ok(handle) => {
                tracing::debug!(session = %session_id, peer = %envelope.from, "answering offer");
                sessions.insert(session_id, handle);
            }
            Err(e) => tracing::warn!(session = %session_id, error = %e, "could not start answerer"),
        }
    }

    for mut entry in sessions.iter_mut() {
        entry.value_mut().cancel();
    }
    Ok(())
}

// ── In-memory relay ──────────────────────────────────────────────────────────

const RELAY_BUFFER: usize = 64;
const MAX_PENDING: usize = 64;
/// Unsubscribed sessions held at once. The oldest is evicted past this.
const MAX_PENDING_SESSIONS: usize = 1024;

#[derive(Default)]
struct RelayInner {
    sessions: HashMap<(PeerId, String), mpsc::Sender<RelayEnvelope>>,
    pending: HashMap<(PeerId, String), Vec<RelayEnvelope>>,
    /// Insertion order of `pending` keys.
    pending_order: VecDeque<(PeerId, String)>,
    listeners: HashMap<PeerId, mpsc::Sender<RelayEnvelope>>,
    unreachable: bool,
}

/// In-process relay. Messages for a session nobody has subscribed to yet are
/// held until someone does. Offers also reach the addressee's listener, even
/// when it starts listening after they arrived.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayInner>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unreachable = !reachable;
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().map(|i| i.sessions.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RelayInner>, SignalingError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| SignalingError::Relay("relay state poisoned".into()))?;
        if inner.unreachable {
            return Err(SignalingError::Relay("memory relay offline".into()));
        }
        Ok(inner)
    }
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn send(
        &self,
        from: PeerId,
        to: PeerId,
        message: SignalMessage,
    ) -> Result<(), SignalingError> {
        let mut inner = self.lock()?;
        let key = (to, message.session_id.clone());
        let envelope = RelayEnvelope { from, message };

        if let Some(tx) = inner.sessions.get(&key) {
            if tx.try_send(envelope).is_err() {
                tracing::warn!(session = %key.1, "relay subscriber not draining, message dropped");
            }
            return Ok(());
        }

        if envelope.message.kind == SignalKind::Offer {
            if let Some(listener) = inner.listeners.get(&to) {
                let _ = listener.try_send(envelope.clone());
            }
        }
        if !inner.pending.contains_key(&key) {
            while inner.pending.len() >= MAX_PENDING_SESSIONS {
                let Some(oldest) = inner.pending_order.pop_front() else {
                    break;
                };
                if inner.pending.remove(&oldest).is_some() {
                    tracing::debug!(session = %oldest.1, "relay evicted unclaimed session");
                }
            }
            inner.pending_order.push_back(key.clone());
        }
        let pending = inner.pending.entry(key).or_default();
        if pending.len() < MAX_PENDING {
            pending.push(envelope);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        local: PeerId,
        session_id: &str,
    ) -> Result<mpsc::Receiver<RelayEnvelope>, SignalingError> {
        let mut inner = self.lock()?;
        let key = (local, session_id.to_string());
        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        for envelope in inner.pending.remove(&key).unwrap_or_default() {
            let _ = tx.try_send(envelope);
        }
        inner.pending_order.retain(|k| *k != key);
        inner.sessions.insert(key, tx);
        Ok(rx)
    }

    fn unsubscribe(&self, local: PeerId, session_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            let key = (local, session_id.to_string());
            inner.sessions.remove(&key);
            if inner.pending.remove(&key).is_some() {
                inner.pending_order.retain(|k| *k != key);
            }
        }
    }

    async fn listen(&self, local: PeerId) -> Result<mpsc::Receiver<RelayEnvelope>, SignalingError> {
        let mut inner = self.lock()?;
        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        // Offers that arrived before anyone listened are replayed
        let held = inner
            .pending
            .iter()
            .filter(|((to, _), _)| *to == local)
            .flat_map(|(_, envelopes)| envelopes.iter())
            .filter(|e| e.message.kind == SignalKind::Offer);
        for envelope in held {
            let _ = tx.try_send(envelope.clone());
        }
        inner.listeners.insert(local, tx);
        Ok(rx)
    }
}

// ── In-memory peer channel ───────────────────────────────────────────────────

#[derive(Default)]
struct ChannelInner {
    local: Option<String>,
    remote: Option<String>,
    remote_candidates: usize,
    ready: bool,
}

/// Loopback channel stack: one host candidate per side, path ready once both
/// descriptions and a remote candidate are known.
pub struct MemoryPeerChannel {
    label: String,
    inner: Mutex<ChannelInner>,
    events_tx: mpsc::Sender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
}

impl MemoryPeerChannel {
    pub fn new(label: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(RELAY_BUFFER);
        Self {
            label: label.into(),
            inner: Mutex::new(ChannelInner::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Inject an event, as a real stack would on network changes.
    pub fn emit(&self, event: ChannelEvent) {
        let _ = self.events_tx.try_send(event);
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut ChannelInner) -> T) -> Result<T, SignalingError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| SignalingError::Transport("channel state poisoned".into()))?;
        let out = f(&mut inner);
        if !inner.ready
            && inner.local.is_some()
            && inner.remote.is_some()
            && inner.remote_candidates > 0
        {
            inner.ready = true;
            self.emit(ChannelEvent::PathReady);
        }
        Ok(out)
    }
}

#[async_trait]
impl PeerChannel for MemoryPeerChannel {
    async fn create_offer(&self) -> Result<String, SignalingError> {
        let offer = format!("offer:{}", self.label);
        self.with_inner(|i| i.local = Some(offer.clone()))?;
        self.emit(ChannelEvent::LocalCandidate(format!("host:{}", self.label)));
        Ok(offer)
    }

    async fn create_answer(&self, offer: &str) -> Result<String, SignalingError> {
        if !offer.starts_with("offer:") {
            return Err(SignalingError::Description(format!("not an offer: {offer}")));
        }
        let answer = format!("answer:{}", self.label);
        self.with_inner(|i| {
            i.remote = Some(offer.to_string());
            i.local = Some(answer.clone());
        })?;
        self.emit(ChannelEvent::LocalCandidate(format!("host:{}", self.label)));
        Ok(answer)
    }

    async fn apply_answer(&self, answer: &str) -> Result<(), SignalingError> {
        if !answer.starts_with("answer:") {
            return Err(SignalingError::Malformed(format!("not an answer: {answer}")));
        }
        self.with_inner(|i| i.remote = Some(answer.to_string()))
    }

    async fn add_remote_candidate(&self, _candidate: &str) -> Result<(), SignalingError> {
        self.with_inner(|i| i.remote_candidates += 1)
    }

    async fn events(&self) -> Result<BoxStream<'static, ChannelEvent>, SignalingError> {
        let rx = self
            .events_rx
            .lock()
            .map_err(|_| SignalingError::Transport("channel state poisoned".into()))?
            .take()
            .ok_or_else(|| SignalingError::Transport("events already taken".into()))?;
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }
}

/// Builds a `MemoryPeerChannel` per negotiation.
pub struct MemoryChannelFactory {
    local: PeerId,
}

impl MemoryChannelFactory {
    pub fn new(local: PeerId) -> Self {
        Self { local }
    }
}

impl PeerChannelFactory for MemoryChannelFactory {
    fn open(&self, remote: PeerId) -> Arc<dyn PeerChannel> {
        Arc::new(MemoryPeerChannel::new(format!("{}->{}", self.local, remote)))
    }
}
