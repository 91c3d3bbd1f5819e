//! Negotiation State Machine.
//!
//! A single [`Negotiator`] owns every [`NegotiationSession`], keyed by remote peer. Relay
//! envelopes, transport events, adapter completions and application commands all arrive as
//! [`NegotiatorEvent`]s on one inbox and are handled one at a time, so session state is never
//! mutated re-entrantly. Handlers never await; slow work is delegated to the session's
//! transport adapter whose completions come back through the same inbox.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::adapter::{TransportCommand, TransportSessionAdapter};
use crate::channel::MessageChannel;
use crate::config::{ClientConfig, DEFAULT_NEGOTIATION_TIMEOUT};
use crate::directory::PeerDirectory;
use crate::error::{NegotiationError, TransportError};
use crate::events::{CallEvent, CloseReason};
use crate::protocol::{CandidateSignal, Envelope, EnvelopeKind, PeerId, SdpKind, SessionDescription};
use crate::relay::{EnvelopeSender, RelayEvent};
use crate::transport::{ConnectivityState, TransportConfig, TransportEvent, TransportFactory};

mod session;

pub use self::session::{NegotiationPhase, Role, SessionState};
pub use crate::adapter::CommandKind;

pub(crate) use self::session::{CandidateDisposition, NegotiationSession};

#[derive(Debug)]
pub enum NegotiatorEvent {
    Relay(RelayEvent),
    Command(NegotiatorCommand),
    /// Completion or transport event from the adapter of the session with `generation`.
    Session {
        peer: PeerId,
        generation: u64,
        update: SessionUpdate,
    },
    Deadline {
        peer: PeerId,
        generation: u64,
    },
}

#[derive(Debug)]
pub enum NegotiatorCommand {
    Call {
        peer: PeerId,
        reply: oneshot::Sender<Result<MessageChannel, NegotiationError>>,
    },
    HangUp {
        peer: PeerId,
    },
    RefreshPeers,
    Channel {
        peer: PeerId,
        reply: oneshot::Sender<Option<MessageChannel>>,
    },
    State {
        peer: PeerId,
        reply: oneshot::Sender<Option<SessionState>>,
    },
    Shutdown,
}

#[derive(Debug)]
pub enum SessionUpdate {
    LocalDescriptionReady(SessionDescription),
    RemoteDescriptionApplied,
    CommandFailed {
        command: CommandKind,
        error: TransportError,
    },
    Transport(TransportEvent),
}

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    pub transport: TransportConfig,
    /// Also bounds how long an idle placeholder waits for its offer.
    pub negotiation_timeout: Duration,
    /// How long a closed session keeps absorbing trailing candidates before it is forgotten.
    pub tombstone_retention: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig {
                channel_label: crate::config::DEFAULT_CHANNEL_LABEL.to_string(),
                ..TransportConfig::default()
            },
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            tombstone_retention: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }
}

impl From<&ClientConfig> for NegotiatorConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            transport: config.transport_config(),
            negotiation_timeout: config.negotiation_timeout,
            tombstone_retention: config.negotiation_timeout,
        }
    }
}

pub struct Negotiator {
    local: Option<PeerId>,
    factory: Arc<dyn TransportFactory>,
    config: NegotiatorConfig,
    relay: EnvelopeSender,
    directory: Arc<RwLock<PeerDirectory>>,
    inbox: mpsc::UnboundedSender<NegotiatorEvent>,
    events: mpsc::UnboundedSender<CallEvent>,
    sessions: HashMap<PeerId, NegotiationSession>,
    next_generation: u64,
    last_relay_error: Option<String>,
}

impl Negotiator {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        config: NegotiatorConfig,
        relay: EnvelopeSender,
        directory: Arc<RwLock<PeerDirectory>>,
        inbox: mpsc::UnboundedSender<NegotiatorEvent>,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            local: None,
            factory,
            config,
            relay,
            directory,
            inbox,
            events,
            sessions: HashMap::new(),
            next_generation: 0,
            last_relay_error: None,
        }
    }

    pub fn local(&self) -> Option<&PeerId> {
        self.local.as_ref()
    }

    pub fn set_local(&mut self, local: Option<PeerId>) {
        self.directory.write().set_local(local.clone());
        self.local = local;
    }

    pub fn state(&self, peer: &PeerId) -> Option<SessionState> {
        self.sessions.get(peer).map(NegotiationSession::state)
    }

    pub fn generation(&self, peer: &PeerId) -> Option<u64> {
        self.sessions.get(peer).map(NegotiationSession::generation)
    }

    pub fn pending_candidates(&self, peer: &PeerId) -> Vec<CandidateSignal> {
        self.sessions
            .get(peer)
            .map(|session| session.pending().cloned().collect())
            .unwrap_or_default()
    }

    /// Channel handle of the peer's live session.
    pub fn channel(&self, peer: &PeerId) -> Option<MessageChannel> {
        self.sessions
            .get(peer)
            .filter(|session| !session.is_closed())
            .map(|session| session.channel().clone())
    }

    /// Sessions holding a transport. Idle placeholders and closed sessions are not counted.
    pub fn live_sessions(&self) -> usize {
        self.sessions
            .values()
            .filter(|session| {
                matches!(
                    session.state(),
                    SessionState::Negotiating(_) | SessionState::Connected
                )
            })
            .count()
    }

    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<NegotiatorEvent>) {
        while let Some(event) = inbox.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        self.teardown_all(CloseReason::Shutdown);
        tracing::debug!(target: "switchboard::negotiation", "negotiator stopped");
    }

    /// Processes one event to completion. Returns false once the negotiator should stop.
    pub fn handle(&mut self, event: NegotiatorEvent) -> bool {
        match event {
            NegotiatorEvent::Relay(event) => self.on_relay_event(event),
            NegotiatorEvent::Command(command) => return self.on_command(command),
            NegotiatorEvent::Session {
                peer,
                generation,
                update,
            } => self.on_session_update(peer, generation, update),
            NegotiatorEvent::Deadline { peer, generation } => self.on_deadline(peer, generation),
        }
        true
    }

    fn on_command(&mut self, command: NegotiatorCommand) -> bool {
        match command {
            NegotiatorCommand::Call { peer, reply } => {
                let _ = reply.send(self.start_call(peer));
            }
            NegotiatorCommand::HangUp { peer } => {
                self.teardown(&peer, CloseReason::HungUp);
            }
            NegotiatorCommand::RefreshPeers => {
                self.directory.read().request_refresh(&self.relay);
            }
            NegotiatorCommand::Channel { peer, reply } => {
                let _ = reply.send(self.channel(&peer));
            }
            NegotiatorCommand::State { peer, reply } => {
                let _ = reply.send(self.state(&peer));
            }
            NegotiatorCommand::Shutdown => {
                self.teardown_all(CloseReason::Shutdown);
                return false;
            }
        }
        true
    }

    fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Open { identity } => {
                tracing::info!(target: "switchboard::negotiation", identity = %identity, "relay connected");
                self.last_relay_error = None;
                self.set_local(Some(identity.clone()));
                self.emit(CallEvent::RelayConnected { identity });
                self.directory.read().request_refresh(&self.relay);
            }
            RelayEvent::Close { identity } => {
                tracing::info!(target: "switchboard::negotiation", identity = %identity, "relay disconnected");
                self.teardown_all(CloseReason::RelayLost);
                self.directory.write().clear();
                self.set_local(None);
                let reason = self.last_relay_error.take();
                self.emit(CallEvent::RelayDisconnected { reason });
            }
            RelayEvent::Error(reason) => {
                tracing::warn!(target: "switchboard::negotiation", error = %reason, "relay error");
                self.last_relay_error = Some(reason);
            }
            RelayEvent::Envelope(envelope) => self.receive_envelope(envelope),
        }
    }

    pub fn receive_envelope(&mut self, envelope: Envelope) {
        let kind = envelope.kind;
        let result = match kind {
            EnvelopeKind::PeerList => self.receive_peer_list(&envelope),
            EnvelopeKind::Offer => self.receive_offer(&envelope),
            EnvelopeKind::Answer => self.receive_answer(&envelope),
            EnvelopeKind::IceCandidate => self.receive_candidate(&envelope),
            EnvelopeKind::GetPeers => {
                tracing::debug!(target: "switchboard::negotiation", "ignoring get-peers addressed to a client");
                Ok(())
            }
        };
        if let Err(err) = result {
            tracing::warn!(
                target: "switchboard::negotiation",
                %kind,
                from = ?envelope.from,
                error = %err,
                "envelope rejected"
            );
        }
    }

    fn receive_peer_list(&mut self, envelope: &Envelope) -> Result<(), NegotiationError> {
        let list = envelope.peer_list_payload()?;
        let peers = self.directory.write().on_update(list).to_vec();
        self.emit(CallEvent::PeersUpdated(peers));
        Ok(())
    }

    /// Starts a call as caller, replacing any live session with `peer`.
    pub fn start_call(&mut self, peer: PeerId) -> Result<MessageChannel, NegotiationError> {
        if self.local.as_ref() == Some(&peer) {
            return Err(NegotiationError::SelfCall);
        }
        self.teardown(&peer, CloseReason::Replaced);

        let session = self.open_session(peer.clone(), Role::Caller);
        session.submit(TransportCommand::PrepareLocalDescription(SdpKind::Offer));
        let channel = session.channel().clone();
        tracing::info!(target: "switchboard::negotiation", peer = %peer, "calling");
        self.emit_status(&peer);
        Ok(channel)
    }

    pub fn receive_offer(&mut self, envelope: &Envelope) -> Result<(), NegotiationError> {
        let from = envelope.sender()?;
        let description = match envelope.session_description() {
            Ok(description) => description,
            Err(err) => {
                self.teardown(&from, CloseReason::Negotiation(err.clone()));
                return Err(err);
            }
        };

        let early = match self.sessions.get_mut(&from) {
            Some(session) if session.state() == SessionState::Idle => session.take_pending(),
            _ => Default::default(),
        };
        self.teardown(&from, CloseReason::Replaced);

        let session = self.open_session(from.clone(), Role::Callee);
        session.adopt_pending(early);
        session.submit(TransportCommand::SetRemoteDescription(description));
        session.submit(TransportCommand::PrepareLocalDescription(SdpKind::Answer));
        tracing::info!(
            target: "switchboard::negotiation",
            peer = %from,
            buffered = session.pending().count(),
            "incoming offer"
        );
        self.emit(CallEvent::CallIncoming { peer: from.clone() });
        self.emit_status(&from);
        Ok(())
    }

    /// Late, duplicate or unsolicited answers are rejected without touching any session.
    pub fn receive_answer(&mut self, envelope: &Envelope) -> Result<(), NegotiationError> {
        let from = envelope.sender()?;
        let offering = self
            .sessions
            .get(&from)
            .is_some_and(|session| {
                session.state() == SessionState::Negotiating(NegotiationPhase::Offering)
            });
        if !offering {
            return Err(NegotiationError::UnexpectedAnswer(from));
        }
        let description = match envelope.session_description() {
            Ok(description) => description,
            Err(err) => {
                self.teardown(&from, CloseReason::Negotiation(err.clone()));
                return Err(err);
            }
        };

        let Some(session) = self.sessions.get_mut(&from) else {
            return Err(NegotiationError::UnexpectedAnswer(from));
        };
        session.submit(TransportCommand::SetRemoteDescription(description));
        session.mark_connected();
        let announce = session.channel_ready();
        tracing::info!(target: "switchboard::negotiation", peer = %from, "answer received");
        self.emit(CallEvent::CallConnected { peer: from.clone() });
        self.emit_status(&from);
        if announce {
            self.announce_channel(&from);
        }
        Ok(())
    }

    pub fn receive_candidate(&mut self, envelope: &Envelope) -> Result<(), NegotiationError> {
        let from = envelope.sender()?;
        let signal = match envelope.candidate() {
            Ok(signal) => signal,
            Err(err) => {
                self.teardown(&from, CloseReason::Negotiation(err.clone()));
                return Err(err);
            }
        };

        match self.sessions.get(&from).map(NegotiationSession::state) {
            Some(SessionState::Closed) => {
                tracing::debug!(target: "switchboard::negotiation", peer = %from, "candidate for a closed session dropped");
                return Ok(());
            }
            Some(_) => {}
            None => {
                let generation = self.allocate_generation();
                let mut placeholder = NegotiationSession::idle(from.clone(), generation);
                placeholder.set_deadline(spawn_deadline(
                    self.inbox.clone(),
                    from.clone(),
                    generation,
                    self.config.negotiation_timeout,
                ));
                self.sessions.insert(from.clone(), placeholder);
                tracing::debug!(target: "switchboard::negotiation", peer = %from, "candidate before offer");
            }
        }
        let Some(session) = self.sessions.get_mut(&from) else {
            return Ok(());
        };
        match session.accept_candidate(signal) {
            CandidateDisposition::Apply(signal) => {
                session.submit(TransportCommand::AddCandidate(signal));
            }
            CandidateDisposition::Queued => {
                tracing::trace!(
                    target: "switchboard::negotiation",
                    peer = %from,
                    queued = session.pending().count(),
                    "candidate queued"
                );
            }
            CandidateDisposition::Overflow => {
                tracing::warn!(target: "switchboard::negotiation", peer = %from, "candidate queue full; dropping");
            }
        }
        Ok(())
    }

    /// Closes the peer's session. A no-op when it is already closed or absent.
    pub fn teardown(&mut self, peer: &PeerId, reason: CloseReason) -> bool {
        let Some(session) = self.sessions.get_mut(peer) else {
            return false;
        };
        let previous = session.state();
        let role = session.role();
        if !session.teardown() {
            return false;
        }
        let generation = session.generation();
        session.set_deadline(spawn_deadline(
            self.inbox.clone(),
            peer.clone(),
            generation,
            self.config.tombstone_retention,
        ));
        if previous == SessionState::Idle {
            tracing::debug!(target: "switchboard::negotiation", peer = %peer, "placeholder discarded");
            return true;
        }
        tracing::info!(
            target: "switchboard::negotiation",
            peer = %peer,
            ?role,
            from = %previous,
            reason = %reason,
            "session closed"
        );
        self.emit(CallEvent::CallClosed {
            peer: peer.clone(),
            reason,
        });
        self.emit_status(peer);
        true
    }

    pub fn teardown_all(&mut self, reason: CloseReason) {
        let peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for peer in peers {
            self.teardown(&peer, reason.clone());
        }
    }

    fn on_session_update(&mut self, peer: PeerId, generation: u64, update: SessionUpdate) {
        let current = self
            .sessions
            .get(&peer)
            .is_some_and(|session| session.generation() == generation && !session.is_closed());
        if !current {
            tracing::debug!(
                target: "switchboard::negotiation",
                peer = %peer,
                generation,
                "discarding stale completion"
            );
            return;
        }

        match update {
            SessionUpdate::LocalDescriptionReady(description) => {
                let envelope = match description.kind {
                    SdpKind::Offer => Envelope::offer(peer.clone(), &description),
                    SdpKind::Answer => Envelope::answer(peer.clone(), &description),
                };
                self.relay.send(envelope);
                if let Some(session) = self.sessions.get(&peer) {
                    session.submit(TransportCommand::SetLocalDescription(description));
                }
            }
            SessionUpdate::RemoteDescriptionApplied => {
                if let Some(session) = self.sessions.get_mut(&peer) {
                    let drained = session.remote_description_applied();
                    if !drained.is_empty() {
                        tracing::debug!(
                            target: "switchboard::negotiation",
                            peer = %peer,
                            count = drained.len(),
                            "applying buffered candidates"
                        );
                    }
                    for signal in drained {
                        session.submit(TransportCommand::AddCandidate(signal));
                    }
                }
            }
            SessionUpdate::CommandFailed {
                command: CommandKind::AddCandidate,
                error,
            } => {
                tracing::debug!(target: "switchboard::negotiation", peer = %peer, error = %error, "candidate rejected by transport");
            }
            SessionUpdate::CommandFailed { command, error } => {
                tracing::warn!(
                    target: "switchboard::negotiation",
                    peer = %peer,
                    command = ?command,
                    error = %error,
                    "transport command failed"
                );
                self.teardown(&peer, CloseReason::Transport(error));
            }
            SessionUpdate::Transport(event) => self.on_transport_event(peer, event),
        }
    }

    fn on_transport_event(&mut self, peer: PeerId, event: TransportEvent) {
        match event {
            TransportEvent::ConnectivityChanged(ConnectivityState::Connected) => {
                let Some(session) = self.sessions.get_mut(&peer) else {
                    return;
                };
                let changed = session.mark_connected();
                let announce = session.channel_ready();
                if changed {
                    tracing::info!(target: "switchboard::negotiation", peer = %peer, "connectivity established");
                    self.emit(CallEvent::CallConnected { peer: peer.clone() });
                    self.emit_status(&peer);
                }
                if announce {
                    self.announce_channel(&peer);
                }
            }
            TransportEvent::ConnectivityChanged(ConnectivityState::Failed) => {
                self.teardown(&peer, CloseReason::Transport(TransportError::ConnectivityFailed));
            }
            TransportEvent::ConnectivityChanged(ConnectivityState::Closed) => {
                self.teardown(&peer, CloseReason::RemoteClosed);
            }
            TransportEvent::ConnectivityChanged(state) => {
                tracing::debug!(target: "switchboard::negotiation", peer = %peer, ?state, "connectivity changed");
            }
            TransportEvent::ChannelOpen(channel) => {
                let Some(session) = self.sessions.get_mut(&peer) else {
                    return;
                };
                if channel.label() != self.config.transport.channel_label {
                    tracing::debug!(target: "switchboard::negotiation", peer = %peer, label = %channel.label(), "ignoring foreign channel");
                    return;
                }
                session.channel().attach(channel);
                if session.channel_ready() {
                    self.announce_channel(&peer);
                }
            }
            TransportEvent::ChannelClosed { label } => {
                if let Some(session) = self.sessions.get_mut(&peer) {
                    session.channel_closed(&label);
                }
                tracing::debug!(target: "switchboard::negotiation", peer = %peer, label = %label, "channel closed");
            }
            TransportEvent::ChannelMessage { label, payload } => {
                if label != self.config.transport.channel_label {
                    tracing::debug!(target: "switchboard::negotiation", peer = %peer, label = %label, "ignoring message on foreign channel");
                    return;
                }
                self.emit(CallEvent::MessageReceived { peer, payload });
            }
            TransportEvent::RemoteTrack(track) => {
                tracing::info!(target: "switchboard::negotiation", peer = %peer, track = %track.id, "remote track");
                self.emit(CallEvent::RemoteTrack { peer, track });
            }
            TransportEvent::LocalCandidate(signal) => {
                self.relay.send(Envelope::ice_candidate(peer, &signal));
            }
        }
    }

    /// Negotiating sessions time out; placeholders and tombstones are forgotten.
    fn on_deadline(&mut self, peer: PeerId, generation: u64) {
        let state = match self.sessions.get(&peer) {
            Some(session) if session.generation() == generation => session.state(),
            _ => return,
        };
        match state {
            SessionState::Negotiating(_) => {
                tracing::warn!(target: "switchboard::negotiation", peer = %peer, "negotiation timed out");
                let reason = CloseReason::Negotiation(NegotiationError::Timeout(peer.clone()));
                self.teardown(&peer, reason);
            }
            SessionState::Idle => {
                self.sessions.remove(&peer);
                tracing::debug!(target: "switchboard::negotiation", peer = %peer, "placeholder expired without an offer");
            }
            SessionState::Closed => {
                self.sessions.remove(&peer);
                tracing::trace!(target: "switchboard::negotiation", peer = %peer, generation, "closed session released");
            }
            SessionState::Connected => {}
        }
    }

    fn open_session(&mut self, peer: PeerId, role: Role) -> &mut NegotiationSession {
        let generation = self.allocate_generation();
        let adapter = TransportSessionAdapter::spawn(
            self.factory.clone(),
            self.config.transport.clone(),
            peer.clone(),
            generation,
            self.relay.clone(),
            self.inbox.clone(),
        );
        for track in &self.config.transport.local_tracks {
            adapter.submit(TransportCommand::AddLocalTrack(track.clone()));
        }
        adapter.submit(TransportCommand::CreateOrderedChannel(
            self.config.transport.channel_label.clone(),
        ));

        let mut session = NegotiationSession::negotiating(peer.clone(), role, generation, adapter);
        session.set_deadline(spawn_deadline(
            self.inbox.clone(),
            peer.clone(),
            generation,
            self.config.negotiation_timeout,
        ));

        tracing::debug!(
            target: "switchboard::negotiation",
            peer = %session.remote(),
            ?role,
            generation,
            "session opened"
        );
        match self.sessions.entry(peer) {
            Entry::Occupied(mut entry) => {
                entry.insert(session);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(session),
        }
    }

    fn allocate_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn announce_channel(&self, peer: &PeerId) {
        if let Some(session) = self.sessions.get(peer) {
            tracing::info!(target: "switchboard::negotiation", peer = %peer, "message channel ready");
            self.emit(CallEvent::ChannelReady {
                peer: peer.clone(),
                channel: session.channel().clone(),
            });
        }
    }

    fn emit_status(&self, peer: &PeerId) {
        if let Some(state) = self.state(peer) {
            self.emit(CallEvent::StatusChanged {
                peer: peer.clone(),
                state,
            });
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

/// Posts [`NegotiatorEvent::Deadline`] for `generation` once `after` has elapsed.
fn spawn_deadline(
    inbox: mpsc::UnboundedSender<NegotiatorEvent>,
    peer: PeerId,
    generation: u64,
    after: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = inbox.send(NegotiatorEvent::Deadline { peer, generation });
    })
}
