use std::collections::VecDeque;
use std::fmt;

use tokio::task::JoinHandle;

use crate::adapter::{TransportCommand, TransportSessionAdapter};
use crate::channel::MessageChannel;
use crate::protocol::{CandidateSignal, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationPhase {
    Offering,
    Answering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Negotiating(NegotiationPhase),
    Connected,
    Closed,
}

impl SessionState {
    pub fn is_live(&self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Negotiating(NegotiationPhase::Offering) => f.write_str("offering"),
            SessionState::Negotiating(NegotiationPhase::Answering) => f.write_str("answering"),
            SessionState::Connected => f.write_str("connected"),
            SessionState::Closed => f.write_str("closed"),
        }
    }
}

/// Candidates a session holds before its remote description is applied.
pub(crate) const MAX_PENDING_CANDIDATES: usize = 64;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CandidateDisposition {
    Apply(CandidateSignal),
    Queued,
    /// The queue is full; the candidate is discarded.
    Overflow,
}

/// Negotiation state for one remote peer.
///
/// Candidates that arrive before the remote description is applied wait in `pending`
/// and are released, in receipt order, by [`NegotiationSession::remote_description_applied`].
pub(crate) struct NegotiationSession {
    remote: PeerId,
    role: Role,
    generation: u64,
    state: SessionState,
    pending: VecDeque<CandidateSignal>,
    remote_description_set: bool,
    transport: Option<TransportSessionAdapter>,
    channel: MessageChannel,
    channel_announced: bool,
    deadline: Option<JoinHandle<()>>,
}

impl NegotiationSession {
    /// Placeholder for a peer whose candidates arrived before its offer.
    pub(crate) fn idle(remote: PeerId, generation: u64) -> Self {
        Self {
            remote,
            role: Role::Callee,
            generation,
            state: SessionState::Idle,
            pending: VecDeque::new(),
            remote_description_set: false,
            transport: None,
            channel: MessageChannel::new(),
            channel_announced: false,
            deadline: None,
        }
    }

    pub(crate) fn negotiating(
        remote: PeerId,
        role: Role,
        generation: u64,
        transport: TransportSessionAdapter,
    ) -> Self {
        let phase = match role {
            Role::Caller => NegotiationPhase::Offering,
            Role::Callee => NegotiationPhase::Answering,
        };
        Self {
            role,
            state: SessionState::Negotiating(phase),
            transport: Some(transport),
            ..Self::idle(remote, generation)
        }
    }

    pub(crate) fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    pub(crate) fn pending(&self) -> impl Iterator<Item = &CandidateSignal> {
        self.pending.iter()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub(crate) fn set_deadline(&mut self, deadline: JoinHandle<()>) {
        if let Some(previous) = self.deadline.replace(deadline) {
            previous.abort();
        }
    }

    pub(crate) fn submit(&self, command: TransportCommand) -> bool {
        match &self.transport {
            Some(transport) => transport.submit(command),
            None => false,
        }
    }

    pub(crate) fn accept_candidate(&mut self, signal: CandidateSignal) -> CandidateDisposition {
        if self.remote_description_set {
            CandidateDisposition::Apply(signal)
        } else if self.pending.len() >= MAX_PENDING_CANDIDATES {
            CandidateDisposition::Overflow
        } else {
            self.pending.push_back(signal);
            CandidateDisposition::Queued
        }
    }

    /// Moves the queue out, used when an offer adopts an idle placeholder's candidates.
    pub(crate) fn take_pending(&mut self) -> VecDeque<CandidateSignal> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn adopt_pending(&mut self, pending: VecDeque<CandidateSignal>) {
        let mut adopted = pending;
        adopted.extend(self.pending.drain(..));
        adopted.truncate(MAX_PENDING_CANDIDATES);
        self.pending = adopted;
    }

    /// Marks the remote description set and drains the queue in receipt order.
    pub(crate) fn remote_description_applied(&mut self) -> Vec<CandidateSignal> {
        self.remote_description_set = true;
        self.pending.drain(..).collect()
    }

    /// Returns true when the state changed.
    pub(crate) fn mark_connected(&mut self) -> bool {
        match self.state {
            SessionState::Negotiating(_) => {
                self.state = SessionState::Connected;
                self.channel.set_connected();
                if let Some(deadline) = self.deadline.take() {
                    deadline.abort();
                }
                true
            }
            _ => false,
        }
    }

    /// Whether the channel should be announced now. True at most once per session.
    pub(crate) fn channel_ready(&mut self) -> bool {
        if self.channel_announced || !self.channel.is_open() {
            return false;
        }
        self.channel_announced = true;
        true
    }

    /// Releases the channel carrying `label`. A channel attached afterwards is announced again.
    pub(crate) fn channel_closed(&mut self, label: &str) -> bool {
        if !self.channel.detach(label) {
            return false;
        }
        self.channel_announced = false;
        true
    }

    /// Releases the transport, clears the queue and invalidates the channel.
    /// Returns false when the session was already closed.
    pub(crate) fn teardown(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = SessionState::Closed;
        self.pending.clear();
        self.channel.invalidate();
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        drop(self.transport.take());
        true
    }
}
