//! Transport Session Adapter.
//!
//! Owns one transport session on behalf of a negotiation session. Commands run strictly in
//! submission order on a worker task and their outcomes are posted back to the negotiator's
//! inbox tagged with the owning session's generation. Dropping the adapter stops the worker,
//! which closes the transport session on every exit path.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::negotiation::{NegotiatorEvent, SessionUpdate};
use crate::protocol::{CandidateSignal, Envelope, PeerId, SdpKind, SessionDescription};
use crate::relay::EnvelopeSender;
use crate::transport::{
    LocalTrack, TransportConfig, TransportEvent, TransportFactory, TransportSession,
};

/// Capability call that failed, as reported in [`SessionUpdate::CommandFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    CreateSession,
    AddLocalTrack,
    CreateOrderedChannel,
    CreateLocalDescription,
    SetLocalDescription,
    SetRemoteDescription,
    AddCandidate,
}

#[derive(Debug)]
pub(crate) enum TransportCommand {
    AddLocalTrack(LocalTrack),
    CreateOrderedChannel(String),
    /// Creates the local description; the negotiator sends it before applying it.
    PrepareLocalDescription(SdpKind),
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddCandidate(CandidateSignal),
}

impl TransportCommand {
    fn kind(&self) -> CommandKind {
        match self {
            TransportCommand::AddLocalTrack(_) => CommandKind::AddLocalTrack,
            TransportCommand::CreateOrderedChannel(_) => CommandKind::CreateOrderedChannel,
            TransportCommand::PrepareLocalDescription(_) => CommandKind::CreateLocalDescription,
            TransportCommand::SetLocalDescription(_) => CommandKind::SetLocalDescription,
            TransportCommand::SetRemoteDescription(_) => CommandKind::SetRemoteDescription,
            TransportCommand::AddCandidate(_) => CommandKind::AddCandidate,
        }
    }
}

pub(crate) struct TransportSessionAdapter {
    commands: mpsc::UnboundedSender<TransportCommand>,
    shutdown: Option<oneshot::Sender<()>>,
    pump: JoinHandle<()>,
}

impl TransportSessionAdapter {
    pub(crate) fn spawn(
        factory: Arc<dyn TransportFactory>,
        config: TransportConfig,
        remote: PeerId,
        generation: u64,
        relay: EnvelopeSender,
        inbox: mpsc::UnboundedSender<NegotiatorEvent>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reporter = Reporter {
            remote: remote.clone(),
            generation,
            inbox: inbox.clone(),
        };
        tokio::spawn(run_worker(
            factory,
            config,
            events_tx,
            commands_rx,
            shutdown_rx,
            reporter.clone(),
        ));
        let pump = tokio::spawn(run_pump(events_rx, relay, reporter));

        tracing::debug!(
            target: "switchboard::adapter",
            remote = %remote,
            generation,
            "transport session requested"
        );
        Self {
            commands: commands_tx,
            shutdown: Some(shutdown_tx),
            pump,
        }
    }

    pub(crate) fn submit(&self, command: TransportCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

impl Drop for TransportSessionAdapter {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.pump.abort();
    }
}

#[derive(Clone)]
struct Reporter {
    remote: PeerId,
    generation: u64,
    inbox: mpsc::UnboundedSender<NegotiatorEvent>,
}

impl Reporter {
    fn post(&self, update: SessionUpdate) -> bool {
        self.inbox
            .send(NegotiatorEvent::Session {
                peer: self.remote.clone(),
                generation: self.generation,
                update,
            })
            .is_ok()
    }
}

async fn run_worker(
    factory: Arc<dyn TransportFactory>,
    config: TransportConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    mut shutdown: oneshot::Receiver<()>,
    reporter: Reporter,
) {
    let session = tokio::select! {
        biased;
        _ = &mut shutdown => return,
        created = factory.create_session(&config, events) => match created {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(
                    target: "switchboard::adapter",
                    remote = %reporter.remote,
                    error = %error,
                    "transport session unavailable"
                );
                reporter.post(SessionUpdate::CommandFailed {
                    command: CommandKind::CreateSession,
                    error,
                });
                return;
            }
        },
    };

    loop {
        let command = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            next = commands.recv() => match next {
                Some(command) => command,
                None => break,
            },
        };
        let kind = command.kind();
        let outcome = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            outcome = execute(session.as_ref(), command) => outcome,
        };
        match outcome {
            Ok(Some(update)) => {
                reporter.post(update);
            }
            Ok(None) => {}
            Err(error) => {
                tracing::debug!(
                    target: "switchboard::adapter",
                    remote = %reporter.remote,
                    command = ?kind,
                    error = %error,
                    "transport command failed"
                );
                reporter.post(SessionUpdate::CommandFailed {
                    command: kind,
                    error,
                });
            }
        }
    }

    if let Err(err) = session.close().await {
        tracing::debug!(target: "switchboard::adapter", remote = %reporter.remote, error = %err, "transport close failed");
    }
    tracing::debug!(
        target: "switchboard::adapter",
        remote = %reporter.remote,
        generation = reporter.generation,
        "transport session released"
    );
}

async fn execute(
    session: &dyn TransportSession,
    command: TransportCommand,
) -> Result<Option<SessionUpdate>, TransportError> {
    match command {
        TransportCommand::AddLocalTrack(track) => {
            session.add_local_track(&track).await?;
            Ok(None)
        }
        TransportCommand::CreateOrderedChannel(label) => {
            session.create_ordered_channel(&label).await?;
            Ok(None)
        }
        TransportCommand::PrepareLocalDescription(kind) => {
            let description = session.create_local_description(kind).await?;
            Ok(Some(SessionUpdate::LocalDescriptionReady(description)))
        }
        TransportCommand::SetLocalDescription(description) => {
            session.set_local_description(description).await?;
            Ok(None)
        }
        TransportCommand::SetRemoteDescription(description) => {
            session.set_remote_description(description).await?;
            Ok(Some(SessionUpdate::RemoteDescriptionApplied))
        }
        TransportCommand::AddCandidate(candidate) => {
            session.add_candidate(candidate).await?;
            Ok(None)
        }
    }
}

async fn run_pump(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    relay: EnvelopeSender,
    reporter: Reporter,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::LocalCandidate(signal) => {
                relay.send(Envelope::ice_candidate(reporter.remote.clone(), &signal));
            }
            other => {
                if !reporter.post(SessionUpdate::Transport(other)) {
                    break;
                }
            }
        }
    }
}
