use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::MessageChannel;
use crate::config::ClientConfig;
use crate::directory::PeerDirectory;
use crate::error::{ClientError, DirectoryError};
use crate::events::CallEvent;
use crate::negotiation::{Negotiator, NegotiatorCommand, NegotiatorConfig, NegotiatorEvent, SessionState};
use crate::protocol::PeerId;
use crate::relay::RelayClient;
use crate::transport::{TransportFactory, WebRtcTransportFactory};

/// Entry point: a relay link plus the negotiator task driving every call.
pub struct Client;

impl Client {
    /// Connects with the webrtc-rs transport.
    pub async fn connect(
        config: ClientConfig,
        identity: &str,
    ) -> Result<(ClientHandle, CallEvents), ClientError> {
        let factory = Arc::new(WebRtcTransportFactory::new()?);
        Self::connect_with(config, identity, factory).await
    }

    pub async fn connect_with(
        config: ClientConfig,
        identity: &str,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<(ClientHandle, CallEvents), ClientError> {
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut relay = RelayClient::new(config.relay_url.clone(), relay_tx);
        let local = relay.connect(identity).await?;

        let directory = Arc::new(RwLock::new(PeerDirectory::new()));
        let negotiator = Negotiator::new(
            factory,
            NegotiatorConfig::from(&config),
            relay.sender(),
            directory.clone(),
            inbox_tx.clone(),
            events_tx,
        );

        let forward_inbox = inbox_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = relay_rx.recv().await {
                if forward_inbox.send(NegotiatorEvent::Relay(event)).is_err() {
                    break;
                }
            }
        });
        let negotiator_task = tokio::spawn(negotiator.run(inbox_rx));

        let handle = ClientHandle {
            inner: Arc::new(ClientInner {
                relay: AsyncMutex::new(relay),
                inbox: inbox_tx,
                directory,
                identity: RwLock::new(Some(local)),
                forwarder: Mutex::new(Some(forwarder)),
                negotiator: Mutex::new(Some(negotiator_task)),
            }),
        };
        Ok((handle, CallEvents { rx: events_rx }))
    }
}

/// Stream of [`CallEvent`]s for the presentation layer.
pub struct CallEvents {
    rx: mpsc::UnboundedReceiver<CallEvent>,
}

impl CallEvents {
    pub async fn recv(&mut self) -> Option<CallEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CallEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    relay: AsyncMutex<RelayClient>,
    inbox: mpsc::UnboundedSender<NegotiatorEvent>,
    directory: Arc<RwLock<PeerDirectory>>,
    identity: RwLock<Option<PeerId>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    negotiator: Mutex<Option<JoinHandle<()>>>,
}

impl ClientHandle {
    pub fn identity(&self) -> Option<PeerId> {
        self.inner.identity.read().clone()
    }

    /// Cached peer list from the last refresh.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.directory.read().peers().to_vec()
    }

    pub fn refresh_peers(&self) -> Result<(), ClientError> {
        self.command(NegotiatorCommand::RefreshPeers)
    }

    /// Calls a peer picked from the directory. The returned channel becomes usable once
    /// [`CallEvent::ChannelReady`] fires for the peer.
    pub async fn call(&self, peer: &str) -> Result<MessageChannel, ClientError> {
        let peer = self.inner.directory.read().select(peer)?;
        let (reply, rx) = oneshot::channel();
        self.command(NegotiatorCommand::Call { peer, reply })?;
        Ok(rx.await.map_err(|_| ClientError::Closed)??)
    }

    pub fn hang_up(&self, peer: &str) -> Result<(), ClientError> {
        let peer = parse_peer(peer)?;
        self.command(NegotiatorCommand::HangUp { peer })
    }

    pub async fn channel(&self, peer: &str) -> Result<Option<MessageChannel>, ClientError> {
        let peer = parse_peer(peer)?;
        let (reply, rx) = oneshot::channel();
        self.command(NegotiatorCommand::Channel { peer, reply })?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub async fn state(&self, peer: &str) -> Result<Option<SessionState>, ClientError> {
        let peer = parse_peer(peer)?;
        let (reply, rx) = oneshot::channel();
        self.command(NegotiatorCommand::State { peer, reply })?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Replaces the relay link. Every session of the old link is torn down first.
    pub async fn reconnect(&self, identity: &str) -> Result<PeerId, ClientError> {
        let mut relay = self.inner.relay.lock().await;
        match relay.connect(identity).await {
            Ok(local) => {
                *self.inner.identity.write() = Some(local.clone());
                Ok(local)
            }
            Err(err) => {
                *self.inner.identity.write() = None;
                Err(err.into())
            }
        }
    }

    /// Closes every session, then the relay link.
    pub async fn shutdown(&self) {
        let _ = self
            .inner
            .inbox
            .send(NegotiatorEvent::Command(NegotiatorCommand::Shutdown));
        let negotiator = self.inner.negotiator.lock().take();
        if let Some(negotiator) = negotiator {
            if let Err(err) = negotiator.await {
                tracing::warn!(target: "switchboard::client", error = %err, "negotiator task failed");
            }
        }
        self.inner.relay.lock().await.disconnect();
        *self.inner.identity.write() = None;
        if let Some(forwarder) = self.inner.forwarder.lock().take() {
            forwarder.abort();
        }
    }

    fn command(&self, command: NegotiatorCommand) -> Result<(), ClientError> {
        self.inner
            .inbox
            .send(NegotiatorEvent::Command(command))
            .map_err(|_| ClientError::Closed)
    }
}

fn parse_peer(peer: &str) -> Result<PeerId, ClientError> {
    PeerId::new(peer).map_err(|_| DirectoryError::UnknownPeer(peer.to_string()).into())
}
