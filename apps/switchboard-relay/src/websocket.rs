use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use switchboard::{Envelope, EnvelopeKind, PeerId};

/// Outbound queue of one connected identity.
struct PeerConnection {
    connection_id: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Registry of connected identities.
#[derive(Clone, Default)]
pub struct RelayState {
    peers: Arc<DashMap<PeerId, PeerConnection>>,
    next_connection: Arc<AtomicU64>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.peers.iter().map(|entry| entry.key().clone()).collect();
        peers.sort();
        peers
    }

    /// Claims `identity` for a new connection. `None` when it is already taken.
    fn register(&self, identity: PeerId) -> Option<(Registration, mpsc::UnboundedReceiver<Envelope>)> {
        match self.peers.entry(identity.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = mpsc::unbounded_channel();
                slot.insert(PeerConnection { connection_id, tx });
                let registration = Registration {
                    identity,
                    connection_id,
                    state: self.clone(),
                };
                Some((registration, rx))
            }
        }
    }

    fn unregister(&self, identity: &PeerId, connection_id: u64) {
        let removed = self
            .peers
            .remove_if(identity, |_, peer| peer.connection_id == connection_id);
        if removed.is_some() {
            info!(target: "switchboard::relay", identity = %identity, "peer disconnected");
        }
    }

    fn send_to(&self, identity: &PeerId, envelope: Envelope) -> bool {
        match self.peers.get(identity) {
            Some(peer) => peer.tx.send(envelope).is_ok(),
            None => false,
        }
    }

    fn peers_except(&self, identity: &PeerId) -> Vec<PeerId> {
        let mut peers = self.connected();
        peers.retain(|peer| peer != identity);
        peers
    }
}

/// Holds an identity for the lifetime of one connection, including the upgrade in between.
struct Registration {
    identity: PeerId,
    connection_id: u64,
    state: RelayState,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.state.unregister(&self.identity, self.connection_id);
    }
}

#[derive(Debug, Deserialize)]
pub struct Handshake {
    #[serde(default)]
    id: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(handshake): Query<Handshake>,
    State(state): State<RelayState>,
) -> Response {
    let identity = match handshake.id.map(PeerId::new) {
        Some(Ok(identity)) => identity,
        _ => {
            debug!(target: "switchboard::relay", "handshake without identity");
            return (StatusCode::BAD_REQUEST, "missing identity").into_response();
        }
    };

    let Some((registration, outbound)) = state.register(identity.clone()) else {
        info!(target: "switchboard::relay", identity = %identity, "identity already connected");
        return (StatusCode::CONFLICT, "identity already connected").into_response();
    };

    info!(target: "switchboard::relay", identity = %identity, "peer connected");
    ws.on_upgrade(move |socket| handle_socket(socket, registration, outbound))
}

async fn handle_socket(
    socket: WebSocket,
    registration: Registration,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) {
    let identity = registration.identity.clone();
    let state = registration.state.clone();
    let (mut sink, mut stream) = socket.split();

    let writer_identity = identity.clone();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(err) => {
                    warn!(target: "switchboard::relay", error = %err, "failed to encode envelope");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(target: "switchboard::relay", identity = %writer_identity, "writer ended");
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(target: "switchboard::relay", identity = %identity, error = %err, "socket error");
                break;
            }
        };
        match frame {
            Message::Text(text) => handle_text(&state, &identity, &text),
            Message::Close(_) => break,
            _ => {}
        }
    }

    drop(registration);
    writer.abort();
}

fn handle_text(state: &RelayState, identity: &PeerId, text: &str) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(target: "switchboard::relay", identity = %identity, error = %err, "dropping malformed envelope");
            return;
        }
    };

    match envelope.kind {
        EnvelopeKind::GetPeers => {
            let peers = state.peers_except(identity);
            state.send_to(identity, Envelope::peer_list(&peers));
        }
        EnvelopeKind::PeerList => {
            warn!(target: "switchboard::relay", identity = %identity, "peer-list is relay-originated; dropping");
        }
        EnvelopeKind::Offer | EnvelopeKind::Answer | EnvelopeKind::IceCandidate => {
            let Some(target) = envelope.to.clone() else {
                warn!(target: "switchboard::relay", identity = %identity, kind = %envelope.kind, "envelope without target");
                return;
            };
            let kind = envelope.kind;
            if !state.send_to(&target, envelope.with_sender(identity.clone())) {
                info!(
                    target: "switchboard::relay",
                    from = %identity,
                    to = %target,
                    kind = %kind,
                    "target not connected; dropping"
                );
            }
        }
    }
}
