//! Relay Client: one websocket link to the relay, carrying envelopes both ways.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use crate::error::ConnectionError;
use crate::protocol::{Envelope, PeerId};

#[derive(Debug, Clone)]
pub enum RelayEvent {
    Open { identity: PeerId },
    Close { identity: PeerId },
    Envelope(Envelope),
    Error(String),
}

pub type RelayEventSender = mpsc::UnboundedSender<RelayEvent>;

/// Cloneable handle on the current link's send queue.
///
/// Sessions only ever append to the queue. Sending while no link is up reports a
/// [`RelayEvent::Error`] instead of failing the caller.
#[derive(Clone)]
pub struct EnvelopeSender {
    link: Arc<RwLock<Option<LinkSender>>>,
    events: RelayEventSender,
}

#[derive(Clone)]
struct LinkSender {
    link_id: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EnvelopeSender {
    pub fn new(events: RelayEventSender) -> Self {
        Self {
            link: Arc::new(RwLock::new(None)),
            events,
        }
    }

    fn attach(&self, link_id: u64, tx: mpsc::UnboundedSender<Envelope>) {
        *self.link.write() = Some(LinkSender { link_id, tx });
    }

    /// Returns true when `link_id` was the attached link.
    fn detach(&self, link_id: u64) -> bool {
        let mut link = self.link.write();
        if link.as_ref().is_some_and(|current| current.link_id == link_id) {
            *link = None;
            true
        } else {
            false
        }
    }

    pub fn is_up(&self) -> bool {
        self.link.read().is_some()
    }

    pub fn send(&self, envelope: Envelope) {
        let kind = envelope.kind;
        let result = match self.link.read().as_ref() {
            Some(link) => link.tx.send(envelope).map_err(|_| "relay link writer stopped"),
            None => Err("relay link is down"),
        };
        match result {
            Ok(()) => {
                tracing::trace!(target: "switchboard::relay", %kind, "envelope queued");
            }
            Err(reason) => {
                tracing::debug!(target: "switchboard::relay", %kind, reason, "dropping envelope");
                let _ = self.events.send(RelayEvent::Error(format!(
                    "cannot send {kind}: {reason}"
                )));
            }
        }
    }

    /// Builds a sender that hands envelopes to `tx` directly, with no websocket underneath.
    /// In-process relays in tests are wired this way.
    pub fn direct(events: RelayEventSender, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        let sender = Self::new(events);
        sender.attach(0, tx);
        sender
    }
}

struct Link {
    id: u64,
    identity: PeerId,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

pub struct RelayClient {
    url: Url,
    sender: EnvelopeSender,
    events: RelayEventSender,
    next_link: AtomicU64,
    link: Option<Link>,
}

impl RelayClient {
    pub fn new(url: Url, events: RelayEventSender) -> Self {
        Self {
            url,
            sender: EnvelopeSender::new(events.clone()),
            events,
            next_link: AtomicU64::new(1),
            link: None,
        }
    }

    pub fn sender(&self) -> EnvelopeSender {
        self.sender.clone()
    }

    pub fn identity(&self) -> Option<&PeerId> {
        self.link.as_ref().map(|link| &link.identity)
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some() && self.sender.is_up()
    }

    /// Opens a link announcing `identity`, tearing down any link already held.
    pub async fn connect(&mut self, identity: &str) -> Result<PeerId, ConnectionError> {
        let identity = PeerId::new(identity)?;
        self.disconnect();

        let url = link_url(&self.url, &identity)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| map_connect_error(&identity, err))?;
        tracing::info!(target: "switchboard::relay", url = %url, identity = %identity, "relay link open");

        let (mut ws_write, mut ws_read) = stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Envelope>();
        let link_id = self.next_link.fetch_add(1, Ordering::Relaxed);
        self.sender.attach(link_id, send_tx);
        let _ = self.events.send(RelayEvent::Open {
            identity: identity.clone(),
        });

        let writer = tokio::spawn(async move {
            while let Some(envelope) = send_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target: "switchboard::relay", error = %err, "failed to encode envelope");
                        continue;
                    }
                };
                if let Err(err) = ws_write.send(Message::Text(text)).await {
                    tracing::debug!(target: "switchboard::relay", error = %err, "relay writer stopped");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_sender = self.sender.clone();
        let reader_events = self.events.clone();
        let reader_identity = identity.clone();
        let reader = tokio::spawn(async move {
            let mut failure = None;
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => {
                            tracing::trace!(
                                target: "switchboard::relay",
                                kind = %envelope.kind,
                                from = ?envelope.from,
                                "envelope received"
                            );
                            let _ = reader_events.send(RelayEvent::Envelope(envelope));
                        }
                        Err(err) => {
                            tracing::warn!(
                                target: "switchboard::relay",
                                error = %err,
                                "discarding unparseable envelope"
                            );
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        failure = Some(err.to_string());
                        break;
                    }
                }
            }
            // A newer link may already own the sender; only the current one reports closure.
            if reader_sender.detach(link_id) {
                if let Some(reason) = failure {
                    tracing::warn!(target: "switchboard::relay", error = %reason, "relay link failed");
                    let _ = reader_events.send(RelayEvent::Error(reason));
                }
                tracing::info!(target: "switchboard::relay", identity = %reader_identity, "relay link closed");
                let _ = reader_events.send(RelayEvent::Close {
                    identity: reader_identity,
                });
            }
        });

        self.link = Some(Link {
            id: link_id,
            identity: identity.clone(),
            writer,
            reader,
        });
        Ok(identity)
    }

    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            let was_current = self.sender.detach(link.id);
            let identity = link.identity.clone();
            drop(link);
            if was_current {
                tracing::info!(target: "switchboard::relay", identity = %identity, "relay link closed locally");
                let _ = self.events.send(RelayEvent::Close { identity });
            }
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            self.sender.detach(link.id);
        }
    }
}

fn link_url(base: &Url, identity: &PeerId) -> Result<Url, ConnectionError> {
    let mut url = base.clone();
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(ConnectionError::InvalidUrl {
                url: base.to_string(),
                reason: format!("unsupported scheme {other}"),
            });
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::InvalidUrl {
            url: base.to_string(),
            reason: "cannot switch to a websocket scheme".into(),
        })?;
    url.query_pairs_mut()
        .clear()
        .append_pair("id", identity.as_str());
    Ok(url)
}

fn map_connect_error(identity: &PeerId, err: WsError) -> ConnectionError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            let reason = match status.as_u16() {
                409 => "identity already connected".to_string(),
                400 => "identity rejected".to_string(),
                _ => format!("handshake refused with {status}"),
            };
            ConnectionError::Rejected {
                identity: identity.clone(),
                reason,
            }
        }
        WsError::Url(err) => ConnectionError::InvalidUrl {
            url: String::new(),
            reason: err.to_string(),
        },
        other => ConnectionError::Network(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    #[test]
    fn link_url_appends_identity_and_upgrades_scheme() {
        let base = Url::parse("https://relay.example.com/ws").unwrap();
        let url = link_url(&base, &peer("al ice")).unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/ws?id=al+ice");

        let base = Url::parse("ws://127.0.0.1:8080/ws?id=stale").unwrap();
        let url = link_url(&base, &peer("bob")).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/ws?id=bob");
    }

    #[tokio::test]
    async fn sending_without_a_link_reports_an_error() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let sender = EnvelopeSender::new(events_tx);
        assert!(!sender.is_up());
        sender.send(Envelope::get_peers());
        assert!(matches!(events_rx.recv().await, Some(RelayEvent::Error(_))));
    }

    #[tokio::test]
    async fn stale_link_cannot_detach_a_newer_one() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let sender = EnvelopeSender::new(events_tx);
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        sender.attach(1, old_tx);
        sender.attach(2, new_tx);
        assert!(!sender.detach(1));
        sender.send(Envelope::get_peers());
        assert_eq!(new_rx.recv().await, Some(Envelope::get_peers()));
        assert!(sender.detach(2));
        assert!(!sender.is_up());
    }

    #[tokio::test]
    async fn connect_rejects_empty_identity() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut client = RelayClient::new(Url::parse("ws://127.0.0.1:9/ws").unwrap(), events_tx);
        let result = client.connect("  ").await;
        assert!(matches!(result, Err(ConnectionError::InvalidIdentity(_))));
        assert!(!client.is_connected());
    }
}
