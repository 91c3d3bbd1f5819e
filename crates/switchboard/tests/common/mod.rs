#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use switchboard::events::{CallEvent, CloseReason};
use switchboard::negotiation::{Negotiator, NegotiatorConfig, NegotiatorEvent, SessionState};
use switchboard::protocol::{Envelope, EnvelopeKind, PeerId};
use switchboard::relay::{EnvelopeSender, RelayEvent};
use switchboard::transport::mock::{MockTransportFactory, MockTransportSession};
use switchboard::PeerDirectory;

pub fn peer(id: &str) -> PeerId {
    PeerId::new(id).expect("valid peer id")
}

/// A negotiator wired to an in-memory relay link and the mock transport.
pub struct Endpoint {
    pub id: PeerId,
    pub negotiator: Negotiator,
    pub factory: MockTransportFactory,
    pub directory: Arc<RwLock<PeerDirectory>>,
    /// Every envelope this endpoint handed to the relay, in order.
    pub sent: Vec<Envelope>,
    pub call_events: Vec<CallEvent>,
    inbox: mpsc::UnboundedReceiver<NegotiatorEvent>,
    relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    link: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedReceiver<CallEvent>,
}

impl Endpoint {
    pub fn new(id: &str) -> Self {
        Self::with_config(id, NegotiatorConfig::default())
    }

    pub fn with_config(id: &str, config: NegotiatorConfig) -> Self {
        let id = peer(id);
        let factory = MockTransportFactory::new();
        let (relay_events_tx, relay_events) = mpsc::unbounded_channel();
        let (link_tx, link) = mpsc::unbounded_channel();
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let directory = Arc::new(RwLock::new(PeerDirectory::new()));
        let mut negotiator = Negotiator::new(
            Arc::new(factory.clone()),
            config,
            EnvelopeSender::direct(relay_events_tx, link_tx),
            directory.clone(),
            inbox_tx,
            events_tx,
        );
        negotiator.set_local(Some(id.clone()));
        Self {
            id,
            negotiator,
            factory,
            directory,
            sent: Vec::new(),
            call_events: Vec::new(),
            inbox,
            relay_events,
            link,
            events,
        }
    }

    /// Handles everything already queued for this endpoint.
    pub fn step(&mut self) -> bool {
        let mut progressed = false;
        while let Ok(event) = self.relay_events.try_recv() {
            self.negotiator.handle(NegotiatorEvent::Relay(event));
            progressed = true;
        }
        while let Ok(event) = self.inbox.try_recv() {
            self.negotiator.handle(event);
            progressed = true;
        }
        while let Ok(event) = self.events.try_recv() {
            self.call_events.push(event);
        }
        progressed
    }

    pub fn drain_outbound(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.link.try_recv() {
            self.sent.push(envelope.clone());
            out.push(envelope);
        }
        out
    }

    pub fn deliver(&mut self, envelope: Envelope) {
        self.negotiator
            .handle(NegotiatorEvent::Relay(RelayEvent::Envelope(envelope)));
    }

    pub fn state_with(&self, other: &PeerId) -> Option<SessionState> {
        self.negotiator.state(other)
    }

    pub fn last_session(&self) -> Arc<MockTransportSession> {
        self.factory.last_session().expect("a transport session")
    }

    pub fn sent_kinds(&self) -> Vec<EnvelopeKind> {
        self.sent.iter().map(|envelope| envelope.kind).collect()
    }

    pub fn close_reasons(&self, other: &PeerId) -> Vec<CloseReason> {
        self.call_events
            .iter()
            .filter_map(|event| match event {
                CallEvent::CallClosed { peer, reason } if peer == other => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn saw(&self, predicate: impl Fn(&CallEvent) -> bool) -> bool {
        self.call_events.iter().any(predicate)
    }
}

/// Runs every endpoint and routes envelopes between them, stamping `from` like the relay,
/// until nothing has happened for a few consecutive rounds.
pub async fn settle(endpoints: &mut [&mut Endpoint]) {
    let mut idle_rounds = 0;
    while idle_rounds < 10 {
        let mut progressed = false;
        for endpoint in endpoints.iter_mut() {
            progressed |= endpoint.step();
        }

        let mut in_flight = Vec::new();
        for endpoint in endpoints.iter_mut() {
            let from = endpoint.id.clone();
            for envelope in endpoint.drain_outbound() {
                in_flight.push(envelope.with_sender(from.clone()));
            }
        }
        for envelope in in_flight {
            progressed = true;
            let Some(to) = envelope.to.clone() else {
                continue;
            };
            if let Some(target) = endpoints.iter_mut().find(|endpoint| endpoint.id == to) {
                target.deliver(envelope);
            }
        }

        if progressed {
            idle_rounds = 0;
        } else {
            idle_rounds += 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
