//! Peer-to-peer call negotiation over an envelope relay.
//!
//! Two endpoints that cannot reach each other directly exchange offers, answers and
//! connectivity candidates through a relay until the transport layer opens a direct
//! session. The [`negotiation::Negotiator`] owns one negotiation session
//! per remote peer and processes every relay and transport event for it in arrival order.

pub mod channel;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod negotiation;
pub mod protocol;
pub mod relay;
pub mod transport;

mod adapter;

pub use channel::MessageChannel;
pub use client::{CallEvents, Client, ClientHandle};
pub use config::ClientConfig;
pub use directory::PeerDirectory;
pub use error::{
    ChannelError, ClientError, ConfigError, ConnectionError, DirectoryError, NegotiationError,
    TransportError,
};
pub use events::{CallEvent, CloseReason};
pub use negotiation::{NegotiationPhase, Negotiator, Role, SessionState};
pub use protocol::{CandidateSignal, Envelope, EnvelopeKind, IceCandidate, PeerId, SdpKind, SessionDescription};
pub use relay::{EnvelopeSender, RelayClient, RelayEvent};
