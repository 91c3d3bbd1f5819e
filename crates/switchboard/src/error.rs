use thiserror::Error;

use crate::protocol::{EnvelopeKind, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("peer identity must not be empty")]
pub struct InvalidPeerId;

/// Relay link failures. Surfaced to the UI; every session is torn down and a reconnect is allowed.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    InvalidIdentity(#[from] InvalidPeerId),
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("relay rejected identity {identity}: {reason}")]
    Rejected { identity: PeerId, reason: String },
    #[error("relay link failed: {0}")]
    Network(String),
    #[error("relay link is closed")]
    Closed,
}

/// Malformed or out-of-sequence envelopes. Logged; the affected session is torn down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("unexpected answer from {0}")]
    UnexpectedAnswer(PeerId),
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: EnvelopeKind, reason: String },
    #[error("{0} envelope has no sender")]
    MissingSender(EnvelopeKind),
    #[error("cannot negotiate a call with ourselves")]
    SelfCall,
    #[error("negotiation with {0} timed out")]
    Timeout(PeerId),
    #[error("negotiator is not running")]
    Stopped,
}

/// Failures reported by the transport layer. The session closes and is not retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport command failed: {0}")]
    Command(String),
    #[error("connectivity failed")]
    ConnectivityFailed,
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("message channel is not open")]
    NotOpen,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("peer {0} is not in the directory")]
    UnknownPeer(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("client has shut down")]
    Closed,
}
