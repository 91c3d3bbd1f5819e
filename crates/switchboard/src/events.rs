use std::fmt;

use bytes::Bytes;

use crate::channel::MessageChannel;
use crate::error::{NegotiationError, TransportError};
use crate::negotiation::SessionState;
use crate::protocol::PeerId;
use crate::transport::RemoteTrack;

/// Why a session reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    HungUp,
    /// A new call or offer with the same peer replaced the session.
    Replaced,
    Negotiation(NegotiationError),
    Transport(TransportError),
    RemoteClosed,
    RelayLost,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::HungUp => f.write_str("hung up"),
            CloseReason::Replaced => f.write_str("replaced by a new call"),
            CloseReason::Negotiation(err) => write!(f, "negotiation failed: {err}"),
            CloseReason::Transport(err) => write!(f, "{err}"),
            CloseReason::RemoteClosed => f.write_str("remote closed the connection"),
            CloseReason::RelayLost => f.write_str("relay link lost"),
            CloseReason::Shutdown => f.write_str("client shut down"),
        }
    }
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone)]
pub enum CallEvent {
    RelayConnected { identity: PeerId },
    RelayDisconnected { reason: Option<String> },
    PeersUpdated(Vec<PeerId>),
    CallIncoming { peer: PeerId },
    CallConnected { peer: PeerId },
    ChannelReady { peer: PeerId, channel: MessageChannel },
    MessageReceived { peer: PeerId, payload: Bytes },
    RemoteTrack { peer: PeerId, track: RemoteTrack },
    StatusChanged { peer: PeerId, state: SessionState },
    CallClosed { peer: PeerId, reason: CloseReason },
}
