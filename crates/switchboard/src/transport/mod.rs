//! Capability surface consumed from the transport layer.
//!
//! A [`TransportFactory`] creates one [`TransportSession`] per negotiation. The session
//! reports asynchronous happenings (local candidates, connectivity changes, channel and
//! track arrival) through the [`TransportEventSender`] it was created with.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::{CandidateSignal, SdpKind, SessionDescription};

pub mod mock;
pub mod webrtc;

pub use self::webrtc::WebRtcTransportFactory;

#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub ice_servers: Vec<String>,
    pub channel_label: String,
    pub local_tracks: Vec<LocalTrack>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

impl LocalTrack {
    pub fn new(kind: TrackKind) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("{kind}-{n}"),
            stream_id: "switchboard".to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: Option<TrackKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub enum TransportEvent {
    LocalCandidate(CandidateSignal),
    ConnectivityChanged(ConnectivityState),
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelClosed { label: String },
    ChannelMessage { label: String, payload: Bytes },
    RemoteTrack(RemoteTrack),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::LocalCandidate(signal) => {
                f.debug_tuple("LocalCandidate").field(signal).finish()
            }
            TransportEvent::ConnectivityChanged(state) => {
                f.debug_tuple("ConnectivityChanged").field(state).finish()
            }
            TransportEvent::ChannelOpen(channel) => {
                f.debug_tuple("ChannelOpen").field(&channel.label()).finish()
            }
            TransportEvent::ChannelClosed { label } => {
                f.debug_struct("ChannelClosed").field("label", label).finish()
            }
            TransportEvent::ChannelMessage { label, payload } => f
                .debug_struct("ChannelMessage")
                .field("label", label)
                .field("len", &payload.len())
                .finish(),
            TransportEvent::RemoteTrack(track) => f.debug_tuple("RemoteTrack").field(track).finish(),
        }
    }
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_session(
        &self,
        config: &TransportConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    async fn create_local_description(
        &self,
        kind: SdpKind,
    ) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: CandidateSignal) -> Result<(), TransportError>;

    /// Opens an ordered, reliable channel. Readiness arrives later as
    /// [`TransportEvent::ChannelOpen`].
    async fn create_ordered_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
