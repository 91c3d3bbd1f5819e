use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectivityState, DataChannel, LocalTrack, RemoteTrack, TrackKind, TransportConfig,
    TransportEvent, TransportEventSender, TransportFactory, TransportSession,
};
use crate::error::TransportError;
use crate::protocol::{CandidateSignal, IceCandidate, SdpKind, SessionDescription};

/// Builds webrtc-rs peer connections with the default codecs and interceptors.
pub struct WebRtcTransportFactory {
    api: API,
}

impl WebRtcTransportFactory {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self { api: build_api()? })
    }
}

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create_session(
        &self,
        config: &TransportConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let pc = self
            .api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(to_setup_error)?;
        let pc = Arc::new(pc);
        install_hooks(&pc, &events);
        tracing::debug!(target: "switchboard::transport", "peer connection created");
        Ok(Arc::new(WebRtcSession { pc, events }))
    }
}

fn install_hooks(pc: &Arc<RTCPeerConnection>, events: &TransportEventSender) {
    let candidate_tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = candidate_tx.clone();
        Box::pin(async move {
            let signal = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => CandidateSignal::Candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(err) => {
                        tracing::warn!(
                            target: "switchboard::transport",
                            error = %err,
                            "failed to serialize local candidate"
                        );
                        return;
                    }
                },
                None => CandidateSignal::EndOfCandidates,
            };
            let _ = tx.send(TransportEvent::LocalCandidate(signal));
        })
    }));

    let state_tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = state_tx.clone();
        Box::pin(async move {
            tracing::debug!(target: "switchboard::transport", ?state, "peer connection state changed");
            let mapped = match state {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                    ConnectivityState::New
                }
                RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
                RTCPeerConnectionState::Connected => ConnectivityState::Connected,
                RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
                RTCPeerConnectionState::Failed => ConnectivityState::Failed,
                RTCPeerConnectionState::Closed => ConnectivityState::Closed,
            };
            let _ = tx.send(TransportEvent::ConnectivityChanged(mapped));
        })
    }));

    let channel_tx = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = channel_tx.clone();
        Box::pin(async move {
            tracing::debug!(
                target: "switchboard::transport",
                label = %dc.label(),
                "remote data channel announced"
            );
            wire_channel(&dc, &tx);
        })
    }));

    let track_tx = events.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let tx = track_tx.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            let _ = tx.send(TransportEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            }));
        })
    }));
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: &TransportEventSender) {
    let label = dc.label().to_string();

    let weak: Weak<RTCDataChannel> = Arc::downgrade(dc);
    let open_tx = events.clone();
    dc.on_open(Box::new(move || {
        let tx = open_tx.clone();
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(inner) = weak.upgrade() {
                tracing::debug!(target: "switchboard::transport", label = %inner.label(), "data channel open");
                let channel: Arc<dyn DataChannel> = Arc::new(WebRtcDataChannel::new(inner));
                let _ = tx.send(TransportEvent::ChannelOpen(channel));
            }
        })
    }));

    let message_tx = events.clone();
    let message_label = label.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = message_tx.clone();
        let label = message_label.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelMessage {
                label,
                payload: msg.data,
            });
        })
    }));

    let close_tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = close_tx.clone();
        let label = label.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelClosed { label });
        })
    }));
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    events: TransportEventSender,
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let mime_type = match track.kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            track.stream_id.clone(),
        ));
        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(to_command_error)?;
        Ok(())
    }

    async fn create_local_description(
        &self,
        kind: SdpKind,
    ) -> Result<SessionDescription, TransportError> {
        let description = match kind {
            SdpKind::Offer => self.pc.create_offer(None).await,
            SdpKind::Answer => self.pc.create_answer(None).await,
        }
        .map_err(to_command_error)?;
        Ok(SessionDescription::new(kind, description.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(to_command_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(to_command_error)
    }

    async fn add_candidate(&self, candidate: CandidateSignal) -> Result<(), TransportError> {
        match candidate {
            CandidateSignal::Candidate(candidate) => self
                .pc
                .add_ice_candidate(RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    username_fragment: candidate.username_fragment,
                })
                .await
                .map_err(to_command_error),
            // webrtc-rs finishes gathering on its own; the sentinel carries nothing to apply.
            CandidateSignal::EndOfCandidates => Ok(()),
        }
    }

    async fn create_ordered_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_command_error)?;
        wire_channel(&dc, &self.events);
        Ok(Arc::new(WebRtcDataChannel::new(dc)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(to_command_error)
    }
}

struct WebRtcDataChannel {
    label: String,
    inner: Arc<RTCDataChannel>,
}

impl WebRtcDataChannel {
    fn new(inner: Arc<RTCDataChannel>) -> Self {
        Self {
            label: inner.label().to_string(),
            inner,
        }
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.inner
            .send(&payload)
            .await
            .map(|_| ())
            .map_err(to_command_error)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await.map_err(to_command_error)
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(to_command_error)
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn to_command_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Command(err.to_string())
}
