//! In-process transport that records every capability call.
//!
//! Sessions never touch the network. Tests drive the remote side by injecting
//! [`TransportEvent`]s through [`MockTransportSession::emit`] and its helpers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::{
    ConnectivityState, DataChannel, LocalTrack, RemoteTrack, TrackKind, TransportConfig,
    TransportEvent, TransportEventSender, TransportFactory, TransportSession,
};
use crate::error::TransportError;
use crate::protocol::{CandidateSignal, IceCandidate, SdpKind, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    AddLocalTrack(TrackKind),
    CreateLocalDescription(SdpKind),
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddCandidate(CandidateSignal),
    CreateOrderedChannel(String),
    Close,
}

#[derive(Clone, Default)]
pub struct MockTransportFactory {
    inner: Arc<FactoryInner>,
}

#[derive(Default)]
struct FactoryInner {
    next_id: AtomicU64,
    sessions: Mutex<Vec<Arc<MockTransportSession>>>,
    fail_create: AtomicBool,
    description_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every session created so far, oldest first.
    pub fn sessions(&self) -> Vec<Arc<MockTransportSession>> {
        self.inner.sessions.lock().clone()
    }

    pub fn last_session(&self) -> Option<Arc<MockTransportSession>> {
        self.inner.sessions.lock().last().cloned()
    }

    pub fn fail_create(&self, fail: bool) {
        self.inner.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Blocks local description creation in sessions created from now on until the
    /// returned semaphore gets a permit.
    pub fn gate_descriptions(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.inner.description_gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create_session(
        &self,
        config: &TransportConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        if self.inner.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::Setup("mock factory refused".into()));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(MockTransportSession {
            id,
            channel_label: config.channel_label.clone(),
            events,
            calls: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            gate: self.inner.description_gate.lock().clone(),
        });
        self.inner.sessions.lock().push(session.clone());
        Ok(session)
    }
}

pub struct MockTransportSession {
    id: u64,
    channel_label: String,
    events: TransportEventSender,
    calls: Mutex<Vec<MockCall>>,
    channels: Mutex<Vec<Arc<MockDataChannel>>>,
    closed: AtomicBool,
    gate: Option<Arc<Semaphore>>,
}

impl MockTransportSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Candidates handed to the transport, in the order they were applied.
    pub fn applied_candidates(&self) -> Vec<CandidateSignal> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::AddCandidate(signal) => Some(signal.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            MockCall::SetRemoteDescription(description) => Some(description.clone()),
            _ => None,
        })
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn discover_candidate(&self, candidate: &str) -> bool {
        self.emit(TransportEvent::LocalCandidate(CandidateSignal::Candidate(
            IceCandidate::new(candidate),
        )))
    }

    pub fn connect(&self) -> bool {
        self.emit(TransportEvent::ConnectivityChanged(ConnectivityState::Connected))
    }

    pub fn fail(&self) -> bool {
        self.emit(TransportEvent::ConnectivityChanged(ConnectivityState::Failed))
    }

    /// Marks the session's ordered channel open and announces it.
    pub fn open_channel(&self) -> Arc<MockDataChannel> {
        let channel = self.channel(&self.channel_label);
        self.emit(TransportEvent::ChannelOpen(channel.clone()));
        channel
    }

    /// Closes the ordered channel; a later [`open_channel`](Self::open_channel) opens a fresh one.
    pub fn close_channel(&self) -> bool {
        let mut channels = self.channels.lock();
        if let Some(at) = channels.iter().position(|channel| channel.label == self.channel_label) {
            channels.remove(at).closed.store(true, Ordering::SeqCst);
        }
        drop(channels);
        self.emit(TransportEvent::ChannelClosed {
            label: self.channel_label.clone(),
        })
    }

    pub fn deliver(&self, payload: impl Into<Bytes>) -> bool {
        self.emit(TransportEvent::ChannelMessage {
            label: self.channel_label.clone(),
            payload: payload.into(),
        })
    }

    pub fn remote_track(&self, kind: TrackKind) -> bool {
        self.emit(TransportEvent::RemoteTrack(RemoteTrack {
            id: format!("remote-{kind}-{}", self.id),
            stream_id: "remote".into(),
            kind: Some(kind),
        }))
    }

    fn channel(&self, label: &str) -> Arc<MockDataChannel> {
        let mut channels = self.channels.lock();
        if let Some(existing) = channels.iter().find(|channel| channel.label == label) {
            return existing.clone();
        }
        let channel = Arc::new(MockDataChannel {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        channels.push(channel.clone());
        channel
    }

    fn record(&self, call: MockCall) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl TransportSession for MockTransportSession {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.record(MockCall::AddLocalTrack(track.kind))
    }

    async fn create_local_description(
        &self,
        kind: SdpKind,
    ) -> Result<SessionDescription, TransportError> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.map_err(|_| TransportError::Closed)?;
        }
        self.record(MockCall::CreateLocalDescription(kind))?;
        Ok(SessionDescription::new(
            kind,
            format!("v=0\r\ns=mock-{kind}-{}\r\n", self.id),
        ))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(MockCall::SetLocalDescription(description))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if !description.sdp.starts_with("v=0") {
            return Err(TransportError::Command("not a session description".into()));
        }
        self.record(MockCall::SetRemoteDescription(description))
    }

    async fn add_candidate(&self, candidate: CandidateSignal) -> Result<(), TransportError> {
        self.record(MockCall::AddCandidate(candidate))
    }

    async fn create_ordered_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.record(MockCall::CreateOrderedChannel(label.to_string()))?;
        Ok(self.channel(label))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.calls.lock().push(MockCall::Close);
        for channel in self.channels.lock().iter() {
            channel.closed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub struct MockDataChannel {
    label: String,
    sent: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl MockDataChannel {
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
