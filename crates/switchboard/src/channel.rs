use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::ChannelError;
use crate::transport::DataChannel;

/// Application-facing handle on a session's ordered channel.
///
/// Clones share one slot owned by the negotiation session. Sending succeeds only while the
/// session is connected and the transport reported the channel open; once the session closes
/// every clone fails with [`ChannelError::NotOpen`] for good.
#[derive(Clone, Default)]
pub struct MessageChannel {
    slot: Arc<Mutex<ChannelSlot>>,
}

#[derive(Default)]
struct ChannelSlot {
    connected: bool,
    channel: Option<Arc<dyn DataChannel>>,
    invalidated: bool,
}

impl MessageChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        let slot = self.slot.lock();
        !slot.invalidated && slot.connected && slot.channel.is_some()
    }

    pub fn label(&self) -> Option<String> {
        self.slot
            .lock()
            .channel
            .as_ref()
            .map(|channel| channel.label().to_string())
    }

    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), ChannelError> {
        let channel = {
            let slot = self.slot.lock();
            match (&slot.channel, slot.connected, slot.invalidated) {
                (Some(channel), true, false) => channel.clone(),
                _ => return Err(ChannelError::NotOpen),
            }
        };
        channel.send(payload.into()).await?;
        Ok(())
    }

    pub async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        self.send(Bytes::copy_from_slice(text.as_bytes())).await
    }

    /// Keeps the first channel that opens; later ones are ignored.
    pub(crate) fn attach(&self, channel: Arc<dyn DataChannel>) -> bool {
        let mut slot = self.slot.lock();
        if slot.invalidated || slot.channel.is_some() {
            return false;
        }
        slot.channel = Some(channel);
        true
    }

    /// Returns true when the attached channel carried `label` and was released.
    pub(crate) fn detach(&self, label: &str) -> bool {
        let mut slot = self.slot.lock();
        if slot
            .channel
            .as_ref()
            .is_some_and(|channel| channel.label() == label)
        {
            slot.channel = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn set_connected(&self) {
        self.slot.lock().connected = true;
    }

    pub(crate) fn invalidate(&self) {
        let mut slot = self.slot.lock();
        slot.invalidated = true;
        slot.connected = false;
        slot.channel = None;
    }
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("MessageChannel")
            .field("connected", &slot.connected)
            .field("attached", &slot.channel.is_some())
            .field("invalidated", &slot.invalidated)
            .finish()
    }
}
