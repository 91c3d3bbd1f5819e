use std::time::Instant;

use crate::error::DirectoryError;
use crate::protocol::{Envelope, PeerId};
use crate::relay::EnvelopeSender;

/// Cached peer list. The relay resends the full list on every refresh, so updates
/// replace the cache wholesale.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    local: Option<PeerId>,
    peers: Vec<PeerId>,
    refreshed_at: Option<Instant>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_refresh(&self, relay: &EnvelopeSender) {
        tracing::debug!(target: "switchboard::directory", "requesting peer list");
        relay.send(Envelope::get_peers());
    }

    /// Replaces the cache. The local identity is never listed as a target.
    pub fn on_update(&mut self, list: Vec<PeerId>) -> &[PeerId] {
        let local = self.local.as_ref();
        self.peers = list
            .into_iter()
            .filter(|peer| Some(peer) != local)
            .collect();
        self.refreshed_at = Some(Instant::now());
        tracing::debug!(target: "switchboard::directory", count = self.peers.len(), "peer list updated");
        &self.peers
    }

    pub fn select(&self, target: &str) -> Result<PeerId, DirectoryError> {
        let target = target.trim();
        self.peers
            .iter()
            .find(|peer| peer.as_str() == target)
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownPeer(target.to_string()))
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    pub fn local(&self) -> Option<&PeerId> {
        self.local.as_ref()
    }

    pub fn refreshed_at(&self) -> Option<Instant> {
        self.refreshed_at
    }

    pub fn set_local(&mut self, local: Option<PeerId>) {
        self.local = local;
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.refreshed_at = None;
    }
}
