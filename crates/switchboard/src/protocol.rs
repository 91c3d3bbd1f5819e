use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{InvalidPeerId, NegotiationError};

/// Identity an endpoint announces to the relay. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidPeerId> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(InvalidPeerId);
        }
        if trimmed.len() == value.len() {
            Ok(Self(value))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerId {
    type Error = InvalidPeerId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerId> for String {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    GetPeers,
    PeerList,
    Offer,
    Answer,
    IceCandidate,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::GetPeers => "get-peers",
            EnvelopeKind::PeerList => "peer-list",
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::IceCandidate => "ice-candidate",
        }
    }

    /// Control messages travel between a client and the relay and carry no peer addressing.
    pub fn is_control(&self) -> bool {
        matches!(self, EnvelopeKind::GetPeers | EnvelopeKind::PeerList)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    pub fn get_peers() -> Self {
        Self {
            kind: EnvelopeKind::GetPeers,
            from: None,
            to: None,
            payload: Value::Null,
        }
    }

    pub fn peer_list(peers: &[PeerId]) -> Self {
        Self {
            kind: EnvelopeKind::PeerList,
            from: None,
            to: None,
            payload: Value::Array(
                peers
                    .iter()
                    .map(|peer| Value::String(peer.as_str().to_string()))
                    .collect(),
            ),
        }
    }

    pub fn offer(to: PeerId, description: &SessionDescription) -> Self {
        Self::addressed(EnvelopeKind::Offer, to, encode_embedded(description))
    }

    pub fn answer(to: PeerId, description: &SessionDescription) -> Self {
        Self::addressed(EnvelopeKind::Answer, to, encode_embedded(description))
    }

    pub fn ice_candidate(to: PeerId, signal: &CandidateSignal) -> Self {
        let payload = match signal {
            CandidateSignal::Candidate(candidate) => encode_embedded(candidate),
            CandidateSignal::EndOfCandidates => Value::String("null".to_string()),
        };
        Self::addressed(EnvelopeKind::IceCandidate, to, payload)
    }

    fn addressed(kind: EnvelopeKind, to: PeerId, payload: Value) -> Self {
        Self {
            kind,
            from: None,
            to: Some(to),
            payload,
        }
    }

    pub fn with_sender(mut self, from: PeerId) -> Self {
        self.from = Some(from);
        self
    }

    pub fn sender(&self) -> Result<PeerId, NegotiationError> {
        self.from
            .clone()
            .ok_or(NegotiationError::MissingSender(self.kind))
    }

    /// Accepts either a JSON array or a JSON string holding the array.
    pub fn peer_list_payload(&self) -> Result<Vec<PeerId>, NegotiationError> {
        if self.payload.is_null() {
            return Ok(Vec::new());
        }
        decode_embedded(&self.payload).map_err(|reason| self.malformed(reason))
    }

    pub fn session_description(&self) -> Result<SessionDescription, NegotiationError> {
        let description: SessionDescription =
            decode_embedded(&self.payload).map_err(|reason| self.malformed(reason))?;
        let expected = match self.kind {
            EnvelopeKind::Offer => SdpKind::Offer,
            EnvelopeKind::Answer => SdpKind::Answer,
            _ => return Err(self.malformed("envelope does not carry a session description".into())),
        };
        if description.kind != expected {
            return Err(self.malformed(format!(
                "expected {expected} description, got {}",
                description.kind
            )));
        }
        Ok(description)
    }

    pub fn candidate(&self) -> Result<CandidateSignal, NegotiationError> {
        match &self.payload {
            Value::Null => Ok(CandidateSignal::EndOfCandidates),
            Value::String(text) if text.trim() == "null" || text.trim().is_empty() => {
                Ok(CandidateSignal::EndOfCandidates)
            }
            value => {
                let candidate: IceCandidate =
                    decode_embedded(value).map_err(|reason| self.malformed(reason))?;
                if candidate.candidate.is_empty() {
                    Ok(CandidateSignal::EndOfCandidates)
                } else {
                    Ok(CandidateSignal::Candidate(candidate))
                }
            }
        }
    }

    fn malformed(&self, reason: String) -> NegotiationError {
        NegotiationError::MalformedPayload {
            kind: self.kind,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

/// Opaque session description. `sdp` is carried byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// A connectivity candidate or the sentinel that ends trickling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSignal {
    Candidate(IceCandidate),
    EndOfCandidates,
}

fn encode_embedded<T: Serialize>(value: &T) -> Value {
    match serde_json::to_string(value) {
        Ok(text) => Value::String(text),
        Err(_) => Value::Null,
    }
}

fn decode_embedded<T: DeserializeOwned>(value: &Value) -> Result<T, String> {
    match value {
        Value::String(text) => serde_json::from_str(text).map_err(|err| err.to_string()),
        other => T::deserialize(other).map_err(|err| err.to_string()),
    }
}
