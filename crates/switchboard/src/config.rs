use std::env;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;
use crate::transport::{LocalTrack, TrackKind, TransportConfig};

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_CHANNEL_LABEL: &str = "chat";
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Client configuration. Environment variables override the built-in defaults.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay websocket endpoint; the identity is appended as `?id=`.
    pub relay_url: Url,
    pub ice_servers: Vec<String>,
    /// Label of the ordered message channel the caller opens.
    pub channel_label: String,
    /// Sessions still negotiating after this long are torn down.
    pub negotiation_timeout: Duration,
    pub local_tracks: Vec<LocalTrack>,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = env::var("SWITCHBOARD_RELAY_URL") {
            config.relay_url = parse_relay_url(&raw)?;
        }
        if let Ok(raw) = env::var("SWITCHBOARD_ICE_SERVERS") {
            config.ice_servers = raw
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(raw) = env::var("SWITCHBOARD_CHANNEL_LABEL") {
            let label = raw.trim();
            if label.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "SWITCHBOARD_CHANNEL_LABEL",
                    reason: "label must not be empty".into(),
                });
            }
            config.channel_label = label.to_string();
        }
        if let Ok(raw) = env::var("SWITCHBOARD_NEGOTIATION_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|err| ConfigError::InvalidValue {
                key: "SWITCHBOARD_NEGOTIATION_TIMEOUT_SECS",
                reason: format!("{err}"),
            })?;
            config.negotiation_timeout = Duration::from_secs(secs.max(1));
        }
        if let Ok(raw) = env::var("SWITCHBOARD_MEDIA") {
            config.local_tracks = parse_media(&raw)?;
        }

        Ok(config)
    }

    pub fn with_relay_url(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.relay_url = parse_relay_url(raw)?;
        Ok(self)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            ice_servers: self.ice_servers.clone(),
            channel_label: self.channel_label.clone(),
            local_tracks: self.local_tracks.clone(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: Url::parse(DEFAULT_RELAY_URL).expect("default relay url is valid"),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            local_tracks: Vec::new(),
        }
    }
}

fn parse_relay_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|err| ConfigError::InvalidValue {
        key: "SWITCHBOARD_RELAY_URL",
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" | "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidValue {
            key: "SWITCHBOARD_RELAY_URL",
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

fn parse_media(raw: &str) -> Result<Vec<LocalTrack>, ConfigError> {
    let mut tracks = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let kind = match entry.to_ascii_lowercase().as_str() {
            "audio" => TrackKind::Audio,
            "video" => TrackKind::Video,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "SWITCHBOARD_MEDIA",
                    reason: format!("unknown track kind {other}"),
                });
            }
        };
        tracks.push(LocalTrack::new(kind));
    }
    Ok(tracks)
}
