//! Error types for the mesh client.
//!
//! Each concern gets its own `thiserror` enum; [`ErrorKind`] is the coarse
//! taxonomy the presentation layer sees.

use serde::Serialize;
use thiserror::Error;

use crate::media::CaptureRequest;

/// Coarse error classification surfaced to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Capture devices missing or permission denied. Fatal to join.
    DeviceUnavailable,
    /// Relay connection lost. Fatal to the session.
    SignalingChannelLost,
    /// No answer within the negotiation deadline. Fatal to one peer.
    NegotiationTimeout,
    /// The transport failed terminally. Fatal to one peer.
    TransportFailed,
    /// Malformed or unexpected signaling payload. Dropped.
    InvalidMessage,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{request:?} capture unavailable: {reason}")]
    DeviceUnavailable {
        request: CaptureRequest,
        reason: String,
    },

    #[error("no outgoing video track to replace")]
    NoVideoTrack,

    #[error("local media source already released")]
    Released,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid signaling message: {0}")]
    InvalidMessage(String),

    #[error("signaling channel lost: {0}")]
    ChannelLost(String),
}

/// Failure confined to a single peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("negotiation timed out")]
    NegotiationTimeout,

    #[error("transport failed: {0}")]
    TransportFailed(String),
}

impl PeerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NegotiationTimeout => ErrorKind::NegotiationTimeout,
            Self::TransportFailed(_) => ErrorKind::TransportFailed,
        }
    }
}

impl From<TransportError> for PeerError {
    fn from(e: TransportError) -> Self {
        Self::TransportFailed(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session already closed")]
    Closed,
}

impl SessionError {
    /// Taxonomy entry for errors that reach the presentation layer.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Media(MediaError::DeviceUnavailable { .. }) => Some(ErrorKind::DeviceUnavailable),
            Self::Signaling(SignalingError::InvalidMessage(_)) => Some(ErrorKind::InvalidMessage),
            Self::Signaling(_) => Some(ErrorKind::SignalingChannelLost),
            Self::Transport(_) => Some(ErrorKind::TransportFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
