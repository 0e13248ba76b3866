use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Lifecycle of one peer connection.
///
/// ```text
/// Created -> Negotiating -> Connected -> {Disconnected -> Connected | Failed} -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Created,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_closed(self) -> bool {
        self == PeerState::Closed
    }

    pub fn can_transition_to(self, next: PeerState) -> bool {
        use PeerState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Created, Negotiating) => true,
            (Negotiating, Connected | Failed) => true,
            (Connected, Disconnected | Failed) => true,
            (Disconnected, Connected | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Created => "created",
            PeerState::Negotiating => "negotiating",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What the underlying transport reports about its media path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

// ========== CONSTANTS ==========

/// Upper bound on waiting for the remote side during negotiation.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Negotiation messages held for a participant we have not seen join yet.
pub const EARLY_SIGNAL_LIMIT: usize = 64;

/// Distinct unknown participants whose signals are held at the same time.
pub const EARLY_SENDER_LIMIT: usize = 32;
