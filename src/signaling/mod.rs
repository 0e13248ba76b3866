//! Signaling relay protocol.
//!
//! The relay carries room membership and per-peer negotiation messages over a
//! single reliable channel. Media never goes through it.
//!
//! Order is preserved per direction, but nothing orders messages about
//! different peers relative to each other, so the session routes every
//! inbound message by participant id.

pub mod ws;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SignalingError;
use crate::peer::types::{IceCandidate, ParticipantId, SessionDescription};

/// Roster entry as the relay reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: ParticipantId,
    pub display_name: String,
}

// ── Client → relay ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        participant_id: ParticipantId,
        display_name: String,
    },
    LeaveRoom {
        room_id: String,
    },
    NegotiationOffer {
        target_id: ParticipantId,
        description: SessionDescription,
    },
    NegotiationAnswer {
        target_id: ParticipantId,
        description: SessionDescription,
    },
    IceCandidate {
        target_id: ParticipantId,
        candidate: IceCandidate,
    },
    ScreenShareStarted {
        room_id: String,
    },
    ScreenShareStopped {
        room_id: String,
    },
}

// ── Relay → client ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum RelayMessage {
    RosterSnapshot {
        members: Vec<Member>,
    },
    ParticipantJoined {
        id: ParticipantId,
        display_name: String,
    },
    ParticipantLeft {
        id: ParticipantId,
        #[serde(default)]
        display_name: Option<String>,
    },
    NegotiationOffer {
        sender_id: ParticipantId,
        description: SessionDescription,
    },
    NegotiationAnswer {
        sender_id: ParticipantId,
        description: SessionDescription,
    },
    IceCandidate {
        sender_id: ParticipantId,
        candidate: IceCandidate,
    },
    ScreenShareStarted {
        id: ParticipantId,
    },
    ScreenShareStopped {
        id: ParticipantId,
    },
    Error {
        message: String,
    },
}

/// Parse one relay frame.
pub fn decode_relay(text: &str) -> Result<RelayMessage, SignalingError> {
    serde_json::from_str(text).map_err(|e| SignalingError::InvalidMessage(e.to_string()))
}

pub fn encode_client(msg: &ClientMessage) -> Result<String, SignalingError> {
    Ok(serde_json::to_string(msg)?)
}

/// What the channel delivers to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Message(RelayMessage),
    /// The channel is gone; fatal to the session.
    ChannelError(String),
}

/// Cloneable outbound half of the signaling channel.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl SignalSender {
    pub fn new(tx: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self { tx }
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        self.tx
            .send(msg)
            .map_err(|_| SignalingError::ChannelLost("outbound queue closed".into()))
    }
}

/// A connected signaling channel: one outbound queue, one inbound stream.
pub struct SignalingChannel {
    outbound: SignalSender,
    inbound: mpsc::UnboundedReceiver<SignalEvent>,
    tasks: Vec<JoinHandle<()>>,
}

/// Relay side of an in-process channel created by [`SignalingChannel::pair`].
pub struct RelayEnd {
    pub events: mpsc::UnboundedSender<SignalEvent>,
    pub outbound: mpsc::UnboundedReceiver<ClientMessage>,
}

impl RelayEnd {
    pub fn deliver(&self, msg: RelayMessage) -> bool {
        self.events.send(SignalEvent::Message(msg)).is_ok()
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.events.send(SignalEvent::ChannelError(reason.into())).is_ok()
    }
}

impl SignalingChannel {
    pub fn from_parts(
        outbound: SignalSender,
        inbound: mpsc::UnboundedReceiver<SignalEvent>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks,
        }
    }

    /// In-process channel; the caller plays the relay.
    pub fn pair() -> (Self, RelayEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let channel = Self::from_parts(SignalSender::new(out_tx), in_rx, Vec::new());
        (
            channel,
            RelayEnd {
                events: in_tx,
                outbound: out_rx,
            },
        )
    }

    pub fn sender(&self) -> SignalSender {
        self.outbound.clone()
    }

    /// Next inbound event. A closed stream reads as a channel error.
    pub async fn recv(&mut self) -> SignalEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or_else(|| SignalEvent::ChannelError("signaling stream ended".into()))
    }

    /// Let the I/O tasks finish on their own so queued outbound messages
    /// are flushed once every sender is gone.
    pub fn detach(mut self) {
        self.tasks.clear();
    }

    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.inbound.close();
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}
