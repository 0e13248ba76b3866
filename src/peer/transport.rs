//! Seam between the lifecycle manager and the media transport.
//!
//! Transport callbacks never touch session state directly: they are turned
//! into [`PeerEvent`]s tagged with the owning connection's epoch and queued
//! for the session's single event loop.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;
use webrtc::track::track_remote::TrackRemote;

use crate::error::TransportError;
use crate::media::{LocalTrack, MediaKind};
use crate::peer::state::TransportState;
use crate::peer::types::{IceCandidate, ParticipantId, SessionDescription};

/// Result of asking the transport to swap a track in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced,
    /// The caller has to fall back to renegotiation.
    Unsupported,
}

/// One negotiated media transport to a single remote participant.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    /// Abandon a pending local offer.
    async fn rollback(&self) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Attach a local track as a sender.
    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), TransportError>;

    /// Negotiate a receive-only media section for a kind we never send on
    /// this connection, so the remote side's media of that kind still arrives.
    async fn add_receiver(&self, kind: MediaKind) -> Result<(), TransportError>;

    /// Swap the sender of `track.kind()` in place, without renegotiation.
    async fn replace_track(&self, track: &Arc<LocalTrack>) -> Result<ReplaceOutcome, TransportError>;

    /// Remove the current sender of the same kind and attach `track`.
    /// Takes effect only after a renegotiation.
    async fn swap_track(&self, track: &Arc<LocalTrack>) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Allocates transports for new peer connections.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        participant: &ParticipantId,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Inbound media track reported by a transport.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// Present when the track comes from the WebRTC stack.
    pub rtc: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            rtc: None,
        }
    }
}

#[derive(Debug)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack(RemoteTrack),
    /// Negotiation deadline armed with the given token elapsed.
    NegotiationDeadline(u64),
}

/// Something happened on the transport of one peer connection.
#[derive(Debug)]
pub struct PeerEvent {
    pub participant: ParticipantId,
    pub epoch: u64,
    pub kind: PeerEventKind,
}

/// Sender half handed to a transport for its callbacks.
#[derive(Clone)]
pub struct TransportEvents {
    participant: ParticipantId,
    epoch: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl TransportEvents {
    pub fn new(participant: ParticipantId, epoch: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            participant,
            epoch,
            tx,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.send(PeerEventKind::LocalCandidate(candidate));
    }

    pub fn state_changed(&self, state: TransportState) {
        self.send(PeerEventKind::StateChanged(state));
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        self.send(PeerEventKind::RemoteTrack(track));
    }

    pub(crate) fn negotiation_deadline(&self, token: u64) {
        self.send(PeerEventKind::NegotiationDeadline(token));
    }

    fn send(&self, kind: PeerEventKind) {
        // The session may already be gone; late events are simply dropped.
        if self
            .tx
            .send(PeerEvent {
                participant: self.participant.clone(),
                epoch: self.epoch,
                kind,
            })
            .is_err()
        {
            trace!(participant = %self.participant, epoch = self.epoch, "Peer event after session end");
        }
    }
}
