//! Events for the presentation layer.
//!
//! The core never renders anything; it calls an [`EventSink`] from the
//! session's event loop. [`ChannelSink`] turns those calls into a stream of
//! serializable [`RoomEvent`]s for UIs that prefer a queue.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::media::MediaKind;
use crate::peer::state::PeerState;
use crate::peer::transport::RemoteTrack;
use crate::peer::types::ParticipantId;
use crate::room::RoomRoster;
use crate::signaling::Member;

pub trait EventSink: Send + Sync {
    fn on_connection_state(&self, participant: &ParticipantId, state: PeerState);

    fn on_remote_stream(&self, participant: &ParticipantId, tracks: &[RemoteTrack]);

    fn on_roster_changed(&self, roster: &RoomRoster);

    fn on_fatal_error(&self, kind: ErrorKind, detail: &str);

    /// The peer connection is gone, its tile can go too.
    fn on_remote_stream_removed(&self, _participant: &ParticipantId) {}

    /// A single connection failed; the session carries on.
    fn on_peer_failed(&self, _participant: &ParticipantId, _kind: ErrorKind) {}

    fn on_remote_screen_share(&self, _participant: &ParticipantId, _active: bool) {}

    /// Non-fatal report, e.g. a dropped message.
    fn on_warning(&self, _kind: ErrorKind, _detail: &str) {}
}

/// Serializable mirror of the [`EventSink`] callbacks.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RoomEvent {
    ConnectionState {
        participant: ParticipantId,
        state: PeerState,
    },
    RemoteStream {
        participant: ParticipantId,
        tracks: Vec<RemoteTrackInfo>,
    },
    RemoteStreamRemoved {
        participant: ParticipantId,
    },
    RosterChanged {
        members: Vec<Member>,
    },
    PeerFailed {
        participant: ParticipantId,
        kind: ErrorKind,
    },
    RemoteScreenShare {
        participant: ParticipantId,
        active: bool,
    },
    Warning {
        kind: ErrorKind,
        detail: String,
    },
    FatalError {
        kind: ErrorKind,
        detail: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

impl From<&RemoteTrack> for RemoteTrackInfo {
    fn from(t: &RemoteTrack) -> Self {
        Self {
            id: t.id.clone(),
            stream_id: t.stream_id.clone(),
            kind: t.kind,
        }
    }
}

/// Sink that forwards every callback into an unbounded queue.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RoomEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RoomEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: RoomEvent) {
        // A UI that stopped listening is not our problem.
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_connection_state(&self, participant: &ParticipantId, state: PeerState) {
        self.emit(RoomEvent::ConnectionState {
            participant: participant.clone(),
            state,
        });
    }

    fn on_remote_stream(&self, participant: &ParticipantId, tracks: &[RemoteTrack]) {
        self.emit(RoomEvent::RemoteStream {
            participant: participant.clone(),
            tracks: tracks.iter().map(RemoteTrackInfo::from).collect(),
        });
    }

    fn on_roster_changed(&self, roster: &RoomRoster) {
        self.emit(RoomEvent::RosterChanged {
            members: roster.members(),
        });
    }

    fn on_fatal_error(&self, kind: ErrorKind, detail: &str) {
        self.emit(RoomEvent::FatalError {
            kind,
            detail: detail.to_string(),
        });
    }

    fn on_remote_stream_removed(&self, participant: &ParticipantId) {
        self.emit(RoomEvent::RemoteStreamRemoved {
            participant: participant.clone(),
        });
    }

    fn on_peer_failed(&self, participant: &ParticipantId, kind: ErrorKind) {
        self.emit(RoomEvent::PeerFailed {
            participant: participant.clone(),
            kind,
        });
    }

    fn on_remote_screen_share(&self, participant: &ParticipantId, active: bool) {
        self.emit(RoomEvent::RemoteScreenShare {
            participant: participant.clone(),
            active,
        });
    }

    fn on_warning(&self, kind: ErrorKind, detail: &str) {
        self.emit(RoomEvent::Warning {
            kind,
            detail: detail.to_string(),
        });
    }
}
