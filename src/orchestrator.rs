//! Room orchestrator: keeps one peer connection per remote roster member and
//! fans local media changes out to them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::error::{ErrorKind, MediaError, PeerError, SessionError};
use crate::media::{LocalMediaSource, MediaKind, VideoSource};
use crate::peer::connection::{PeerConnection, PeerContext, PeerSnapshot};
use crate::peer::state::EARLY_SENDER_LIMIT;
use crate::peer::transport::{PeerEvent, PeerEventKind, TransportFactory};
use crate::peer::types::{IceCandidate, ParticipantId, SessionDescription};
use crate::room::RoomRoster;
use crate::signaling::{ClientMessage, Member, RelayMessage};

/// Negotiation message addressed to one peer connection.
#[derive(Debug, Clone)]
enum PeerSignal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

/// A running screen capture the session should watch for an OS-level stop.
#[derive(Debug)]
pub struct ScreenWatch {
    pub track_id: String,
    pub ended: oneshot::Receiver<()>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub local: ParticipantId,
    pub room_id: String,
    pub roster: Vec<Member>,
    pub peers: Vec<PeerSnapshot>,
    pub active_video: VideoSource,
    pub audio_track: Option<String>,
    pub video_track: Option<String>,
}

pub struct RoomOrchestrator {
    ctx: PeerContext,
    room_id: String,
    roster: RoomRoster,
    peers: HashMap<ParticipantId, PeerConnection>,
    media: LocalMediaSource,
    factory: Arc<dyn TransportFactory>,
    next_epoch: u64,
    early: HashMap<ParticipantId, VecDeque<PeerSignal>>,
    early_limit: usize,
}

impl RoomOrchestrator {
    pub fn new(
        ctx: PeerContext,
        room_id: impl Into<String>,
        media: LocalMediaSource,
        factory: Arc<dyn TransportFactory>,
        early_limit: usize,
    ) -> Self {
        Self {
            ctx,
            room_id: room_id.into(),
            roster: RoomRoster::new(),
            peers: HashMap::new(),
            media,
            factory,
            next_epoch: 0,
            early: HashMap::new(),
            early_limit,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn roster(&self) -> &RoomRoster {
        &self.roster
    }

    pub fn media(&self) -> &LocalMediaSource {
        &self.media
    }

    pub fn peer(&self, id: &ParticipantId) -> Option<&PeerConnection> {
        self.peers.get(id)
    }

    /// Ids with a live connection, sorted.
    pub fn peer_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.peers.keys().cloned().collect();
        ids.sort_by(|a, b| a.negotiation_order(b));
        ids
    }

    // ── Relay input ──────────────────────────────────────────────────────────

    pub async fn handle_relay(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::RosterSnapshot { members } => {
                info!(members = members.len(), "Roster snapshot");
                self.roster.replace_with_snapshot(members);
                self.roster_changed().await;
            }
            RelayMessage::ParticipantJoined { id, display_name } => {
                info!(participant = %id, name = %display_name, "Participant joined");
                self.roster.join(id, display_name);
                self.roster_changed().await;
            }
            RelayMessage::ParticipantLeft { id, .. } => {
                info!(participant = %id, "Participant left");
                self.early.remove(&id);
                if self.roster.leave(&id).is_some() {
                    self.roster_changed().await;
                }
            }
            RelayMessage::NegotiationOffer {
                sender_id,
                description,
            } => self.route(sender_id, PeerSignal::Offer(description)).await,
            RelayMessage::NegotiationAnswer {
                sender_id,
                description,
            } => self.route(sender_id, PeerSignal::Answer(description)).await,
            RelayMessage::IceCandidate {
                sender_id,
                candidate,
            } => self.route(sender_id, PeerSignal::Candidate(candidate)).await,
            RelayMessage::ScreenShareStarted { id } => {
                self.ctx.sink.on_remote_screen_share(&id, true);
            }
            RelayMessage::ScreenShareStopped { id } => {
                self.ctx.sink.on_remote_screen_share(&id, false);
            }
            RelayMessage::Error { message } => {
                warn!("Relay reported an error: {message}");
                self.ctx.sink.on_warning(ErrorKind::InvalidMessage, &message);
            }
        }
    }

    async fn roster_changed(&mut self) {
        self.ctx.sink.on_roster_changed(&self.roster);
        self.reconcile().await;
    }

    /// Make the connection set equal the roster minus ourselves.
    pub async fn reconcile(&mut self) {
        let stale: Vec<ParticipantId> = self
            .peers
            .keys()
            .filter(|id| !self.roster.contains(id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(mut peer) = self.peers.remove(&id) {
                peer.close().await;
                self.ctx.sink.on_remote_stream_removed(&id);
            }
        }

        let missing: Vec<ParticipantId> = self
            .roster
            .ids()
            .filter(|id| **id != self.ctx.local && !self.peers.contains_key(*id))
            .cloned()
            .collect();
        for id in missing {
            self.create_peer(id).await;
        }
    }

    async fn create_peer(&mut self, id: ParticipantId) {
        self.next_epoch += 1;
        let tracks = self.media.tracks();
        let opened = PeerConnection::open(
            self.ctx.clone(),
            id.clone(),
            self.next_epoch,
            self.factory.as_ref(),
            &tracks,
        )
        .await;

        let mut peer = match opened {
            Ok(peer) => peer,
            Err(e) => {
                warn!(participant = %id, "Could not create peer connection: {e}");
                self.ctx.sink.on_peer_failed(&id, e.kind());
                return;
            }
        };
        let started = peer.start().await;
        self.peers.insert(id.clone(), peer);
        if let Err(e) = started {
            self.fail_peer(&id, e).await;
            return;
        }

        if let Some(queue) = self.early.remove(&id) {
            debug!(participant = %id, count = queue.len(), "Replaying early signals");
            for signal in queue {
                self.route(id.clone(), signal).await;
            }
        }
    }

    async fn route(&mut self, from: ParticipantId, signal: PeerSignal) {
        if from == self.ctx.local {
            warn!("Dropping signal addressed from ourselves");
            return;
        }
        let Some(peer) = self.peers.get_mut(&from) else {
            if self.roster.contains(&from) {
                debug!(participant = %from, "No live connection, signal dropped");
            } else {
                self.hold_early(from, signal);
            }
            return;
        };

        let result = match signal {
            PeerSignal::Offer(desc) => peer.handle_offer(desc).await,
            PeerSignal::Answer(desc) => peer.handle_answer(desc).await,
            PeerSignal::Candidate(c) => {
                peer.handle_remote_candidate(c).await;
                Ok(())
            }
        };
        if let Err(e) = result {
            self.fail_peer(&from, e).await;
        }
    }

    fn hold_early(&mut self, from: ParticipantId, signal: PeerSignal) {
        if !self.early.contains_key(&from) && self.early.len() >= EARLY_SENDER_LIMIT {
            warn!(participant = %from, limit = EARLY_SENDER_LIMIT, "Too many unknown senders, dropping");
            self.ctx.sink.on_warning(
                ErrorKind::InvalidMessage,
                &format!("too many unknown participants signaling, dropped {from}"),
            );
            return;
        }
        let queue = self.early.entry(from.clone()).or_default();
        if queue.len() >= self.early_limit {
            warn!(participant = %from, limit = self.early_limit, "Early signal queue full, dropping");
            self.ctx.sink.on_warning(
                ErrorKind::InvalidMessage,
                &format!("too many signals from unknown participant {from}"),
            );
            return;
        }
        trace!(participant = %from, queued = queue.len() + 1, "Signal held until join");
        queue.push_back(signal);
    }

    // ── Transport input ──────────────────────────────────────────────────────

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent {
            participant,
            epoch,
            kind,
        } = event;
        let Some(peer) = self.peers.get_mut(&participant) else {
            trace!(%participant, epoch, "Event for a removed connection");
            return;
        };
        if peer.epoch() != epoch {
            trace!(%participant, epoch, current = peer.epoch(), "Stale peer event");
            return;
        }

        let result = match kind {
            PeerEventKind::LocalCandidate(c) => {
                peer.handle_local_candidate(c);
                Ok(())
            }
            PeerEventKind::StateChanged(state) => peer.handle_transport_state(state),
            PeerEventKind::RemoteTrack(track) => {
                peer.handle_remote_track(track);
                Ok(())
            }
            PeerEventKind::NegotiationDeadline(token) => peer.handle_deadline(token),
        };
        if let Err(e) = result {
            self.fail_peer(&participant, e).await;
        }
    }

    /// Close and forget one connection. The roster is untouched, so the
    /// participant gets a fresh connection on the next reconciliation.
    async fn fail_peer(&mut self, id: &ParticipantId, error: PeerError) {
        if let Some(mut peer) = self.peers.remove(id) {
            peer.fail(&error).await;
            self.ctx.sink.on_remote_stream_removed(id);
            self.ctx.sink.on_peer_failed(id, error.kind());
        }
    }

    // ── Local media ──────────────────────────────────────────────────────────

    /// Mute or unmute. Every connection shares the track, so nothing is
    /// renegotiated.
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        let found = self.media.set_enabled(kind, enabled);
        info!(?kind, enabled, found, "Local track toggled");
        found
    }

    /// Switch the outgoing video on every connection. The previous capture
    /// is stopped only after every connection took the new track.
    pub async fn replace_video_source(
        &mut self,
        source: VideoSource,
    ) -> Result<Option<ScreenWatch>, SessionError> {
        if self.media.track(MediaKind::Video).is_none() {
            return Err(MediaError::NoVideoTrack.into());
        }
        let previous = self.media.active_source();
        let pending = self.media.open_video(source).await?;
        let track = pending.track.clone();

        let mut failed = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            if let Err(e) = peer.replace_video(track.clone()).await {
                failed.push((id.clone(), e));
            }
        }
        for (id, e) in failed {
            self.fail_peer(&id, e).await;
        }

        self.media.commit_video(track.clone());
        info!(from = ?previous, to = ?source, track = %track.id(), "Video source replaced");

        if source == VideoSource::Screen {
            self.notify(ClientMessage::ScreenShareStarted {
                room_id: self.room_id.clone(),
            });
        } else if previous == VideoSource::Screen {
            self.notify(ClientMessage::ScreenShareStopped {
                room_id: self.room_id.clone(),
            });
        }

        Ok(match (source, pending.ended) {
            (VideoSource::Screen, Some(ended)) => Some(ScreenWatch {
                track_id: track.id().to_string(),
                ended,
            }),
            _ => None,
        })
    }

    /// Switch every sender to a screen capture. A no-op while one is running.
    pub async fn start_screen_share(&mut self) -> Result<Option<ScreenWatch>, SessionError> {
        if !self.media.is_released() && self.media.active_source() == VideoSource::Screen {
            debug!("Screen share already active");
            return Ok(None);
        }
        self.replace_video_source(VideoSource::Screen).await
    }

    /// Back to the camera. Returns `false` when no screen share was active.
    pub async fn stop_screen_share(&mut self) -> Result<bool, SessionError> {
        if self.media.is_released() || self.media.active_source() != VideoSource::Screen {
            return Ok(false);
        }
        self.replace_video_source(VideoSource::Camera).await?;
        Ok(true)
    }

    /// The screen capture `track_id` ended on its own.
    pub async fn screen_capture_ended(&mut self, track_id: &str) -> Result<bool, SessionError> {
        let current = self.media.track(MediaKind::Video).map(|t| t.id().to_string());
        if current.as_deref() != Some(track_id) {
            debug!(track = %track_id, "Ended capture is no longer active");
            return Ok(false);
        }
        self.stop_screen_share().await
    }

    fn notify(&self, msg: ClientMessage) {
        if let Err(e) = self.ctx.signals.send(msg) {
            warn!("Notice not sent: {e}");
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Close every connection and release local media. Returns how many
    /// connections were closed by this call.
    pub async fn shutdown(&mut self) -> usize {
        let peers: Vec<_> = self.peers.drain().collect();
        let mut closed = 0;
        for (id, mut peer) in peers {
            if peer.close().await {
                closed += 1;
            }
            self.ctx.sink.on_remote_stream_removed(&id);
        }
        self.early.clear();
        self.roster.clear();
        self.media.release();
        if closed > 0 {
            info!(closed, "All peer connections closed");
        }
        closed
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let peers = self
            .peer_ids()
            .iter()
            .filter_map(|id| self.peers.get(id))
            .map(PeerConnection::snapshot)
            .collect();
        SessionSnapshot {
            local: self.ctx.local.clone(),
            room_id: self.room_id.clone(),
            roster: self.roster.members(),
            peers,
            active_video: self.media.active_source(),
            audio_track: self.media.track(MediaKind::Audio).map(|t| t.id().to_string()),
            video_track: self.media.track(MediaKind::Video).map(|t| t.id().to_string()),
        }
    }
}
