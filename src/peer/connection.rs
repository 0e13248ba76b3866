//! Lifecycle manager for the connection to one remote participant.
//!
//! A [`PeerConnection`] is driven exclusively by the session's event loop.
//! It owns the transport, the remote-candidate buffer and the negotiation
//! bookkeeping; it never stops a local track, it only holds references.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{ErrorKind, PeerError};
use crate::events::EventSink;
use crate::media::{LocalTrack, MediaKind};
use crate::peer::ice::{CandidateBuffer, CandidateTally};
use crate::peer::state::{PeerState, TransportState};
use crate::peer::transport::{
    PeerEvent, RemoteTrack, ReplaceOutcome, Transport, TransportEvents, TransportFactory,
};
use crate::peer::types::{IceCandidate, ParticipantId, Role, SessionDescription};
use crate::signaling::{ClientMessage, SignalSender};

/// Everything a peer connection needs from its session.
#[derive(Clone)]
pub struct PeerContext {
    pub local: ParticipantId,
    pub signals: SignalSender,
    pub sink: Arc<dyn EventSink>,
    pub peer_events: mpsc::UnboundedSender<PeerEvent>,
    pub negotiation_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Negotiation {
    Idle,
    AwaitingOffer,
    /// A local offer is in flight.
    AwaitingAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    /// Initial negotiation, until the transport reports Connected.
    Connect,
    /// A local offer, until its answer is applied.
    Answer,
}

struct Deadline {
    kind: DeadlineKind,
    token: u64,
    handle: JoinHandle<()>,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PeerSnapshot {
    pub participant: ParticipantId,
    pub role: Role,
    pub state: PeerState,
    pub sent_tracks: Vec<String>,
}

pub struct PeerConnection {
    participant: ParticipantId,
    role: Role,
    epoch: u64,
    state: PeerState,
    transport: Arc<dyn Transport>,
    candidates: CandidateBuffer,
    audio: Option<Arc<LocalTrack>>,
    video: Option<Arc<LocalTrack>>,
    negotiation: Negotiation,
    /// Latest desired video track waiting for the in-flight exchange.
    queued_video: Option<Arc<LocalTrack>>,
    /// Sender changes were rolled back and still need an offer.
    reoffer: bool,
    deadline: Option<Deadline>,
    next_token: u64,
    remote_tracks: Vec<RemoteTrack>,
    tally: CandidateTally,
    events: TransportEvents,
    ctx: PeerContext,
}

impl PeerConnection {
    /// Allocate the transport and attach the current local tracks.
    pub async fn open(
        ctx: PeerContext,
        participant: ParticipantId,
        epoch: u64,
        factory: &dyn TransportFactory,
        tracks: &[Arc<LocalTrack>],
    ) -> Result<Self, PeerError> {
        let role = Role::for_pair(&ctx.local, &participant);
        let events = TransportEvents::new(participant.clone(), epoch, ctx.peer_events.clone());
        let transport = factory.create(&participant, events.clone()).await?;

        let mut peer = Self {
            participant,
            role,
            epoch,
            state: PeerState::Created,
            transport,
            candidates: CandidateBuffer::new(),
            audio: None,
            video: None,
            negotiation: Negotiation::Idle,
            queued_video: None,
            reoffer: false,
            deadline: None,
            next_token: 0,
            remote_tracks: Vec::new(),
            tally: CandidateTally::default(),
            events,
            ctx,
        };

        for track in tracks.iter().filter(|t| !t.is_stopped()) {
            if let Err(e) = peer.transport.add_track(track).await {
                peer.close().await;
                return Err(e.into());
            }
            match track.kind() {
                MediaKind::Audio => peer.audio = Some(track.clone()),
                MediaKind::Video => peer.video = Some(track.clone()),
            }
        }
        let missing = [
            (MediaKind::Audio, peer.audio.is_none()),
            (MediaKind::Video, peer.video.is_none()),
        ];
        for (kind, _) in missing.into_iter().filter(|(_, missing)| *missing) {
            if let Err(e) = peer.transport.add_receiver(kind).await {
                peer.close().await;
                return Err(e.into());
            }
            debug!(participant = %peer.participant, ?kind, "Receive-only media section added");
        }

        info!(
            participant = %peer.participant,
            role = ?peer.role,
            epoch,
            tracks = tracks.len(),
            "Peer connection created"
        );
        peer.ctx
            .sink
            .on_connection_state(&peer.participant, PeerState::Created);
        Ok(peer)
    }

    /// Enter Negotiating. The offerer sends its offer right away.
    pub async fn start(&mut self) -> Result<(), PeerError> {
        if self.state != PeerState::Created {
            return Ok(());
        }
        self.transition(PeerState::Negotiating);
        match self.role {
            Role::Offerer => self.send_offer().await,
            Role::Answerer => {
                self.negotiation = Negotiation::AwaitingOffer;
                self.settle_deadline();
                Ok(())
            }
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Ids of the local tracks this connection currently sends.
    pub fn sent_tracks(&self) -> Vec<String> {
        self.audio
            .iter()
            .chain(self.video.iter())
            .map(|t| t.id().to_string())
            .collect()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            participant: self.participant.clone(),
            role: self.role,
            state: self.state,
            sent_tracks: self.sent_tracks(),
        }
    }

    // ── Signaling input ──────────────────────────────────────────────────────

    pub async fn handle_offer(&mut self, offer: SessionDescription) -> Result<(), PeerError> {
        if self.is_closed() {
            return Ok(());
        }

        if self.negotiation == Negotiation::AwaitingAnswer {
            match self.role {
                Role::Offerer => {
                    info!(participant = %self.participant, "Ignoring colliding offer");
                    return Ok(());
                }
                Role::Answerer => {
                    info!(participant = %self.participant, "Offer collision, rolling back local offer");
                    self.transport.rollback().await?;
                    self.reoffer = true;
                }
            }
        }

        self.transport.set_remote_description(offer).await?;
        self.flush_candidates().await;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.signal(ClientMessage::NegotiationAnswer {
            target_id: self.participant.clone(),
            description: answer,
        });
        debug!(participant = %self.participant, "Answer sent");

        self.negotiation = Negotiation::Idle;
        self.settle_deadline();
        self.drain_queue().await
    }

    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<(), PeerError> {
        if self.is_closed() {
            return Ok(());
        }
        if self.negotiation != Negotiation::AwaitingAnswer {
            warn!(participant = %self.participant, "Answer without a pending offer, dropped");
            self.ctx.sink.on_warning(
                ErrorKind::InvalidMessage,
                &format!("unexpected answer from {}", self.participant),
            );
            return Ok(());
        }

        self.transport.set_remote_description(answer).await?;
        self.flush_candidates().await;
        debug!(participant = %self.participant, "Answer applied");

        self.negotiation = Negotiation::Idle;
        self.settle_deadline();
        self.drain_queue().await
    }

    /// Buffer until the remote description is set, apply afterwards.
    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.is_closed() {
            return;
        }
        match self.candidates.push(candidate) {
            Some(candidate) => self.apply_candidate(candidate).await,
            None => trace!(
                participant = %self.participant,
                buffered = self.candidates.len(),
                "Remote candidate buffered"
            ),
        }
    }

    // ── Transport input ──────────────────────────────────────────────────────

    pub fn handle_local_candidate(&mut self, candidate: IceCandidate) {
        if self.is_closed() {
            return;
        }
        self.tally.record(&candidate);
        self.signal(ClientMessage::IceCandidate {
            target_id: self.participant.clone(),
            candidate,
        });
    }

    pub fn handle_transport_state(&mut self, state: TransportState) -> Result<(), PeerError> {
        if self.is_closed() {
            return Ok(());
        }
        debug!(participant = %self.participant, transport = ?state, "Transport state");
        match state {
            TransportState::Connected => {
                if self.state.can_transition_to(PeerState::Connected) {
                    self.transition(PeerState::Connected);
                    self.settle_deadline();
                }
                Ok(())
            }
            TransportState::Disconnected => {
                if self.state == PeerState::Connected {
                    self.transition(PeerState::Disconnected);
                }
                Ok(())
            }
            TransportState::Failed => {
                let t = self.tally;
                if t.relay == 0 {
                    warn!(
                        participant = %self.participant,
                        host = t.host,
                        srflx = t.srflx,
                        "Transport failed without any relay candidate; a TURN server may be needed"
                    );
                }
                Err(PeerError::TransportFailed("transport reported failed".into()))
            }
            TransportState::Closed => {
                Err(PeerError::TransportFailed("transport closed unexpectedly".into()))
            }
            TransportState::New | TransportState::Connecting => Ok(()),
        }
    }

    pub fn handle_remote_track(&mut self, track: RemoteTrack) {
        if self.is_closed() {
            return;
        }
        info!(participant = %self.participant, track = %track.id, kind = ?track.kind, "Remote track");
        self.remote_tracks.retain(|t| t.id != track.id);
        self.remote_tracks.push(track);
        self.ctx
            .sink
            .on_remote_stream(&self.participant, &self.remote_tracks);
    }

    /// A deadline fired. Stale tokens are ignored.
    pub fn handle_deadline(&mut self, token: u64) -> Result<(), PeerError> {
        if self.is_closed() {
            return Ok(());
        }
        match &self.deadline {
            Some(d) if d.token == token => {
                warn!(participant = %self.participant, kind = ?d.kind, "Negotiation deadline elapsed");
                self.deadline = None;
                Err(PeerError::NegotiationTimeout)
            }
            _ => Ok(()),
        }
    }

    // ── Local media ──────────────────────────────────────────────────────────

    /// Switch the outgoing video to `track`, in place when the transport can.
    pub async fn replace_video(&mut self, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        if self.is_closed() {
            return Ok(());
        }
        if self.video.as_ref().is_some_and(|v| v.id() == track.id()) {
            return Ok(());
        }
        if self.video.is_some() {
            match self.transport.replace_track(&track).await {
                Ok(ReplaceOutcome::Replaced) => {
                    debug!(participant = %self.participant, track = %track.id(), "Video replaced in place");
                    self.video = Some(track);
                    return Ok(());
                }
                Ok(ReplaceOutcome::Unsupported) => {
                    debug!(participant = %self.participant, "In-place replace unsupported, renegotiating");
                }
                Err(e) => {
                    warn!(participant = %self.participant, "In-place replace failed, renegotiating: {e}");
                }
            }
        }
        self.renegotiate(track).await
    }

    async fn renegotiate(&mut self, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        if self.state == PeerState::Created || self.negotiation != Negotiation::Idle {
            if let Some(prev) = self.queued_video.replace(track) {
                debug!(participant = %self.participant, superseded = %prev.id(), "Renegotiation coalesced");
            }
            return Ok(());
        }
        self.transport.swap_track(&track).await?;
        self.video = Some(track);
        self.send_offer().await
    }

    /// Run whatever was queued behind the exchange that just finished.
    async fn drain_queue(&mut self) -> Result<(), PeerError> {
        if let Some(track) = self.queued_video.take() {
            self.reoffer = false;
            if self.video.as_ref().is_some_and(|v| v.id() == track.id()) {
                return Ok(());
            }
            return self.renegotiate(track).await;
        }
        if std::mem::take(&mut self.reoffer) {
            return self.send_offer().await;
        }
        Ok(())
    }

    async fn send_offer(&mut self) -> Result<(), PeerError> {
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.signal(ClientMessage::NegotiationOffer {
            target_id: self.participant.clone(),
            description: offer,
        });
        debug!(participant = %self.participant, "Offer sent");
        self.negotiation = Negotiation::AwaitingAnswer;
        self.settle_deadline();
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Record a terminal failure and close.
    pub async fn fail(&mut self, error: &PeerError) {
        if self.is_closed() {
            return;
        }
        warn!(participant = %self.participant, state = %self.state, "Peer connection failed: {error}");
        if self.state.can_transition_to(PeerState::Failed) {
            self.transition(PeerState::Failed);
        }
        self.close().await;
    }

    /// Release the transport and every track reference. Returns `false`
    /// when the connection was already closed.
    pub async fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.disarm_deadline();
        self.candidates.clear();
        self.queued_video = None;
        self.audio = None;
        self.video = None;
        self.remote_tracks.clear();
        if let Err(e) = self.transport.close().await {
            warn!(participant = %self.participant, "Transport close error: {e}");
        }
        self.transition(PeerState::Closed);
        true
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn transition(&mut self, next: PeerState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            debug!(participant = %self.participant, from = %self.state, to = %next, "Transition refused");
            return;
        }
        info!(participant = %self.participant, from = %self.state, to = %next, "Peer state");
        self.state = next;
        self.ctx.sink.on_connection_state(&self.participant, next);
    }

    async fn flush_candidates(&mut self) {
        let pending = self.candidates.retire();
        if pending.is_empty() {
            return;
        }
        debug!(participant = %self.participant, count = pending.len(), "Applying buffered candidates");
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            warn!(participant = %self.participant, "Failed to add candidate: {e}");
        }
    }

    fn signal(&self, msg: ClientMessage) {
        // A dead channel is reported by the inbound side and ends the session.
        if let Err(e) = self.ctx.signals.send(msg) {
            warn!(participant = %self.participant, "Signal not sent: {e}");
        }
    }

    fn settle_deadline(&mut self) {
        let wanted = if self.negotiation == Negotiation::AwaitingAnswer {
            Some(DeadlineKind::Answer)
        } else if self.state == PeerState::Negotiating {
            Some(DeadlineKind::Connect)
        } else {
            None
        };
        match (wanted, self.deadline.as_ref().map(|d| d.kind)) {
            (Some(w), Some(current)) if w == current => {}
            (Some(w), _) => self.arm_deadline(w),
            (None, _) => self.disarm_deadline(),
        }
    }

    fn arm_deadline(&mut self, kind: DeadlineKind) {
        self.disarm_deadline();
        self.next_token += 1;
        let token = self.next_token;
        let events = self.events.clone();
        let timeout = self.ctx.negotiation_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            events.negotiation_deadline(token);
        });
        trace!(participant = %self.participant, ?kind, token, "Deadline armed");
        self.deadline = Some(Deadline {
            kind,
            token,
            handle,
        });
    }

    fn disarm_deadline(&mut self) {
        if let Some(d) = self.deadline.take() {
            d.handle.abort();
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.disarm_deadline();
    }
}
