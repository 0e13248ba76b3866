//! In-memory fakes for the transport, capture devices, event sink and relay.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use meshroom::error::{ErrorKind, MediaError, TransportError};
use meshroom::events::{EventSink, RemoteTrackInfo, RoomEvent};
use meshroom::media::{
    Capture, CaptureConstraints, CaptureRequest, LocalMediaSource, LocalTrack, MediaDevices,
    MediaKind, TrackWriter, VideoSource,
};
use meshroom::orchestrator::RoomOrchestrator;
use meshroom::peer::connection::PeerContext;
use meshroom::peer::state::{PeerState, TransportState};
use meshroom::peer::transport::{
    PeerEvent, RemoteTrack, ReplaceOutcome, Transport, TransportEvents, TransportFactory,
};
use meshroom::peer::types::{IceCandidate, ParticipantId, SdpKind, SessionDescription};
use meshroom::room::RoomRoster;
use meshroom::signaling::{
    ClientMessage, Member, RelayEnd, RelayMessage, SignalEvent, SignalSender, SignalingChannel,
};

// ── Transport ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    Rollback,
    AddCandidate(String),
    AddTrack(String),
    AddReceiver(MediaKind),
    ReplaceTrack(String),
    SwapTrack(String),
    Close,
}

pub struct FakeTransport {
    pub participant: ParticipantId,
    events: TransportEvents,
    replace_supported: bool,
    auto_connect: bool,
    calls: Mutex<Vec<Call>>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    connected: AtomicBool,
    offers: AtomicUsize,
    senders: Mutex<HashMap<MediaKind, String>>,
}

impl FakeTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn closes(&self) -> usize {
        self.count(|c| *c == Call::Close)
    }

    pub fn offers(&self) -> usize {
        self.count(|c| *c == Call::CreateOffer)
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::AddCandidate(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    /// Track ids currently attached, per kind.
    pub fn sender(&self, kind: MediaKind) -> Option<String> {
        self.senders.lock().get(&kind).cloned()
    }

    pub fn events(&self) -> &TransportEvents {
        &self.events
    }

    pub fn emit_state(&self, state: TransportState) {
        self.events.state_changed(state);
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn maybe_connect(&self) {
        if self.auto_connect
            && self.has_local.load(Ordering::SeqCst)
            && self.has_remote.load(Ordering::SeqCst)
            && !self.connected.swap(true, Ordering::SeqCst)
        {
            self.events.state_changed(TransportState::Connected);
            self.events.remote_track(RemoteTrack::new(
                format!("{}-audio", self.participant),
                format!("{}-stream", self.participant),
                MediaKind::Audio,
            ));
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateOffer);
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!("offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateAnswer);
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(TransportError::Other("answer without remote offer".into()));
        }
        Ok(SessionDescription::answer("answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(Call::SetLocal(desc.kind));
        let first = !self.has_local.swap(true, Ordering::SeqCst);
        if first {
            self.events.local_candidate(IceCandidate::new(format!(
                "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host ({})",
                self.participant
            )));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(Call::SetRemote(desc.kind));
        self.has_remote.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        self.record(Call::Rollback);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(TransportError::Other(
                "candidate applied before the remote description".into(),
            ));
        }
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), TransportError> {
        self.record(Call::AddTrack(track.id().to_string()));
        self.senders
            .lock()
            .insert(track.kind(), track.id().to_string());
        Ok(())
    }

    async fn add_receiver(&self, kind: MediaKind) -> Result<(), TransportError> {
        self.record(Call::AddReceiver(kind));
        Ok(())
    }

    async fn replace_track(
        &self,
        track: &Arc<LocalTrack>,
    ) -> Result<ReplaceOutcome, TransportError> {
        if !self.replace_supported {
            return Ok(ReplaceOutcome::Unsupported);
        }
        self.record(Call::ReplaceTrack(track.id().to_string()));
        self.senders
            .lock()
            .insert(track.kind(), track.id().to_string());
        Ok(ReplaceOutcome::Replaced)
    }

    async fn swap_track(&self, track: &Arc<LocalTrack>) -> Result<(), TransportError> {
        self.record(Call::SwapTrack(track.id().to_string()));
        self.senders
            .lock()
            .insert(track.kind(), track.id().to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(Call::Close);
        Ok(())
    }
}

pub struct FakeFactory {
    replace_supported: bool,
    auto_connect: bool,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Self::build(true, true)
    }

    /// Transports that cannot swap a track in place.
    pub fn without_replace() -> Arc<Self> {
        Self::build(false, true)
    }

    /// Transports that never report Connected on their own.
    pub fn manual() -> Arc<Self> {
        Self::build(true, false)
    }

    fn build(replace_supported: bool, auto_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            replace_supported,
            auto_connect,
            transports: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> usize {
        self.transports.lock().len()
    }

    /// Most recent transport created for `id`.
    pub fn transport(&self, id: &str) -> Arc<FakeTransport> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|t| t.participant.as_str() == id)
            .cloned()
            .unwrap_or_else(|| panic!("no transport for {id}"))
    }

    pub fn all_for(&self, id: &str) -> Vec<Arc<FakeTransport>> {
        self.transports
            .lock()
            .iter()
            .filter(|t| t.participant.as_str() == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        participant: &ParticipantId,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = Arc::new(FakeTransport {
            participant: participant.clone(),
            events,
            replace_supported: self.replace_supported,
            auto_connect: self.auto_connect,
            calls: Mutex::new(Vec::new()),
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            offers: AtomicUsize::new(0),
            senders: Mutex::new(HashMap::new()),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

// ── Capture devices ─────────────────────────────────────────────────────────

pub struct FakeCapture {
    label: String,
    ended: Option<oneshot::Receiver<()>>,
    stopped: Arc<Mutex<Vec<String>>>,
    writers: Arc<Mutex<Vec<(String, TrackWriter)>>>,
}

impl Capture for FakeCapture {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn start(&mut self, writer: TrackWriter) {
        self.writers.lock().push((self.label.clone(), writer));
    }

    fn stop(&mut self) {
        self.stopped.lock().push(self.label.clone());
    }

    fn take_ended(&mut self) -> Option<oneshot::Receiver<()>> {
        self.ended.take()
    }
}

#[derive(Default)]
pub struct FakeDevices {
    opened: Mutex<Vec<String>>,
    stopped: Arc<Mutex<Vec<String>>>,
    writers: Arc<Mutex<Vec<(String, TrackWriter)>>>,
    denied: Mutex<HashSet<CaptureRequest>>,
    screen_enders: Mutex<Vec<oneshot::Sender<()>>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny(&self, request: CaptureRequest) {
        self.denied.lock().insert(request);
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }

    pub fn writer(&self, label: &str) -> Option<TrackWriter> {
        self.writers
            .lock()
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, w)| w.clone())
    }

    /// Simulate the OS "stop sharing" button on the latest screen capture.
    pub fn end_screen_share(&self) -> bool {
        match self.screen_enders.lock().pop() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open(
        &self,
        request: CaptureRequest,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn Capture>, MediaError> {
        if self.denied.lock().contains(&request) {
            return Err(MediaError::DeviceUnavailable {
                request,
                reason: "permission denied".into(),
            });
        }
        let label = {
            let mut opened = self.opened.lock();
            let name = match request {
                CaptureRequest::Microphone => "microphone",
                CaptureRequest::Camera => "camera",
                CaptureRequest::Screen => "screen",
            };
            let label = format!("{name}-{}", opened.len() + 1);
            opened.push(label.clone());
            label
        };
        let ended = if request == CaptureRequest::Screen {
            let (tx, rx) = oneshot::channel();
            self.screen_enders.lock().push(tx);
            Some(rx)
        } else {
            None
        };
        Ok(Box::new(FakeCapture {
            label,
            ended,
            stopped: self.stopped.clone(),
            writers: self.writers.clone(),
        }))
    }
}

/// A started local track backed by a fake capture.
pub fn local_track(kind: MediaKind, source: Option<VideoSource>) -> Arc<LocalTrack> {
    let capture = Box::new(FakeCapture {
        label: format!("{kind:?}"),
        ended: None,
        stopped: Arc::default(),
        writers: Arc::default(),
    });
    LocalTrack::start(kind, source, capture, "stream-test", true).0
}

// ── Event sink ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RoomEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<RoomEvent> {
        self.events.lock().clone()
    }

    pub fn states_of(&self, id: &str) -> Vec<PeerState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RoomEvent::ConnectionState { participant, state } if participant.as_str() == id => {
                    Some(*state)
                }
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<(String, ErrorKind)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RoomEvent::PeerFailed { participant, kind } => {
                    Some((participant.to_string(), *kind))
                }
                _ => None,
            })
            .collect()
    }

    pub fn warnings(&self) -> Vec<ErrorKind> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RoomEvent::Warning { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn fatal(&self) -> Vec<ErrorKind> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RoomEvent::FatalError { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn removed_streams(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RoomEvent::RemoteStreamRemoved { participant } => Some(participant.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: RoomEvent) {
        self.events.lock().push(event);
    }
}

impl EventSink for RecordingSink {
    fn on_connection_state(&self, participant: &ParticipantId, state: PeerState) {
        self.push(RoomEvent::ConnectionState {
            participant: participant.clone(),
            state,
        });
    }

    fn on_remote_stream(&self, participant: &ParticipantId, tracks: &[RemoteTrack]) {
        self.push(RoomEvent::RemoteStream {
            participant: participant.clone(),
            tracks: tracks.iter().map(RemoteTrackInfo::from).collect(),
        });
    }

    fn on_roster_changed(&self, roster: &RoomRoster) {
        self.push(RoomEvent::RosterChanged {
            members: roster.members(),
        });
    }

    fn on_fatal_error(&self, kind: ErrorKind, detail: &str) {
        self.push(RoomEvent::FatalError {
            kind,
            detail: detail.to_string(),
        });
    }

    fn on_remote_stream_removed(&self, participant: &ParticipantId) {
        self.push(RoomEvent::RemoteStreamRemoved {
            participant: participant.clone(),
        });
    }

    fn on_peer_failed(&self, participant: &ParticipantId, kind: ErrorKind) {
        self.push(RoomEvent::PeerFailed {
            participant: participant.clone(),
            kind,
        });
    }

    fn on_remote_screen_share(&self, participant: &ParticipantId, active: bool) {
        self.push(RoomEvent::RemoteScreenShare {
            participant: participant.clone(),
            active,
        });
    }

    fn on_warning(&self, kind: ErrorKind, detail: &str) {
        self.push(RoomEvent::Warning {
            kind,
            detail: detail.to_string(),
        });
    }
}

// ── Orchestrator harness ────────────────────────────────────────────────────

pub const TIMEOUT: Duration = Duration::from_secs(30);

pub fn member(id: &str) -> Member {
    Member {
        id: id.into(),
        display_name: id.to_uppercase(),
    }
}

pub fn joined(id: &str) -> RelayMessage {
    RelayMessage::ParticipantJoined {
        id: id.into(),
        display_name: id.to_uppercase(),
    }
}

pub fn left(id: &str) -> RelayMessage {
    RelayMessage::ParticipantLeft {
        id: id.into(),
        display_name: None,
    }
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"))
}

/// An orchestrator driven by hand, with its outbound signals captured.
pub struct Harness {
    pub orch: RoomOrchestrator,
    pub factory: Arc<FakeFactory>,
    pub devices: Arc<FakeDevices>,
    pub sink: Arc<RecordingSink>,
    pub outbound: mpsc::UnboundedReceiver<ClientMessage>,
    pub peer_events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl Harness {
    pub async fn new(local: &str) -> Self {
        Self::with(local, FakeFactory::new(), true, true).await
    }

    pub async fn with(local: &str, factory: Arc<FakeFactory>, video: bool, audio: bool) -> Self {
        let devices = FakeDevices::new();
        let sink = RecordingSink::new();
        let (media, _) = LocalMediaSource::acquire(
            devices.clone(),
            CaptureConstraints::default(),
            video,
            audio,
        )
        .await
        .expect("fake devices never fail");
        let (out_tx, outbound) = mpsc::unbounded_channel();
        let (peer_tx, peer_events) = mpsc::unbounded_channel();
        let ctx = PeerContext {
            local: local.into(),
            signals: SignalSender::new(out_tx),
            sink: sink.clone(),
            peer_events: peer_tx,
            negotiation_timeout: TIMEOUT,
        };
        let orch = RoomOrchestrator::new(ctx, "room-1", media, factory.clone(), 8);
        Self {
            orch,
            factory,
            devices,
            sink,
            outbound,
            peer_events,
        }
    }

    /// Feed every queued transport event back into the orchestrator.
    pub async fn pump(&mut self) {
        while let Ok(event) = self.peer_events.try_recv() {
            self.orch.handle_peer_event(event).await;
        }
    }

    /// Drain what was sent to the relay.
    pub fn sent(&mut self) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.outbound.try_recv() {
            out.push(msg);
        }
        out
    }

    pub fn live_ids(&self) -> Vec<String> {
        self.orch
            .peer_ids()
            .into_iter()
            .map(|id| id.to_string())
            .collect()
    }
}

pub fn offers_to(sent: &[ClientMessage]) -> Vec<String> {
    sent.iter()
        .filter_map(|m| match m {
            ClientMessage::NegotiationOffer { target_id, .. } => Some(target_id.to_string()),
            _ => None,
        })
        .collect()
}

// ── In-memory relay ─────────────────────────────────────────────────────────

#[derive(Default)]
struct RelayState {
    order: Vec<Member>,
    links: HashMap<ParticipantId, mpsc::UnboundedSender<SignalEvent>>,
}

/// Routes messages between sessions the way the signaling server does.
#[derive(Clone, Default)]
pub struct MeshRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MeshRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> SignalingChannel {
        let (channel, end) = SignalingChannel::pair();
        let state = self.state.clone();
        tokio::spawn(async move {
            let RelayEnd {
                events,
                mut outbound,
            } = end;
            let mut me: Option<ParticipantId> = None;
            while let Some(msg) = outbound.recv().await {
                route(&state, &events, &mut me, msg);
            }
            if let Some(id) = me {
                remove_member(&state, &id);
            }
        });
        channel
    }

    /// Cut one participant's connection, as a network failure would.
    pub fn kill(&self, id: &str) {
        let link = self.state.lock().links.get(&ParticipantId::from(id)).cloned();
        if let Some(link) = link {
            let _ = link.send(SignalEvent::ChannelError("connection reset".into()));
        }
    }

    pub fn members(&self) -> Vec<String> {
        self.state
            .lock()
            .order
            .iter()
            .map(|m| m.id.to_string())
            .collect()
    }
}

fn route(
    state: &Mutex<RelayState>,
    events: &mpsc::UnboundedSender<SignalEvent>,
    me: &mut Option<ParticipantId>,
    msg: ClientMessage,
) {
    let mut st = state.lock();
    match msg {
        ClientMessage::JoinRoom {
            participant_id,
            display_name,
            ..
        } => {
            st.links.insert(participant_id.clone(), events.clone());
            st.order.push(Member {
                id: participant_id.clone(),
                display_name: display_name.clone(),
            });
            let others: Vec<_> = st
                .order
                .iter()
                .filter(|m| m.id != participant_id)
                .map(|m| m.id.clone())
                .collect();
            for other in others {
                deliver(
                    &st,
                    &other,
                    RelayMessage::ParticipantJoined {
                        id: participant_id.clone(),
                        display_name: display_name.clone(),
                    },
                );
            }
            let members = st.order.clone();
            deliver(&st, &participant_id, RelayMessage::RosterSnapshot { members });
            *me = Some(participant_id);
        }
        ClientMessage::LeaveRoom { .. } => {
            if let Some(id) = me.take() {
                drop(st);
                remove_member(state, &id);
            }
        }
        ClientMessage::NegotiationOffer {
            target_id,
            description,
        } => {
            if let Some(from) = me.clone() {
                deliver(
                    &st,
                    &target_id,
                    RelayMessage::NegotiationOffer {
                        sender_id: from,
                        description,
                    },
                );
            }
        }
        ClientMessage::NegotiationAnswer {
            target_id,
            description,
        } => {
            if let Some(from) = me.clone() {
                deliver(
                    &st,
                    &target_id,
                    RelayMessage::NegotiationAnswer {
                        sender_id: from,
                        description,
                    },
                );
            }
        }
        ClientMessage::IceCandidate {
            target_id,
            candidate,
        } => {
            if let Some(from) = me.clone() {
                deliver(
                    &st,
                    &target_id,
                    RelayMessage::IceCandidate {
                        sender_id: from,
                        candidate,
                    },
                );
            }
        }
        ClientMessage::ScreenShareStarted { .. } | ClientMessage::ScreenShareStopped { .. } => {
            let started = matches!(msg, ClientMessage::ScreenShareStarted { .. });
            if let Some(from) = me.clone() {
                let others: Vec<_> = st.links.keys().filter(|k| **k != from).cloned().collect();
                for other in others {
                    let notice = if started {
                        RelayMessage::ScreenShareStarted { id: from.clone() }
                    } else {
                        RelayMessage::ScreenShareStopped { id: from.clone() }
                    };
                    deliver(&st, &other, notice);
                }
            }
        }
    }
}

fn deliver(st: &RelayState, to: &ParticipantId, msg: RelayMessage) {
    if let Some(link) = st.links.get(to) {
        let _ = link.send(SignalEvent::Message(msg));
    }
}

fn remove_member(state: &Mutex<RelayState>, id: &ParticipantId) {
    let mut st = state.lock();
    if st.links.remove(id).is_none() {
        return;
    }
    st.order.retain(|m| &m.id != id);
    for link in st.links.values() {
        let _ = link.send(SignalEvent::Message(RelayMessage::ParticipantLeft {
            id: id.clone(),
            display_name: None,
        }));
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}
