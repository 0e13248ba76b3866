//! The session actor.
//!
//! One spawned task owns the orchestrator (roster, peer connections, local
//! media) and processes UI commands, relay messages and transport events one
//! at a time. The [`SessionHandle`] only talks to it through a queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, Result, SessionError};
use crate::events::EventSink;
use crate::media::{CaptureConstraints, LocalMediaSource, MediaDevices, MediaKind};
use crate::orchestrator::{RoomOrchestrator, ScreenWatch, SessionSnapshot};
use crate::peer::connection::PeerContext;
use crate::peer::state::{EARLY_SIGNAL_LIMIT, NEGOTIATION_TIMEOUT};
use crate::peer::transport::{PeerEvent, TransportFactory};
use crate::peer::types::{Identity, ParticipantId};
use crate::signaling::{ClientMessage, SignalEvent, SignalingChannel};

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub negotiation_timeout: Duration,
    pub early_signal_limit: usize,
    pub constraints: CaptureConstraints,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            negotiation_timeout: NEGOTIATION_TIMEOUT,
            early_signal_limit: EARLY_SIGNAL_LIMIT,
            constraints: CaptureConstraints::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub identity: Identity,
    pub room_id: String,
    pub video: bool,
    pub audio: bool,
}

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub factory: Arc<dyn TransportFactory>,
    pub sink: Arc<dyn EventSink>,
}

enum Command {
    SetEnabled {
        kind: MediaKind,
        enabled: bool,
        reply: oneshot::Sender<bool>,
    },
    StartScreenShare {
        reply: oneshot::Sender<Result<()>>,
    },
    StopScreenShare {
        reply: oneshot::Sender<Result<bool>>,
    },
    ScreenEnded {
        track_id: String,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Leave {
        reply: oneshot::Sender<usize>,
    },
}

struct Session {
    orchestrator: RoomOrchestrator,
    signaling: SignalingChannel,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_weak: mpsc::WeakUnboundedSender<Command>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    sink: Arc<dyn EventSink>,
}

enum Exit {
    Left,
    ChannelLost,
}

/// Acquire local media, announce ourselves and start the session actor.
///
/// Media is acquired before anything else, so a missing device fails the
/// join before any peer connection exists.
pub async fn join(
    request: JoinRequest,
    settings: SessionSettings,
    deps: SessionDeps,
    signaling: SignalingChannel,
) -> Result<SessionHandle> {
    let JoinRequest {
        identity,
        room_id,
        video,
        audio,
    } = request;

    let media = match LocalMediaSource::acquire(
        deps.devices.clone(),
        settings.constraints.clone(),
        video,
        audio,
    )
    .await
    {
        // Only screen captures are watched for an external stop.
        Ok((media, _camera_ended)) => media,
        Err(e) => return Err(abort_join(deps.sink.as_ref(), e.into())),
    };

    let signals = signaling.sender();
    let announced = signals.send(ClientMessage::JoinRoom {
        room_id: room_id.clone(),
        participant_id: identity.participant_id.clone(),
        display_name: identity.display_name.clone(),
    });
    if let Err(e) = announced {
        return Err(abort_join(deps.sink.as_ref(), e.into()));
    }

    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let ctx = PeerContext {
        local: identity.participant_id.clone(),
        signals,
        sink: deps.sink.clone(),
        peer_events: peer_tx,
        negotiation_timeout: settings.negotiation_timeout,
    };
    let orchestrator = RoomOrchestrator::new(
        ctx,
        room_id.clone(),
        media,
        deps.factory,
        settings.early_signal_limit,
    );

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let session = Session {
        orchestrator,
        signaling,
        commands: cmd_rx,
        commands_weak: cmd_tx.downgrade(),
        peer_events: peer_rx,
        sink: deps.sink,
    };
    info!(participant = %identity.participant_id, room = %room_id, "Joined room");
    let task = tokio::spawn(session.run());

    Ok(SessionHandle {
        local: identity.participant_id,
        room_id,
        commands: cmd_tx,
        task,
    })
}

fn abort_join(sink: &dyn EventSink, e: SessionError) -> SessionError {
    warn!("Join aborted: {e}");
    if let Some(kind) = e.kind() {
        sink.on_fatal_error(kind, &e.to_string());
    }
    e
}

impl Session {
    async fn run(mut self) {
        let exit = loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break Exit::Left;
                        }
                    }
                    None => {
                        debug!("Session handle dropped, leaving");
                        self.leave().await;
                        break Exit::Left;
                    }
                },
                event = self.signaling.recv() => match event {
                    SignalEvent::Message(msg) => self.orchestrator.handle_relay(msg).await,
                    SignalEvent::ChannelError(reason) => {
                        error!("Signaling channel lost: {reason}");
                        self.orchestrator.shutdown().await;
                        self.sink.on_fatal_error(ErrorKind::SignalingChannelLost, &reason);
                        break Exit::ChannelLost;
                    }
                },
                Some(event) = self.peer_events.recv() => {
                    self.orchestrator.handle_peer_event(event).await;
                }
            }
        };

        let Session { signaling, .. } = self;
        match exit {
            Exit::Left => signaling.detach(),
            Exit::ChannelLost => drop(signaling),
        }
        debug!("Session finished");
    }

    async fn leave(&mut self) -> usize {
        let msg = ClientMessage::LeaveRoom {
            room_id: self.orchestrator.room_id().to_string(),
        };
        if let Err(e) = self.signaling.sender().send(msg) {
            warn!("Leave notice not sent: {e}");
        }
        let closed = self.orchestrator.shutdown().await;
        info!(closed, "Left room");
        closed
    }

    /// Returns `true` once the session has left the room.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SetEnabled {
                kind,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.orchestrator.set_enabled(kind, enabled));
            }
            Command::StartScreenShare { reply } => {
                let result = self.orchestrator.start_screen_share().await;
                let result = result.map(|watch| {
                    if let Some(watch) = watch {
                        self.watch_screen(watch);
                    }
                });
                let _ = reply.send(result);
            }
            Command::StopScreenShare { reply } => {
                let _ = reply.send(self.orchestrator.stop_screen_share().await);
            }
            Command::ScreenEnded { track_id } => {
                info!(track = %track_id, "Screen capture ended externally");
                if let Err(e) = self.orchestrator.screen_capture_ended(&track_id).await {
                    warn!("Could not restore the camera after screen share: {e}");
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.orchestrator.snapshot());
            }
            Command::Leave { reply } => {
                let closed = self.leave().await;
                let _ = reply.send(closed);
                return true;
            }
        }
        false
    }

    /// Route an OS-level "stop sharing" into the same stop path as the UI.
    fn watch_screen(&self, watch: ScreenWatch) {
        let commands = self.commands_weak.clone();
        tokio::spawn(async move {
            if watch.ended.await.is_err() {
                return;
            }
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::ScreenEnded {
                    track_id: watch.track_id,
                });
            }
        });
    }
}

/// Handle to a running session.
pub struct SessionHandle {
    local: ParticipantId,
    room_id: String,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// True once the session ended, by leaving or by a fatal error.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Mute or unmute a local track. Returns whether such a track exists.
    pub async fn set_enabled(&self, kind: MediaKind, enabled: bool) -> Result<bool> {
        self.request(|reply| Command::SetEnabled {
            kind,
            enabled,
            reply,
        })
        .await
    }

    /// Idempotent: a second call while sharing changes nothing.
    pub async fn start_screen_share(&self) -> Result<()> {
        self.request(|reply| Command::StartScreenShare { reply })
            .await?
    }

    /// Idempotent: `Ok(false)` when no screen share was running.
    pub async fn stop_screen_share(&self) -> Result<bool> {
        self.request(|reply| Command::StopScreenShare { reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Leave the room and wait for the session to finish. Returns how many
    /// peer connections were closed; zero if the session had already ended.
    pub async fn leave(self) -> Result<usize> {
        let closed = match self.request(|reply| Command::Leave { reply }).await {
            Ok(n) => n,
            Err(SessionError::Closed) => 0,
            Err(e) => return Err(e),
        };
        if let Err(e) = self.task.await {
            warn!("Session task ended abnormally: {e}");
        }
        Ok(closed)
    }

    /// Wait until the session ends on its own, e.g. after a fatal error.
    pub async fn finished(self) {
        let SessionHandle { commands, task, .. } = self;
        let _ = task.await;
        drop(commands);
    }
}
