use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use meshroom::peer::rtc::RtcTransportFactory;
use meshroom::registry::RegistryClient;
use meshroom::utils::random_id;
use meshroom::{
    config, logger, signaling, ChannelSink, Identity, JoinRequest, NoDevices, ParticipantId,
    RoomEvent, SessionDeps,
};

#[derive(Parser, Debug)]
#[command(name = "meshroom")]
#[command(about = "Join a mesh room receive-only and print room events", long_about = None)]
struct Args {
    /// Room to join
    room_id: String,

    /// Display name shown to the other participants
    #[arg(long, env = "MESHROOM_NAME", default_value = "meshroom-cli")]
    name: String,

    /// Participant id (random when omitted)
    #[arg(long, env = "MESHROOM_PARTICIPANT_ID")]
    participant_id: Option<String>,

    /// Config file path without extension
    #[arg(long, short)]
    config: Option<String>,

    /// Do not look the room up in the registry first
    #[arg(long)]
    skip_registry: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(args.config.as_deref()).context("loading configuration")?;
    logger::init(&cfg.log.filter);

    if !args.skip_registry {
        let registry = RegistryClient::new(&cfg.registry.url, cfg.registry.token.clone())?;
        let room = registry
            .fetch_room(&args.room_id)
            .await
            .with_context(|| format!("looking up room {}", args.room_id))?;
        if !room.has_room_for(1) {
            bail!("room '{}' is full ({} participants)", room.name, room.max_participants);
        }
        info!(room = %room.name, host = %room.host_id, "Room found");
    }

    let identity = Identity {
        participant_id: ParticipantId::new(args.participant_id.unwrap_or_else(random_id)),
        display_name: args.name,
    };
    let channel = signaling::ws::connect(&cfg.signaling.url)
        .await
        .context("connecting to the signaling relay")?;

    let (sink, mut events) = ChannelSink::new();
    let deps = SessionDeps {
        devices: Arc::new(NoDevices),
        factory: Arc::new(RtcTransportFactory::new(cfg.ice_servers())?),
        sink: Arc::new(sink),
    };
    let request = JoinRequest {
        identity,
        room_id: args.room_id,
        video: false,
        audio: false,
    };
    let session = meshroom::join(request, cfg.session_settings(), deps, channel).await?;
    info!(participant = %session.local_id(), "Receiving; press Ctrl-C to leave");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if let RoomEvent::FatalError { kind, detail } = event {
                    warn!(?kind, "Session ended: {detail}");
                    session.finished().await;
                    bail!("session ended: {detail}");
                }
            }
        }
    }

    let closed = session.leave().await?;
    info!(closed, "Bye");
    Ok(())
}
