//! Full-mesh WebRTC room client.
//!
//! A [`session`] joins one room through a signaling relay and keeps exactly
//! one negotiated peer connection to every other participant, driven by a
//! single event loop.

pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod orchestrator;
pub mod peer;
pub mod registry;
pub mod room;
pub mod session;
pub mod signaling;
pub mod utils;

pub use error::{ErrorKind, Result, SessionError};
pub use events::{ChannelSink, EventSink, RoomEvent};
pub use media::{MediaDevices, MediaKind, NoDevices, VideoSource};
pub use orchestrator::{RoomOrchestrator, SessionSnapshot};
pub use peer::{Identity, ParticipantId, PeerState};
pub use session::{join, JoinRequest, SessionDeps, SessionHandle, SessionSettings};
