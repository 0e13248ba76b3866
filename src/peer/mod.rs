pub mod connection;
pub mod ice;
pub mod rtc;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{PeerConnection, PeerContext, PeerSnapshot};
pub use state::{PeerState, TransportState};
pub use transport::{PeerEvent, PeerEventKind, RemoteTrack, Transport, TransportFactory};
pub use types::{IceCandidate, Identity, ParticipantId, Role, ServerConfig, SessionDescription};
