//! webrtc-rs backed [`Transport`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use crate::error::TransportError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalTrack, MediaKind};
use crate::peer::state::TransportState;
use crate::peer::transport::{
    RemoteTrack, ReplaceOutcome, Transport, TransportEvents, TransportFactory,
};
use crate::peer::types::{IceCandidate, ParticipantId, SdpKind, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;

/// Builds one `RTCPeerConnection` per remote participant.
pub struct RtcTransportFactory {
    api: API,
    servers: Vec<ServerConfig>,
}

impl RtcTransportFactory {
    pub fn new(servers: Vec<ServerConfig>) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, servers })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let servers = if self.servers.is_empty() {
            ServerConfig::defaults()
        } else {
            self.servers.clone()
        };
        RTCConfiguration {
            ice_servers: ice_servers(servers),
            ice_candidate_pool_size: 10,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

pub fn ice_servers(servers: Vec<ServerConfig>) -> Vec<RTCIceServer> {
    servers
        .into_iter()
        .map(|config| {
            let url = add_ice_url_scheme(&config);
            RTCIceServer {
                urls: vec![url],
                username: config.username.unwrap_or_default(),
                credential: config.credential.unwrap_or_default(),
                ..Default::default()
            }
        })
        .collect()
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        participant: &ParticipantId,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config()).await?);

        let ev = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let events = ev.clone();
            Box::pin(async move {
                let Some(c) = cand else {
                    debug!(participant = %events.participant(), "ICE gathering complete");
                    return;
                };
                dump_candidate("LOCAL", &c);
                match c.to_json() {
                    Ok(init) => events.local_candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(e) => warn!("Unserializable local candidate: {e}"),
                }
            })
        }));

        let ev = events.clone();
        let weak = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            let state = match st {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                    TransportState::New
                }
                RTCPeerConnectionState::Connecting => TransportState::Connecting,
                RTCPeerConnectionState::Connected => TransportState::Connected,
                RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                RTCPeerConnectionState::Failed => TransportState::Failed,
                RTCPeerConnectionState::Closed => TransportState::Closed,
            };
            if state == TransportState::Failed {
                if let Some(pc) = weak.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            ev.state_changed(state);
            Box::pin(async {})
        }));

        let ev = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            ev.remote_track(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
                rtc: Some(track),
            });
            Box::pin(async {})
        }));

        debug!(%participant, "RTCPeerConnection created");
        Ok(Arc::new(RtcTransport {
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    Ok(match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

#[async_trait]
impl Transport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), TransportError> {
        let sender = self.pc.add_track(track.rtc()).await?;

        // RTCP has to be drained for the interceptors to work.
        let rtcp = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().insert(track.kind(), sender);
        Ok(())
    }

    async fn add_receiver(&self, kind: MediaKind) -> Result<(), TransportError> {
        self.pc
            .add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn replace_track(&self, track: &Arc<LocalTrack>) -> Result<ReplaceOutcome, TransportError> {
        let sender = self.senders.lock().get(&track.kind()).cloned();
        let Some(sender) = sender else {
            return Ok(ReplaceOutcome::Unsupported);
        };
        match sender.replace_track(Some(track.rtc())).await {
            Ok(()) => Ok(ReplaceOutcome::Replaced),
            Err(e) => {
                debug!("replace_track rejected: {e}");
                Ok(ReplaceOutcome::Unsupported)
            }
        }
    }

    async fn swap_track(&self, track: &Arc<LocalTrack>) -> Result<(), TransportError> {
        let old = self.senders.lock().remove(&track.kind());
        if let Some(old) = old {
            self.pc.remove_track(&old).await?;
        }
        self.add_track(track).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.senders.lock().clear();
        self.pc.close().await?;
        Ok(())
    }
}
