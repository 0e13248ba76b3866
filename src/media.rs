//! Local media source: owns the microphone and camera/screen captures and the
//! WebRTC tracks they feed.
//!
//! Tracks are shared by reference with every peer connection. Only the
//! [`LocalMediaSource`] (owned by the session) stops or replaces them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::MediaError;
use crate::utils::random_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Where the outgoing video comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoSource {
    Camera,
    Screen,
}

/// A device capture the source can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureRequest {
    Microphone,
    Camera,
    Screen,
}

impl From<VideoSource> for CaptureRequest {
    fn from(source: VideoSource) -> Self {
        match source {
            VideoSource::Camera => CaptureRequest::Camera,
            VideoSource::Screen => CaptureRequest::Screen,
        }
    }
}

/// Capture constraints handed to the device layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// A running device capture.
pub trait Capture: Send {
    fn label(&self) -> String;

    /// Begin pushing encoded samples into `writer`.
    fn start(&mut self, writer: TrackWriter);

    /// Release the device.
    fn stop(&mut self);

    /// Fires when the capture ends on its own (e.g. the OS "stop sharing" button).
    fn take_ended(&mut self) -> Option<oneshot::Receiver<()>> {
        None
    }
}

/// Platform capture backend.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(
        &self,
        request: CaptureRequest,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn Capture>, MediaError>;
}

/// Device backend with no devices at all; only receive-only joins succeed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevices;

#[async_trait]
impl MediaDevices for NoDevices {
    async fn open(
        &self,
        request: CaptureRequest,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn Capture>, MediaError> {
        Err(MediaError::DeviceUnavailable {
            request,
            reason: "no capture devices on this host".into(),
        })
    }
}

/// Write side of a local track handed to the capture backend.
#[derive(Clone)]
pub struct TrackWriter {
    rtc: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl TrackWriter {
    /// Returns `false` when the sample was dropped because the track is muted.
    pub async fn write(&self, sample: &Sample) -> Result<bool, webrtc::Error> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.rtc.write_sample(sample).await?;
        Ok(true)
    }
}

/// An outgoing track backed by one capture.
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    source: Option<VideoSource>,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    stopped: AtomicBool,
    capture: Mutex<Box<dyn Capture>>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalTrack {
    /// Wrap `capture` in a WebRTC track and start it.
    pub fn start(
        kind: MediaKind,
        source: Option<VideoSource>,
        mut capture: Box<dyn Capture>,
        stream_id: &str,
        enabled: bool,
    ) -> (Arc<Self>, Option<oneshot::Receiver<()>>) {
        let id = format!("{}-{}", kind_label(kind, source), random_id());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec_for(kind),
            id.clone(),
            stream_id.to_string(),
        ));
        let enabled = Arc::new(AtomicBool::new(enabled));
        let ended = capture.take_ended();
        capture.start(TrackWriter {
            rtc: rtc.clone(),
            enabled: enabled.clone(),
        });
        debug!(track = %id, label = %capture.label(), "Local track started");

        let track = Arc::new(Self {
            id,
            kind,
            source,
            rtc,
            enabled,
            stopped: AtomicBool::new(false),
            capture: Mutex::new(capture),
        });
        (track, ended)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn source(&self) -> Option<VideoSource> {
        self.source
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// The track as the WebRTC stack sees it.
    pub fn rtc(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtc.clone() as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Stops the capture. Only the first call has an effect.
    pub(crate) fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.capture.lock().stop();
        debug!(track = %self.id, "Local track stopped");
        true
    }
}

fn kind_label(kind: MediaKind, source: Option<VideoSource>) -> &'static str {
    match (kind, source) {
        (MediaKind::Audio, _) => "audio",
        (MediaKind::Video, Some(VideoSource::Screen)) => "screen",
        (MediaKind::Video, _) => "camera",
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

/// A freshly opened video capture not yet installed as the outgoing track.
pub struct PendingVideo {
    pub track: Arc<LocalTrack>,
    pub ended: Option<oneshot::Receiver<()>>,
}

/// Owner of the local audio and video tracks for one session.
pub struct LocalMediaSource {
    devices: Arc<dyn MediaDevices>,
    constraints: CaptureConstraints,
    stream_id: String,
    audio: Option<Arc<LocalTrack>>,
    video: Option<Arc<LocalTrack>>,
    active: VideoSource,
    released: bool,
}

impl LocalMediaSource {
    /// Acquire the requested captures. Nothing is left running on failure.
    pub async fn acquire(
        devices: Arc<dyn MediaDevices>,
        constraints: CaptureConstraints,
        video_requested: bool,
        audio_requested: bool,
    ) -> Result<(Self, Option<oneshot::Receiver<()>>), MediaError> {
        let mut source = Self {
            devices,
            constraints,
            stream_id: format!("stream-{}", random_id()),
            audio: None,
            video: None,
            active: VideoSource::Camera,
            released: false,
        };

        if audio_requested {
            let capture = source
                .devices
                .open(CaptureRequest::Microphone, &source.constraints)
                .await?;
            let (track, _) =
                LocalTrack::start(MediaKind::Audio, None, capture, &source.stream_id, true);
            source.audio = Some(track);
        }

        let mut ended = None;
        if video_requested {
            match source.open_video(VideoSource::Camera).await {
                Ok(pending) => {
                    ended = pending.ended;
                    source.video = Some(pending.track);
                }
                Err(e) => {
                    source.release();
                    return Err(e);
                }
            }
        }

        info!(
            audio = source.audio.is_some(),
            video = source.video.is_some(),
            "Local media acquired"
        );
        Ok((source, ended))
    }

    /// Open a new video capture; the current outgoing track is untouched.
    pub async fn open_video(&self, source: VideoSource) -> Result<PendingVideo, MediaError> {
        if self.released {
            return Err(MediaError::Released);
        }
        let capture = self.devices.open(source.into(), &self.constraints).await?;
        let enabled = self.video.as_ref().map_or(true, |v| v.is_enabled());
        let (track, ended) = LocalTrack::start(
            MediaKind::Video,
            Some(source),
            capture,
            &self.stream_id,
            enabled,
        );
        Ok(PendingVideo { track, ended })
    }

    /// Install `track` as the outgoing video and stop the previous capture.
    ///
    /// Call only once every connection has switched to `track`.
    pub fn commit_video(&mut self, track: Arc<LocalTrack>) -> Option<Arc<LocalTrack>> {
        self.active = track.source().unwrap_or(VideoSource::Camera);
        let old = self.video.replace(track);
        if let Some(old) = &old {
            old.stop();
        }
        old
    }

    /// Mute or unmute without renegotiation. Returns whether such a track exists.
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        match self.track(kind) {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn track(&self, kind: MediaKind) -> Option<&Arc<LocalTrack>> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    pub fn active_source(&self) -> VideoSource {
        self.active
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Stop every track. Later calls are no-ops.
    pub fn release(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        let stopped = self
            .audio
            .take()
            .into_iter()
            .chain(self.video.take())
            .filter(|t| t.stop())
            .count();
        if stopped > 0 {
            info!(stopped, "Local media released");
        } else {
            debug!("Local media released with no running tracks");
        }
        stopped
    }
}

impl Drop for LocalMediaSource {
    fn drop(&mut self) {
        self.release();
    }
}
