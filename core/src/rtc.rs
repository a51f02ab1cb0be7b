//! webrtc-rs backed peer links and sample-fed capture tracks

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{Error, Result};
use crate::media::{
    CaptureConstraints, ConnectionState, EventSender, LocalTrack, MediaDevices, PeerConnector,
    PeerLink, SenderId, SessionEvent, TrackKind,
};

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

fn track_kind(kind: RTPCodecType) -> TrackKind {
    if kind == RTPCodecType::Video {
        TrackKind::Video
    } else {
        TrackKind::Audio
    }
}

// ============================================================================
// Peer connector
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcConnector;

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, ice_servers: &[String], events: EventSender) -> Result<Box<dyn PeerLink>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers.to_vec(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);

        let track_events = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let event = SessionEvent::TrackReceived {
                track_id: track.id().to_string(),
                kind: track_kind(track.kind()),
            };
            if track_events.send(event).is_err() {
                log::debug!("Remote track arrived after session closed");
            }
            Box::pin(async {})
        }));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            log::info!("Peer connection state: {}", state);
            let _ = events.send(SessionEvent::StateChanged(state.into()));
            Box::pin(async {})
        }));

        Ok(Box::new(RtcLink { pc }))
    }
}

pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
}

impl RtcLink {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    async fn sender(&self, id: SenderId) -> Result<Arc<RTCRtpSender>> {
        self.pc
            .get_senders()
            .await
            .get(id.0)
            .cloned()
            .ok_or_else(|| Error::Media(format!("no sender at index {}", id.0)))
    }
}

fn rtp_source(track: &Arc<dyn LocalTrack>) -> Result<Arc<dyn TrackLocal + Send + Sync>> {
    track
        .rtp_track()
        .ok_or_else(|| Error::Media(format!("track {} has no RTP source", track.id())))
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<SenderId> {
        let sender = self.pc.add_track(rtp_source(&track)?).await?;

        // RTCP must be drained for interceptors to work
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtcp_sender.read(&mut buf).await {}
        });

        let senders = self.pc.get_senders().await;
        senders
            .iter()
            .position(|s| Arc::ptr_eq(s, &sender))
            .map(SenderId)
            .ok_or_else(|| Error::Media("sender missing after add_track".into()))
    }

    async fn video_sender(&self) -> Option<SenderId> {
        for (index, sender) in self.pc.get_senders().await.iter().enumerate() {
            if let Some(track) = sender.track().await {
                if track.kind() == RTPCodecType::Video {
                    return Some(SenderId(index));
                }
            }
        }
        None
    }

    async fn replace_track(&self, sender: SenderId, track: Arc<dyn LocalTrack>) -> Result<()> {
        let source = rtp_source(&track)?;
        self.sender(sender).await?.replace_track(Some(source)).await?;
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let sender = self.sender(sender).await?;
        self.pc.remove_track(&sender).await?;
        Ok(())
    }

    async fn outbound(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::new();
        for sender in self.pc.get_senders().await {
            if let Some(track) = sender.track().await {
                kinds.push(track_kind(track.kind()));
            }
        }
        kinds
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

// ============================================================================
// Sample tracks
// ============================================================================

/// Capture track fed with encoded samples by the host (Opus audio or VP8
/// screen frames).
pub struct SampleTrack {
    id: String,
    kind: TrackKind,
    rtp: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    ended: Option<EventSender>,
}

impl SampleTrack {
    pub fn audio(stream_id: &str) -> Self {
        let id = format!("audio-{}", uuid::Uuid::new_v4());
        let capability = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        };
        Self::build(id, TrackKind::Audio, capability, stream_id, None)
    }

    /// Screen track; `ended` is told when the host ends the capture.
    pub fn screen(stream_id: &str, ended: EventSender) -> Self {
        let id = format!("screen-{}", uuid::Uuid::new_v4());
        let capability = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        };
        Self::build(id, TrackKind::Video, capability, stream_id, Some(ended))
    }

    fn build(
        id: String,
        kind: TrackKind,
        capability: RTCRtpCodecCapability,
        stream_id: &str,
        ended: Option<EventSender>,
    ) -> Self {
        let rtp = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            id,
            kind,
            rtp,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            ended,
        }
    }

    /// Writes one encoded sample. Muted tracks drop samples silently.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::Media(format!("track {} is stopped", self.id)));
        }
        if !self.is_enabled() {
            return Ok(());
        }
        self.rtp.write_sample(sample).await?;
        Ok(())
    }

    /// The capture source went away outside the session.
    pub fn end(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(ended) = &self.ended {
            let _ = ended.send(SessionEvent::CaptureEnded {
                track_id: self.id.clone(),
            });
        }
    }
}

impl std::fmt::Debug for SampleTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn rtp_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(self.rtp.clone())
    }
}

/// Devices backed by `SampleTrack`s. Permission flags stand in for the
/// platform's consent prompt.
#[derive(Debug)]
pub struct SampleDevices {
    stream_id: String,
    allow_microphone: bool,
    allow_display: bool,
    microphone: Mutex<Option<Arc<SampleTrack>>>,
    display: Mutex<Option<Arc<SampleTrack>>>,
}

impl SampleDevices {
    pub fn new(stream_id: &str, allow_microphone: bool, allow_display: bool) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            allow_microphone,
            allow_display,
            microphone: Mutex::new(None),
            display: Mutex::new(None),
        }
    }

    /// Most recent microphone track, for feeding samples.
    pub fn microphone(&self) -> Option<Arc<SampleTrack>> {
        self.microphone.lock().clone()
    }

    pub fn display(&self) -> Option<Arc<SampleTrack>> {
        self.display.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn user_media(&self, constraints: &CaptureConstraints) -> Result<Arc<dyn LocalTrack>> {
        if !constraints.audio || !self.allow_microphone {
            return Err(Error::PermissionDenied("microphone".into()));
        }
        let track = Arc::new(SampleTrack::audio(&self.stream_id));
        *self.microphone.lock() = Some(track.clone());
        Ok(track)
    }

    async fn display_media(
        &self,
        constraints: &CaptureConstraints,
        events: EventSender,
    ) -> Result<Arc<dyn LocalTrack>> {
        if constraints.video.is_none() || !self.allow_display {
            return Err(Error::PermissionDenied("screen capture".into()));
        }
        let track = Arc::new(SampleTrack::screen(&self.stream_id, events));
        *self.display.lock() = Some(track.clone());
        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_link_replaces_video_in_place() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = WebRtcConnector.connect(&[], tx.clone()).await.unwrap();
        let devices = SampleDevices::new("call", true, true);

        let mic = devices.user_media(&CaptureConstraints::microphone()).await.unwrap();
        link.add_track(mic).await.unwrap();
        assert!(link.video_sender().await.is_none());

        let first = devices
            .display_media(&CaptureConstraints::screen(), tx.clone())
            .await
            .unwrap();
        let sender = link.add_track(first).await.unwrap();
        assert_eq!(link.video_sender().await, Some(sender));

        let second = devices
            .display_media(&CaptureConstraints::screen(), tx)
            .await
            .unwrap();
        link.replace_track(sender, second).await.unwrap();

        assert_eq!(link.outbound().await, vec![TrackKind::Audio, TrackKind::Video]);
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_denied_devices() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let devices = SampleDevices::new("call", false, false);

        assert!(matches!(
            devices.user_media(&CaptureConstraints::microphone()).await,
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            devices.display_media(&CaptureConstraints::screen(), tx).await,
            Err(Error::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_ended_screen_reports_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let track = SampleTrack::screen("call", tx);

        track.end();
        track.end();

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::CaptureEnded {
                track_id: track.id().to_string()
            }
        );
        assert!(rx.try_recv().is_err());
        assert!(track.write_sample(&Sample::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_muted_track_drops_samples() {
        let track = SampleTrack::audio("call");
        track.set_enabled(false);
        assert!(track.write_sample(&Sample::default()).await.is_ok());
    }
}
