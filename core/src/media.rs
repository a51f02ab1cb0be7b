//! Media session manager
//!
//! One `MediaSession` owns the local capture tracks and the peer link of a
//! screen-share call. Every transition goes through an explicit method or a
//! `SessionEvent`; operations that make no sense in the current phase are
//! rejected with `Error::InvalidTransition`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

pub const CONNECTION_LOST_MESSAGE: &str = "Connection lost. Please try rejoining the call.";
pub const MICROPHONE_DENIED_MESSAGE: &str = "Unable to access microphone. Please check permissions.";

// ============================================================================
// Device and peer boundaries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local capture track (microphone or screen).
pub trait LocalTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Releases the underlying device. Idempotent.
    fn stop(&self);
    fn is_stopped(&self) -> bool;

    /// RTP source for webrtc-backed peer links.
    fn rtp_track(
        &self,
    ) -> Option<Arc<dyn webrtc::track::track_local::TrackLocal + Send + Sync>> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl CaptureConstraints {
    /// Microphone only, no camera.
    pub fn microphone() -> Self {
        Self {
            audio: true,
            video: None,
        }
    }

    /// Screen video only; the microphone track already carries audio.
    pub fn screen() -> Self {
        Self {
            audio: false,
            video: Some(VideoConstraints {
                ideal_width: 1920,
                ideal_height: 1080,
            }),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn user_media(&self, constraints: &CaptureConstraints) -> Result<Arc<dyn LocalTrack>>;

    /// `events` receives `CaptureEnded` when the user stops sharing from
    /// outside the session.
    async fn display_media(
        &self,
        constraints: &CaptureConstraints,
        events: EventSender,
    ) -> Result<Arc<dyn LocalTrack>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderId(pub usize);

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<SenderId>;

    /// The outbound sender currently carrying a video track.
    async fn video_sender(&self) -> Option<SenderId>;

    async fn replace_track(&self, sender: SenderId, track: Arc<dyn LocalTrack>) -> Result<()>;

    async fn remove_track(&self, sender: SenderId) -> Result<()>;

    /// Kinds of the tracks currently attached to outbound senders.
    async fn outbound(&self) -> Vec<TrackKind>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Creates a link whose remote-track and state callbacks feed `events`.
    async fn connect(&self, ice_servers: &[String], events: EventSender) -> Result<Box<dyn PeerLink>>;
}

// ============================================================================
// Events and states
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    TrackReceived { track_id: String, kind: TrackKind },
    StateChanged(ConnectionState),
    CaptureEnded { track_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Failed,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Ended => "ended",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Needs a permission change before retrying.
    PermissionDenied,
    /// The user may rejoin.
    ConnectionLost,
    /// A capture device could not be opened; retrying may work.
    DeviceUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

// ============================================================================
// Single-session registry
// ============================================================================

/// Participants that currently own a media session.
#[derive(Debug, Clone, Default)]
pub struct ActiveCalls {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ActiveCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, participant: &str) -> bool {
        self.inner.lock().contains(&participant.to_ascii_lowercase())
    }

    fn claim(&self, participant: &str) -> Result<CallClaim> {
        let key = participant.to_ascii_lowercase();
        if !self.inner.lock().insert(key.clone()) {
            return Err(Error::SessionAlreadyActive(participant.to_string()));
        }
        Ok(CallClaim {
            registry: self.clone(),
            key,
        })
    }
}

#[derive(Debug)]
struct CallClaim {
    registry: ActiveCalls,
    key: String,
}

impl Drop for CallClaim {
    fn drop(&mut self) {
        self.registry.inner.lock().remove(&self.key);
    }
}

// ============================================================================
// Media Session
// ============================================================================

struct Call {
    audio: Arc<dyn LocalTrack>,
    screen: Option<Arc<dyn LocalTrack>>,
    preview: bool,
    remote_track: Option<String>,
    link: Box<dyn PeerLink>,
}

impl Call {
    fn stop_tracks(&mut self) {
        self.audio.stop();
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        self.preview = false;
    }
}

enum Phase {
    Idle,
    Connecting(Call),
    Connected(Call),
    Failed { call: Option<Call>, failure: Failure },
    Ended,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::Idle => SessionState::Idle,
            Phase::Connecting(_) => SessionState::Connecting,
            Phase::Connected(_) => SessionState::Connected,
            Phase::Failed { .. } => SessionState::Failed,
            Phase::Ended => SessionState::Ended,
        }
    }

    fn live_call(&mut self) -> Option<&mut Call> {
        match self {
            Phase::Connecting(call) | Phase::Connected(call) => Some(call),
            _ => None,
        }
    }

    fn call(&self) -> Option<&Call> {
        match self {
            Phase::Connecting(call) | Phase::Connected(call) => Some(call),
            Phase::Failed { call, .. } => call.as_ref(),
            _ => None,
        }
    }
}

pub struct MediaSession {
    participant: String,
    meeting_duration: u32,
    ice_servers: Vec<String>,
    devices: Arc<dyn MediaDevices>,
    connector: Arc<dyn PeerConnector>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    phase: Phase,
    started_at: Option<DateTime<FixedOffset>>,
    _claim: CallClaim,
}

impl MediaSession {
    pub fn new(
        calls: &ActiveCalls,
        participant: &str,
        meeting_duration: u32,
        ice_servers: Vec<String>,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Self> {
        let claim = calls.claim(participant)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            participant: participant.to_string(),
            meeting_duration,
            ice_servers,
            devices,
            connector,
            events_tx,
            events_rx,
            phase: Phase::Idle,
            started_at: None,
            _claim: claim,
        })
    }

    pub fn state(&self) -> SessionState {
        self.phase.state()
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.phase {
            Phase::Failed { failure, .. } => Some(failure),
            _ => None,
        }
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.phase.call().map_or(false, |c| c.screen.is_some())
    }

    pub fn has_preview(&self) -> bool {
        self.phase.call().map_or(false, |c| c.preview)
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.phase.call().map_or(false, |c| c.audio.is_enabled())
    }

    pub fn remote_track(&self) -> Option<&str> {
        self.phase.call().and_then(|c| c.remote_track.as_deref())
    }

    pub fn events_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    fn invalid(&self, event: &'static str) -> Error {
        Error::InvalidTransition {
            state: self.state().as_str(),
            event,
        }
    }

    /// Acquires the microphone, opens the peer link and attaches audio.
    pub async fn start(&mut self, now: DateTime<FixedOffset>) -> Result<()> {
        if !matches!(self.phase, Phase::Idle) {
            return Err(self.invalid("start"));
        }

        let audio = match self.devices.user_media(&CaptureConstraints::microphone()).await {
            Ok(track) => track,
            Err(e) => {
                log::warn!("Microphone capture failed for {}: {}", self.participant, e);
                let failure = match &e {
                    Error::PermissionDenied(_) => Failure {
                        kind: FailureKind::PermissionDenied,
                        message: MICROPHONE_DENIED_MESSAGE.to_string(),
                    },
                    other => Failure {
                        kind: FailureKind::DeviceUnavailable,
                        message: other.to_string(),
                    },
                };
                self.phase = Phase::Failed { call: None, failure };
                return Err(e);
            }
        };

        let link = match self
            .connector
            .connect(&self.ice_servers, self.events_tx.clone())
            .await
        {
            Ok(link) => link,
            Err(e) => {
                audio.stop();
                return Err(self.fail_connection(None, e));
            }
        };

        if let Err(e) = link.add_track(audio.clone()).await {
            audio.stop();
            if let Err(close_err) = link.close().await {
                log::debug!("Closing link after failed start: {}", close_err);
            }
            return Err(self.fail_connection(None, e));
        }

        log::info!("Media session started for {}", self.participant);
        self.started_at = Some(now);
        self.phase = Phase::Connecting(Call {
            audio,
            screen: None,
            preview: false,
            remote_track: None,
            link,
        });

        Ok(())
    }

    fn fail_connection(&mut self, call: Option<Call>, cause: Error) -> Error {
        log::warn!("Media session for {} failed: {}", self.participant, cause);
        self.phase = Phase::Failed {
            call,
            failure: Failure {
                kind: FailureKind::ConnectionLost,
                message: CONNECTION_LOST_MESSAGE.to_string(),
            },
        };
        Error::ConnectionFailure(cause.to_string())
    }

    /// Applies one peer or device event.
    pub fn handle(&mut self, event: SessionEvent) {
        if let SessionEvent::CaptureEnded { track_id } = &event {
            self.capture_ended(track_id);
            return;
        }

        let phase = std::mem::replace(&mut self.phase, Phase::Ended);
        self.phase = match (phase, event) {
            (
                Phase::Connecting(mut call) | Phase::Connected(mut call),
                SessionEvent::TrackReceived { track_id, kind },
            ) => {
                log::info!("Remote {:?} track {} bound", kind, track_id);
                call.remote_track = Some(track_id);
                Phase::Connected(call)
            }
            (Phase::Connecting(call), SessionEvent::StateChanged(ConnectionState::Connected)) => {
                Phase::Connected(call)
            }
            (
                Phase::Connecting(call) | Phase::Connected(call),
                SessionEvent::StateChanged(ConnectionState::Disconnected | ConnectionState::Failed),
            ) => {
                log::warn!("Peer connection lost for {}", self.participant);
                Phase::Failed {
                    call: Some(call),
                    failure: Failure {
                        kind: FailureKind::ConnectionLost,
                        message: CONNECTION_LOST_MESSAGE.to_string(),
                    },
                }
            }
            (phase, event) => {
                log::debug!("Ignoring {:?} while {}", event, phase.state());
                phase
            }
        };
    }

    fn capture_ended(&mut self, track_id: &str) {
        let Some(call) = self.phase.live_call() else {
            return;
        };
        if call.screen.as_ref().map(|t| t.id()) != Some(track_id) {
            return;
        }
        log::info!("Screen capture {} ended by user", track_id);
        if let Some(screen) = call.screen.take() {
            screen.stop();
        }
        call.preview = false;
    }

    /// Applies every event already queued. Returns how many were applied.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle(event);
            applied += 1;
        }
        applied
    }

    /// Waits for the next event and applies it.
    pub async fn process_next(&mut self) -> Option<SessionState> {
        let event = self.events_rx.recv().await?;
        self.handle(event);
        Some(self.state())
    }

    pub async fn start_screen_share(&mut self) -> Result<()> {
        match self.phase.live_call() {
            None => return Err(self.invalid("start screen share")),
            Some(call) if call.screen.is_some() => {
                return Err(Error::InvalidTransition {
                    state: "sharing",
                    event: "start screen share",
                })
            }
            Some(_) => {}
        }

        let screen = self
            .devices
            .display_media(&CaptureConstraints::screen(), self.events_tx.clone())
            .await
            .map_err(|e| {
                log::warn!("Screen capture failed: {}", e);
                e
            })?;

        let Some(call) = self.phase.live_call() else {
            screen.stop();
            return Err(self.invalid("start screen share"));
        };

        let attached = match call.link.video_sender().await {
            Some(sender) => call.link.replace_track(sender, screen.clone()).await,
            None => call.link.add_track(screen.clone()).await.map(|_| ()),
        };

        if let Err(e) = attached {
            screen.stop();
            return Err(e);
        }

        call.screen = Some(screen);
        call.preview = true;
        log::info!("Screen sharing started");
        Ok(())
    }

    pub async fn stop_screen_share(&mut self) -> Result<()> {
        let Some(call) = self.phase.live_call() else {
            return Err(self.invalid("stop screen share"));
        };

        let Some(screen) = call.screen.take() else {
            return Ok(());
        };
        screen.stop();
        call.preview = false;

        if let Some(sender) = call.link.video_sender().await {
            call.link.remove_track(sender).await?;
        }
        log::info!("Screen sharing stopped");
        Ok(())
    }

    /// Mutes or unmutes the microphone without renegotiation. Returns the
    /// new enabled flag.
    pub fn toggle_audio(&mut self) -> Result<bool> {
        let Some(call) = self.phase.live_call() else {
            return Err(self.invalid("toggle audio"));
        };
        let enabled = !call.audio.is_enabled();
        call.audio.set_enabled(enabled);
        Ok(enabled)
    }

    /// Stops every local track and closes the peer link. Safe to call in
    /// any phase.
    pub async fn end(&mut self) {
        let phase = std::mem::replace(&mut self.phase, Phase::Ended);
        let call = match phase {
            Phase::Connecting(call) | Phase::Connected(call) => Some(call),
            Phase::Failed { call, .. } => call,
            Phase::Idle | Phase::Ended => None,
        };

        if let Some(mut call) = call {
            call.stop_tracks();
            if let Err(e) = call.link.close().await {
                log::warn!("Closing peer link failed: {}", e);
            }
            log::info!("Media session ended for {}", self.participant);
        }
    }

    pub fn elapsed(&self, now: &DateTime<FixedOffset>) -> Duration {
        self.started_at
            .map(|start| (*now - start).max(Duration::zero()))
            .unwrap_or_else(Duration::zero)
    }

    /// Call duration as `MM:SS`.
    pub fn elapsed_label(&self, now: &DateTime<FixedOffset>) -> String {
        let secs = self.elapsed(now).num_seconds();
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }

    /// Whole minutes left of the booked duration, never negative.
    pub fn remaining_minutes(&self, now: &DateTime<FixedOffset>) -> i64 {
        (i64::from(self.meeting_duration) - self.elapsed(now).num_minutes()).max(0)
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        let phase = std::mem::replace(&mut self.phase, Phase::Ended);
        let call = match phase {
            Phase::Connecting(call) | Phase::Connected(call) => Some(call),
            Phase::Failed { call, .. } => call,
            Phase::Idle | Phase::Ended => None,
        };

        if let Some(mut call) = call {
            call.stop_tracks();
            let link = call.link;
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = link.close().await {
                            log::warn!("Closing peer link on teardown failed: {}", e);
                        }
                    });
                }
                Err(_) => log::warn!("No runtime to close peer link for {}", self.participant),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    pub struct FakeTrack {
        id: String,
        kind: TrackKind,
        enabled: AtomicBool,
        stopped: AtomicBool,
    }

    impl FakeTrack {
        pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                kind,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            })
        }
    }

    impl LocalTrack for FakeTrack {
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
    }

    #[derive(Default)]
    pub struct FakeDevices {
        pub deny_audio: bool,
        /// Microphone missing rather than refused
        pub no_audio_device: bool,
        pub deny_display: bool,
        pub audio: Mutex<Vec<Arc<FakeTrack>>>,
        pub screens: Mutex<Vec<Arc<FakeTrack>>>,
        pub constraints: Mutex<Vec<CaptureConstraints>>,
    }

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn user_media(&self, constraints: &CaptureConstraints) -> Result<Arc<dyn LocalTrack>> {
            self.constraints.lock().push(*constraints);
            if self.deny_audio {
                return Err(Error::PermissionDenied("microphone".into()));
            }
            if self.no_audio_device {
                return Err(Error::Media("no microphone found".into()));
            }
            let track = FakeTrack::new(&format!("mic-{}", self.audio.lock().len()), TrackKind::Audio);
            self.audio.lock().push(track.clone());
            Ok(track)
        }

        async fn display_media(
            &self,
            constraints: &CaptureConstraints,
            _events: EventSender,
        ) -> Result<Arc<dyn LocalTrack>> {
            self.constraints.lock().push(*constraints);
            if self.deny_display {
                return Err(Error::PermissionDenied("screen".into()));
            }
            let track = FakeTrack::new(&format!("screen-{}", self.screens.lock().len()), TrackKind::Video);
            self.screens.lock().push(track.clone());
            Ok(track)
        }
    }

    #[derive(Default)]
    pub struct LinkState {
        pub senders: Mutex<Vec<Option<Arc<dyn LocalTrack>>>>,
        pub replaced: Mutex<usize>,
        pub closed: AtomicBool,
    }

    struct FakeLink(Arc<LinkState>);

    #[async_trait]
    impl PeerLink for FakeLink {
        async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<SenderId> {
            let mut senders = self.0.senders.lock();
            senders.push(Some(track));
            Ok(SenderId(senders.len() - 1))
        }

        async fn video_sender(&self) -> Option<SenderId> {
            self.0
                .senders
                .lock()
                .iter()
                .position(|s| matches!(s, Some(t) if t.kind() == TrackKind::Video))
                .map(SenderId)
        }

        async fn replace_track(&self, sender: SenderId, track: Arc<dyn LocalTrack>) -> Result<()> {
            let mut senders = self.0.senders.lock();
            let slot = senders
                .get_mut(sender.0)
                .ok_or_else(|| Error::Media("no such sender".into()))?;
            *slot = Some(track);
            *self.0.replaced.lock() += 1;
            Ok(())
        }

        async fn remove_track(&self, sender: SenderId) -> Result<()> {
            if let Some(slot) = self.0.senders.lock().get_mut(sender.0) {
                *slot = None;
            }
            Ok(())
        }

        async fn outbound(&self) -> Vec<TrackKind> {
            self.0.senders.lock().iter().flatten().map(|t| t.kind()).collect()
        }

        async fn close(&self) -> Result<()> {
            self.0.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeConnector {
        pub fail: bool,
        pub link: Arc<LinkState>,
        pub ice_servers: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn connect(&self, ice_servers: &[String], _events: EventSender) -> Result<Box<dyn PeerLink>> {
            *self.ice_servers.lock() = ice_servers.to_vec();
            if self.fail {
                return Err(Error::Media("ice configuration rejected".into()));
            }
            Ok(Box::new(FakeLink(self.link.clone())))
        }
    }

    impl LinkState {
        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn sender_count(&self) -> usize {
            self.senders.lock().len()
        }
    }
}
