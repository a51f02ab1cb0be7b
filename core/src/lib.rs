//! SkillSwap Core Library
//!
//! Client side of scheduled peer screen-share sessions: reservation slots,
//! session requests, meetings and the media session of a call.

pub mod clock;
pub mod datetime;
pub mod error;
pub mod media;
pub mod meeting;
pub mod models;
pub mod network;
pub mod poll;
pub mod rtc;
pub mod schedule;
pub mod slots;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use clock::{Clock, FixedClock, SystemClock};
pub use datetime::DateInput;
pub use error::{Error, Result};
pub use media::{ActiveCalls, MediaDevices, MediaSession, PeerConnector, SessionState};
pub use meeting::Countdown;
pub use models::*;
pub use network::{ApiClient, SessionApi};
pub use poll::{SlotFeed, TaskGuard};
pub use schedule::{MeetingBoard, PairSnapshot, PeerSchedule, PendingView};
pub use slots::SlotWindow;

pub const DEFAULT_API_PREFIX: &str = "/api/video-call";

fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub use_tls: bool,
    pub api_prefix: String,
    pub utc_offset_minutes: i32,
    pub slots: SlotWindow,
    pub slot_refresh_secs: u64,
    pub state_refresh_secs: u64,
    pub ice_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "localhost".to_string(),
            server_port: 9443,
            use_tls: false,
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            utc_offset_minutes: clock::DEFAULT_UTC_OFFSET_MINUTES,
            slots: SlotWindow::default(),
            slot_refresh_secs: 60,
            state_refresh_secs: 5,
            ice_servers: default_ice_servers(),
        }
    }
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server_host: host.to_string(),
            server_port: port,
            use_tls,
            ..Default::default()
        }
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server_host, self.server_port)
    }

    pub fn clock(&self) -> SystemClock {
        SystemClock::new(self.utc_offset_minutes)
    }

    pub fn slot_refresh(&self) -> Duration {
        Duration::from_secs(self.slot_refresh_secs.max(1))
    }

    pub fn state_refresh(&self) -> Duration {
        Duration::from_secs(self.state_refresh_secs.max(1))
    }
}

/// Main client instance
pub struct SkillSwapClient {
    config: ClientConfig,
    api: Arc<ApiClient>,
    clock: Arc<SystemClock>,
    calls: ActiveCalls,
    identity: RwLock<Option<String>>,
}

impl SkillSwapClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let api = Arc::new(ApiClient::new(&config)?);
        let clock = Arc::new(config.clock());

        Ok(Self {
            config,
            api,
            clock,
            calls: ActiveCalls::new(),
            identity: RwLock::new(None),
        })
    }

    /// Resumes a saved login without contacting the server.
    pub fn restore(&self, session: &AuthSession) {
        self.api.set_token(&session.token);
        *self.identity.write() = Some(session.email.clone());
    }

    pub async fn login(&self, email: &str, access_key: &str) -> Result<AuthSession> {
        let session = self.api.login(email, access_key).await?;
        *self.identity.write() = Some(session.email.clone());
        Ok(session)
    }

    pub fn logout(&self) {
        self.api.clear_token();
        *self.identity.write() = None;
    }

    pub fn current_user(&self) -> Result<String> {
        self.identity.read().clone().ok_or(Error::NotLoggedIn)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn clock(&self) -> &Arc<SystemClock> {
        &self.clock
    }

    pub async fn check_health(&self) -> Result<bool> {
        self.api.check_health().await
    }

    pub fn slots(&self) -> Vec<TimeSlot> {
        self.config.slots.generate(&self.clock.now())
    }

    /// Slots regenerated every `slot_refresh_secs`.
    pub fn slot_feed(&self) -> SlotFeed {
        SlotFeed::spawn(self.config.slots, self.clock.clone(), self.config.slot_refresh())
    }

    pub fn peer(&self, peer_email: &str) -> Result<PeerSchedule<ApiClient, SystemClock>> {
        let me = self.current_user()?;
        if me.eq_ignore_ascii_case(peer_email) {
            return Err(Error::Validation("Cannot schedule a session with yourself".into()));
        }
        Ok(PeerSchedule::new(
            self.api.clone(),
            self.clock.clone(),
            &me,
            peer_email,
            self.config.slots,
        ))
    }

    pub fn board(&self) -> Result<MeetingBoard<ApiClient, SystemClock>> {
        let me = self.current_user()?;
        Ok(MeetingBoard::new(self.api.clone(), self.clock.clone(), &me))
    }

    /// Media session for `meeting`, which must be under way. Only one may
    /// exist per user at a time.
    pub fn media_session(
        &self,
        meeting: &Meeting,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<MediaSession> {
        let me = self.current_user()?;
        if !meeting.involves(&me) {
            return Err(Error::Validation(format!("Meeting {} does not include {}", meeting.id, me)));
        }
        let now = self.clock.now();
        if !meeting.is_joinable(&now) {
            let when = match meeting.status(&now) {
                Some(MeetingStatus::Future) => "has not started yet",
                Some(MeetingStatus::Expired) => "has already ended",
                _ => "has no readable start time",
            };
            return Err(Error::Validation(format!("Meeting {} {}", meeting.id, when)));
        }
        MediaSession::new(
            &self.calls,
            &me,
            meeting.duration,
            self.config.ice_servers.clone(),
            devices,
            connector,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"server_host":"example.org","use_tls":true}"#).unwrap();

        assert_eq!(config.http_url(), "https://example.org:9443");
        assert_eq!(config.api_prefix, "/api/video-call");
        assert_eq!(config.utc_offset_minutes, 330);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.state_refresh(), Duration::from_secs(5));
        assert_eq!(config.slot_refresh(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_client_requires_login() {
        let client = SkillSwapClient::new(ClientConfig::default()).unwrap();
        assert!(matches!(client.peer("bob@x.io"), Err(Error::NotLoggedIn)));
        assert!(matches!(client.board(), Err(Error::NotLoggedIn)));

        client.restore(&AuthSession {
            token: "t".into(),
            email: "ann@x.io".into(),
            expires_at: 0,
        });
        assert!(client.peer("bob@x.io").is_ok());
        assert!(matches!(client.peer("ANN@x.io"), Err(Error::Validation(_))));

        client.logout();
        assert!(client.current_user().is_err());
    }

    fn meeting_at(start: &chrono::DateTime<chrono::FixedOffset>, duration: u32) -> Meeting {
        Meeting {
            id: 7,
            participants: vec!["ann@x.io".into(), "bob@x.io".into()],
            scheduled_date_time: DateInput::from_instant(start),
            duration,
            title: None,
        }
    }

    fn logged_in_client() -> SkillSwapClient {
        let client = SkillSwapClient::new(ClientConfig::default()).unwrap();
        client.restore(&AuthSession {
            token: "t".into(),
            email: "ann@x.io".into(),
            expires_at: 0,
        });
        client
    }

    #[tokio::test]
    async fn test_media_session_only_while_meeting_runs() {
        use media::testing::{FakeConnector, FakeDevices};

        let client = logged_in_client();
        let now = client.clock().now();
        let devices: Arc<dyn MediaDevices> = Arc::new(FakeDevices::default());
        let connector: Arc<dyn PeerConnector> = Arc::new(FakeConnector::default());

        let upcoming = meeting_at(&(now + chrono::Duration::hours(1)), 30);
        let err = client
            .media_session(&upcoming, devices.clone(), connector.clone())
            .err().unwrap();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("not started")));

        let finished = meeting_at(&(now - chrono::Duration::hours(2)), 30);
        let err = client
            .media_session(&finished, devices.clone(), connector.clone())
            .err().unwrap();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("ended")));

        // Neither refusal holds the per-user slot
        let running = meeting_at(&(now - chrono::Duration::minutes(1)), 30);
        assert!(client.media_session(&running, devices, connector).is_ok());
    }

    #[tokio::test]
    async fn test_media_session_is_exclusive() {
        use media::testing::{FakeConnector, FakeDevices};

        let client = logged_in_client();
        let started = client.clock().now() - chrono::Duration::minutes(5);
        let meeting = meeting_at(&started, 30);
        let devices: Arc<dyn MediaDevices> = Arc::new(FakeDevices::default());
        let connector: Arc<dyn PeerConnector> = Arc::new(FakeConnector::default());

        let first = client
            .media_session(&meeting, devices.clone(), connector.clone())
            .unwrap();
        assert!(matches!(
            client.media_session(&meeting, devices.clone(), connector.clone()),
            Err(Error::SessionAlreadyActive(_))
        ));
        drop(first);
        assert!(client.media_session(&meeting, devices, connector).is_ok());
    }
}
