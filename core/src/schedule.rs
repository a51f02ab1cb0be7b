//! Pair scheduling state
//!
//! `PeerSchedule` is the client's read replica of the server state between
//! the logged-in user and one peer: at most one pending request and the next
//! live meeting. Every mutation re-fetches both afterwards, whether it
//! succeeded or not, instead of patching the replica locally.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use tokio::sync::watch;

use crate::clock::Clock;
use crate::datetime::{DateInput, LOCAL_DATETIME_FORMAT};
use crate::error::{Error, Result};
use crate::meeting::{live_meetings, Countdown};
use crate::models::{Meeting, MeetingStatus, NewSessionRequest, SessionRequest, TimeSlot};
use crate::network::SessionApi;
use crate::poll::{spawn_every, TaskGuard};
use crate::slots::SlotWindow;

#[derive(Debug, Clone, Default)]
pub struct PairSnapshot {
    pub pending: Option<SessionRequest>,
    pub meeting: Option<Meeting>,
    pub refreshed_at: Option<DateTime<FixedOffset>>,
}

/// Pending request as seen by one side of the pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingView {
    None,
    /// Waiting for the peer to answer.
    Sent { id: i64, scheduled: String, duration: u32 },
    /// The peer asked; the viewer may accept or reject.
    Received { id: i64, scheduled: String, duration: u32 },
}

impl PairSnapshot {
    pub fn pending_view(&self, me: &str, zone: &FixedOffset) -> PendingView {
        let Some(req) = &self.pending else {
            return PendingView::None;
        };
        let scheduled = req
            .scheduled_at(zone)
            .map(|at| at.format(LOCAL_DATETIME_FORMAT).to_string())
            .unwrap_or_default();

        if req.sender_email.eq_ignore_ascii_case(me) {
            PendingView::Sent {
                id: req.id,
                scheduled,
                duration: req.duration,
            }
        } else {
            PendingView::Received {
                id: req.id,
                scheduled,
                duration: req.duration,
            }
        }
    }

    /// A new request is allowed only when nothing is pending or booked.
    pub fn can_schedule(&self) -> bool {
        self.pending.is_none() && self.meeting.is_none()
    }
}

pub struct PeerSchedule<A: SessionApi, C: Clock> {
    api: Arc<A>,
    clock: Arc<C>,
    me: String,
    peer: String,
    window: SlotWindow,
    state: watch::Sender<PairSnapshot>,
}

impl<A, C> PeerSchedule<A, C>
where
    A: SessionApi + 'static,
    C: Clock + 'static,
{
    pub fn new(api: Arc<A>, clock: Arc<C>, me: &str, peer: &str, window: SlotWindow) -> Self {
        let (state, _) = watch::channel(PairSnapshot::default());
        Self {
            api,
            clock,
            me: me.to_string(),
            peer: peer.to_string(),
            window,
            state,
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn snapshot(&self) -> PairSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PairSnapshot> {
        self.state.subscribe()
    }

    pub fn can_schedule(&self) -> bool {
        self.state.borrow().can_schedule()
    }

    pub fn pending_view(&self) -> PendingView {
        self.state.borrow().pending_view(&self.me, &self.clock.zone())
    }

    pub fn slots(&self) -> Vec<TimeSlot> {
        self.window.generate(&self.clock.now())
    }

    /// Re-reads the pending request and the next live meeting.
    ///
    /// On failure the previous snapshot is kept.
    pub async fn refresh(&self) -> Result<PairSnapshot> {
        let now = self.clock.now();
        let pending = self
            .api
            .latest_request(&self.peer)
            .await?
            .filter(SessionRequest::is_pending);
        let meeting = live_meetings(self.api.meetings_with(&self.peer).await?, &now)
            .into_iter()
            .next();

        let snapshot = PairSnapshot {
            pending,
            meeting,
            refreshed_at: Some(now),
        };
        self.state.send_replace(snapshot.clone());
        Ok(snapshot)
    }

    async fn refresh_quietly(&self) {
        if let Err(e) = self.refresh().await {
            log::warn!("Refreshing schedule with {} failed: {}", self.peer, e);
        }
    }

    /// Sends a request for `slot`. Nothing reaches the network unless a slot
    /// is chosen, the duration is positive and the slot is in the future.
    pub async fn request(&self, slot: Option<&TimeSlot>, duration: u32) -> Result<SessionRequest> {
        let slot = slot.ok_or_else(|| Error::Validation("Please select a date and time".into()))?;
        if duration == 0 {
            return Err(Error::Validation("Duration must be at least one minute".into()));
        }

        let now = self.clock.now();
        let at = slot
            .resolve(&self.clock.zone())
            .ok_or_else(|| Error::Validation(format!("Invalid slot {} {}", slot.date, slot.time)))?;
        if at <= now {
            return Err(Error::PastTime {
                requested: at.format(LOCAL_DATETIME_FORMAT).to_string(),
                now: now.format(LOCAL_DATETIME_FORMAT).to_string(),
            });
        }

        let body = NewSessionRequest {
            receiver_email: self.peer.clone(),
            scheduled_date_time: DateInput::from_instant(&at),
            duration,
        };
        let result = self.api.create_request(&body).await;
        self.refresh_quietly().await;

        let created = result?;
        log::info!("Requested session {} with {} at {}", created.id, self.peer, slot.date);
        Ok(created)
    }

    fn answerable(&self) -> Result<SessionRequest> {
        let pending = self
            .state
            .borrow()
            .pending
            .clone()
            .ok_or(Error::NoPendingRequest)?;
        if !pending.receiver_email.eq_ignore_ascii_case(&self.me) {
            return Err(Error::NotReceiver(pending.id));
        }
        Ok(pending)
    }

    pub async fn accept(&self) -> Result<Meeting> {
        let pending = self.answerable()?;
        let result = self.api.accept_request(pending.id).await;
        self.refresh_quietly().await;
        result
    }

    pub async fn reject(&self) -> Result<()> {
        let pending = self.answerable()?;
        let result = self.api.reject_request(pending.id).await;
        if result.is_ok() {
            self.state.send_modify(|s| s.pending = None);
        }
        self.refresh_quietly().await;
        result
    }

    /// Deletes the current meeting. Failures are logged, not returned.
    pub async fn delete_meeting(&self) {
        let Some(meeting) = self.state.borrow().meeting.clone() else {
            return;
        };
        if let Err(e) = self.api.delete_meeting(meeting.id).await {
            log::warn!("Deleting meeting {} failed: {}", meeting.id, e);
        }
        self.refresh_quietly().await;
    }

    /// Refreshes every `period` until the guard is dropped.
    pub fn spawn_refresh(self: &Arc<Self>, period: Duration) -> TaskGuard {
        let schedule = Arc::clone(self);
        spawn_every(period, move || {
            let schedule = Arc::clone(&schedule);
            async move { schedule.refresh_quietly().await }
        })
    }
}

// ============================================================================
// Meeting Board
// ============================================================================

/// One row of the meetings dashboard.
#[derive(Debug, Clone)]
pub struct BoardEntry {
    pub meeting: Meeting,
    pub with: String,
    pub status: MeetingStatus,
    pub countdown: Option<Countdown>,
}

/// Every live meeting of the logged-in user, across all peers.
pub struct MeetingBoard<A: SessionApi, C: Clock> {
    api: Arc<A>,
    clock: Arc<C>,
    me: String,
    state: watch::Sender<Vec<Meeting>>,
}

impl<A, C> MeetingBoard<A, C>
where
    A: SessionApi + 'static,
    C: Clock + 'static,
{
    pub fn new(api: Arc<A>, clock: Arc<C>, me: &str) -> Self {
        let (state, _) = watch::channel(Vec::new());
        Self {
            api,
            clock,
            me: me.to_string(),
            state,
        }
    }

    pub async fn refresh(&self) -> Result<Vec<Meeting>> {
        let live = live_meetings(self.api.meetings().await?, &self.clock.now());
        self.state.send_replace(live.clone());
        Ok(live)
    }

    pub fn meetings(&self) -> Vec<Meeting> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Meeting>> {
        self.state.subscribe()
    }

    pub fn entries(&self) -> Vec<BoardEntry> {
        let now = self.clock.now();
        self.state
            .borrow()
            .iter()
            .filter_map(|m| {
                Some(BoardEntry {
                    status: m.status(&now)?,
                    countdown: m.countdown(&now),
                    with: m.other_participant(&self.me).unwrap_or_default().to_string(),
                    meeting: m.clone(),
                })
            })
            .collect()
    }

    /// Deletes a meeting and re-reads the board. A failed delete (the
    /// meeting already gone, say) is logged; only the refresh can fail.
    pub async fn delete(&self, meeting_id: i64) -> Result<()> {
        if let Err(e) = self.api.delete_meeting(meeting_id).await {
            log::warn!("Deleting meeting {} failed: {}", meeting_id, e);
        }
        self.refresh().await.map(|_| ())
    }

    pub fn spawn_refresh(self: &Arc<Self>, period: Duration) -> TaskGuard {
        let board = Arc::clone(self);
        spawn_every(period, move || {
            let board = Arc::clone(&board);
            async move {
                if let Err(e) = board.refresh().await {
                    log::warn!("Refreshing meetings failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::models::RequestStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ANN: &str = "ann@x.io";
    const BOB: &str = "bob@x.io";

    /// In-memory server holding one pair's requests and meetings.
    struct MockApi {
        me: String,
        requests: Mutex<Vec<SessionRequest>>,
        meetings: Mutex<Vec<Meeting>>,
        calls: AtomicUsize,
        fail_reads: Mutex<bool>,
    }

    impl MockApi {
        fn new(me: &str) -> Arc<Self> {
            Arc::new(Self {
                me: me.to_string(),
                requests: Mutex::new(Vec::new()),
                meetings: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                fail_reads: Mutex::new(false),
            })
        }

        fn seed_request(&self, from: &str, to: &str, at: &str) -> i64 {
            let mut requests = self.requests.lock();
            let id = requests.len() as i64 + 1;
            requests.push(SessionRequest {
                id,
                sender_email: from.into(),
                receiver_email: to.into(),
                scheduled_date_time: DateInput::IsoString(at.into()),
                duration: 30,
                status: RequestStatus::Pending,
            });
            id
        }

        fn seed_meeting(&self, at: &str, duration: u32) {
            let mut meetings = self.meetings.lock();
            let id = meetings.len() as i64 + 100;
            meetings.push(Meeting {
                id,
                participants: vec![ANN.into(), BOB.into()],
                scheduled_date_time: DateInput::IsoString(at.into()),
                duration,
                title: None,
            });
        }

        fn remote(status: u16, message: &str) -> Error {
            Error::Remote {
                status,
                message: message.into(),
            }
        }

        fn read_guard(&self) -> Result<()> {
            if *self.fail_reads.lock() {
                return Err(Self::remote(503, "unavailable"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SessionApi for MockApi {
        async fn create_request(&self, request: &NewSessionRequest) -> Result<SessionRequest> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.requests.lock().iter().any(|r| r.is_pending()) {
                return Err(Self::remote(409, "A pending request already exists"));
            }
            let mut requests = self.requests.lock();
            let created = SessionRequest {
                id: requests.len() as i64 + 1,
                sender_email: self.me.clone(),
                receiver_email: request.receiver_email.clone(),
                scheduled_date_time: request.scheduled_date_time.clone(),
                duration: request.duration,
                status: RequestStatus::Pending,
            };
            requests.push(created.clone());
            Ok(created)
        }

        async fn latest_request(&self, _peer: &str) -> Result<Option<SessionRequest>> {
            self.read_guard()?;
            Ok(self.requests.lock().iter().rev().find(|r| r.is_pending()).cloned())
        }

        async fn accept_request(&self, request_id: i64) -> Result<Meeting> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut requests = self.requests.lock();
            let req = requests
                .iter_mut()
                .find(|r| r.id == request_id)
                .ok_or_else(|| Self::remote(404, "Request not found"))?;
            if !req.is_pending() {
                return Err(Self::remote(409, "Request is no longer pending"));
            }
            req.status = RequestStatus::Accepted;
            let meeting = Meeting {
                id: 100 + request_id,
                participants: vec![req.sender_email.clone(), req.receiver_email.clone()],
                scheduled_date_time: req.scheduled_date_time.clone(),
                duration: req.duration,
                title: None,
            };
            self.meetings.lock().push(meeting.clone());
            Ok(meeting)
        }

        async fn reject_request(&self, request_id: i64) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut requests = self.requests.lock();
            let req = requests
                .iter_mut()
                .find(|r| r.id == request_id && r.is_pending())
                .ok_or_else(|| Self::remote(409, "Request is no longer pending"))?;
            req.status = RequestStatus::Rejected;
            Ok(())
        }

        async fn meetings_with(&self, _peer: &str) -> Result<Vec<Meeting>> {
            self.read_guard()?;
            Ok(self.meetings.lock().clone())
        }

        async fn meetings(&self) -> Result<Vec<Meeting>> {
            self.read_guard()?;
            Ok(self.meetings.lock().clone())
        }

        async fn delete_meeting(&self, meeting_id: i64) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut meetings = self.meetings.lock();
            let before = meetings.len();
            meetings.retain(|m| m.id != meeting_id);
            if meetings.len() == before {
                return Err(Self::remote(404, "Meeting not found"));
            }
            Ok(())
        }
    }

    fn setup(me: &str, peer: &str) -> (Arc<MockApi>, Arc<FixedClock>, PeerSchedule<MockApi, FixedClock>) {
        let clock = Arc::new(FixedClock::at(2025, 3, 14, 9, 0));
        let api = MockApi::new(me);
        let schedule = PeerSchedule::new(api.clone(), clock.clone(), me, peer, SlotWindow::default());
        (api, clock, schedule)
    }

    #[tokio::test]
    async fn test_past_slot_is_refused_locally() {
        let (api, _clock, schedule) = setup(ANN, BOB);
        let slot = TimeSlot::parse("2025-03-14", "08:00").unwrap();

        let err = schedule.request(Some(&slot), 30).await.unwrap_err();
        assert!(matches!(err, Error::PastTime { .. }));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);

        let current_hour = TimeSlot::parse("2025-03-14", "09:00").unwrap();
        assert!(matches!(
            schedule.request(Some(&current_hour), 30).await,
            Err(Error::PastTime { .. })
        ));
    }

    #[tokio::test]
    async fn test_validation_precedes_network() {
        let (api, _clock, schedule) = setup(ANN, BOB);
        let slot = TimeSlot::parse("2025-03-15", "10:00").unwrap();

        assert!(matches!(schedule.request(None, 30).await, Err(Error::Validation(_))));
        assert!(matches!(schedule.request(Some(&slot), 0).await, Err(Error::Validation(_))));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_then_refresh_shows_sent() {
        let (api, _clock, schedule) = setup(ANN, BOB);
        let slot = schedule.slots().into_iter().find(|s| s.date == "2025-03-15").unwrap();

        let created = schedule.request(Some(&slot), 45).await.unwrap();
        assert_eq!(created.sender_email, ANN);
        assert_eq!(
            created.scheduled_date_time,
            DateInput::IsoString("2025-03-15T08:00:00".into())
        );

        assert!(!schedule.can_schedule());
        assert!(matches!(schedule.pending_view(), PendingView::Sent { duration: 45, .. }));

        // the sender cannot answer its own request
        assert!(matches!(schedule.accept().await, Err(Error::NotReceiver(_))));
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conflicting_request_still_refreshes() {
        let (api, _clock, schedule) = setup(ANN, BOB);
        api.seed_request(BOB, ANN, "2025-03-15T10:00:00");
        let slot = TimeSlot::parse("2025-03-16", "10:00").unwrap();

        let err = schedule.request(Some(&slot), 30).await.unwrap_err();
        assert!(matches!(err, Error::Remote { status: 409, .. }));
        assert!(matches!(schedule.pending_view(), PendingView::Received { .. }));
    }

    #[tokio::test]
    async fn test_accept_creates_exactly_one_meeting() {
        let (api, _clock, schedule) = setup(ANN, BOB);
        api.seed_request(BOB, ANN, "2025-03-14T10:00:00");
        schedule.refresh().await.unwrap();

        let meeting = schedule.accept().await.unwrap();
        assert!(meeting.involves(BOB));

        let snapshot = schedule.snapshot();
        assert!(snapshot.pending.is_none());
        assert_eq!(snapshot.meeting.map(|m| m.id), Some(meeting.id));

        // a second accept has nothing to act on
        assert!(matches!(schedule.accept().await, Err(Error::NoPendingRequest)));
        assert_eq!(api.meetings.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_reject_clears_pending() {
        let (api, _clock, schedule) = setup(ANN, BOB);
        api.seed_request(BOB, ANN, "2025-03-14T10:00:00");
        schedule.refresh().await.unwrap();

        schedule.reject().await.unwrap();
        assert_eq!(schedule.pending_view(), PendingView::None);
        assert!(schedule.can_schedule());
        assert!(api.meetings.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stale_accept_surfaces_error_and_refreshes() {
        let (api, _clock, schedule) = setup(ANN, BOB);
        let id = api.seed_request(BOB, ANN, "2025-03-14T10:00:00");
        schedule.refresh().await.unwrap();

        // answered elsewhere before we act
        api.requests.lock()[(id - 1) as usize].status = RequestStatus::Rejected;

        assert!(matches!(
            schedule.accept().await,
            Err(Error::Remote { status: 409, .. })
        ));
        assert!(schedule.snapshot().pending.is_none());
    }

    #[tokio::test]
    async fn test_expired_meeting_is_not_shown() {
        let (api, clock, schedule) = setup(ANN, BOB);
        api.seed_meeting("2025-03-14T09:30:00", 30);

        schedule.refresh().await.unwrap();
        assert!(schedule.snapshot().meeting.is_some());

        clock.advance(chrono::Duration::minutes(61));
        schedule.refresh().await.unwrap();
        assert!(schedule.snapshot().meeting.is_none());
        assert!(schedule.can_schedule());
    }

    #[tokio::test]
    async fn test_delete_twice_is_silent() {
        let (api, _clock, schedule) = setup(ANN, BOB);
        api.seed_meeting("2025-03-14T10:00:00", 30);
        schedule.refresh().await.unwrap();

        schedule.delete_meeting().await;
        assert!(schedule.snapshot().meeting.is_none());
        schedule.delete_meeting().await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_snapshot() {
        let (api, _clock, schedule) = setup(ANN, BOB);
        api.seed_meeting("2025-03-14T10:00:00", 30);
        schedule.refresh().await.unwrap();

        *api.fail_reads.lock() = true;
        assert!(schedule.refresh().await.is_err());
        assert!(schedule.snapshot().meeting.is_some());
    }

    #[tokio::test]
    async fn test_subscribers_see_refresh() {
        let (api, _clock, schedule) = setup(ANN, BOB);
        let mut rx = schedule.subscribe();
        api.seed_request(BOB, ANN, "2025-03-14T10:00:00");

        schedule.refresh().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().pending.is_some());
    }

    #[tokio::test]
    async fn test_board_lists_and_deletes() {
        let clock = Arc::new(FixedClock::at(2025, 3, 14, 9, 0));
        let api = MockApi::new(ANN);
        api.seed_meeting("2025-03-16T10:00:00", 30);
        api.seed_meeting("2025-03-14T09:00:00", 60);
        api.seed_meeting("2025-03-13T09:00:00", 60);
        let board = MeetingBoard::new(api.clone(), clock.clone(), ANN);

        let live = board.refresh().await.unwrap();
        assert_eq!(live.len(), 2);

        let entries = board.entries();
        assert_eq!(entries[0].status, MeetingStatus::Active);
        assert_eq!(entries[0].with, BOB);
        assert_eq!(entries[0].countdown, Some(Countdown::EndsIn(60)));
        assert_eq!(entries[1].status, MeetingStatus::Future);

        board.delete(entries[1].meeting.id).await.unwrap();
        assert_eq!(board.meetings().len(), 1);
        // Already gone on the server, still a quiet success
        board.delete(entries[1].meeting.id).await.unwrap();
        assert_eq!(board.meetings().len(), 1);
    }
}
