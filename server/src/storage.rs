//! Database storage layer for SkillSwap Server

use chrono::Duration;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::path::Path;
use std::str::FromStr;

use crate::crypto;
use crate::models::*;
use skillswap_core::RequestStatus;

const REQUEST_COLUMNS: &str =
    "id, sender_email, receiver_email, scheduled_at, duration, status, created_at";
const MEETING_COLUMNS: &str =
    "id, request_id, participant_a, participant_b, scheduled_at, duration, created_at";

pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_path: &str) -> anyhow::Result<Self> {
        // Ensure directory exists
        if let Some(parent) = Path::new(database_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", database_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Private database living as long as the pool. A single connection
    /// keeps every query on the same in-memory database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                email TEXT PRIMARY KEY,
                key_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS auth_sessions (
                token_hash TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                is_valid INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (email) REFERENCES users(email) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS session_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_email TEXT NOT NULL,
                receiver_email TEXT NOT NULL,
                scheduled_at INTEGER NOT NULL,
                duration INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meetings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id INTEGER NOT NULL UNIQUE,
                participant_a TEXT NOT NULL,
                participant_b TEXT NOT NULL,
                scheduled_at INTEGER NOT NULL,
                duration INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (request_id) REFERENCES session_requests(id)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_email ON auth_sessions(email);
            CREATE INDEX IF NOT EXISTS idx_requests_pair ON session_requests(sender_email, receiver_email);
            CREATE INDEX IF NOT EXISTS idx_requests_status ON session_requests(status);
            CREATE INDEX IF NOT EXISTS idx_meetings_a ON meetings(participant_a);
            CREATE INDEX IF NOT EXISTS idx_meetings_b ON meetings(participant_b);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // User Operations
    // ========================================================================

    pub async fn create_user(&self, email: &str, key_hash: &str, now: i64) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO users (email, key_hash, created_at, is_active) VALUES (?, ?, ?, 1)")
            .bind(email)
            .bind(key_hash)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Replaces the access key of an existing user and reactivates it.
    pub async fn rotate_user_key(&self, email: &str, key_hash: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE users SET key_hash = ?, is_active = 1 WHERE email = ?")
            .bind(key_hash)
            .bind(email)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_user(&self, email: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT email, key_hash, created_at, is_active FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn verify_user_credentials(&self, email: &str, access_key: &str) -> anyhow::Result<bool> {
        let user = self.get_user(email).await?;

        match user {
            Some(u) if u.is_active => Ok(crypto::verify_secret(access_key, &u.key_hash)),
            _ => Ok(false),
        }
    }

    pub async fn deactivate_user(&self, email: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE users SET is_active = 0 WHERE email = ?")
            .bind(email)
            .execute(&self.pool)
            .await?;

        // Invalidate all sessions
        sqlx::query("UPDATE auth_sessions SET is_valid = 0 WHERE email = ?")
            .bind(email)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_users(&self) -> anyhow::Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            "SELECT email, key_hash, created_at, is_active FROM users ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    // ========================================================================
    // Auth Session Operations
    // ========================================================================

    pub async fn create_session(
        &self,
        email: &str,
        token: &str,
        ttl_hours: i64,
        now: i64,
    ) -> anyhow::Result<i64> {
        let token_hash = crypto::hash_secret(token);
        let expires_at = now + Duration::hours(ttl_hours).num_seconds();

        sqlx::query(
            "INSERT INTO auth_sessions (token_hash, email, expires_at, is_valid) VALUES (?, ?, ?, 1)",
        )
        .bind(&token_hash)
        .bind(email)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(expires_at)
    }

    /// Email of the session owner, when the token is valid at `now`.
    pub async fn validate_session(&self, token: &str, now: i64) -> anyhow::Result<Option<String>> {
        let token_hash = crypto::hash_secret(token);

        let email: Option<(String,)> = sqlx::query_as(
            "SELECT s.email FROM auth_sessions s
             JOIN users u ON u.email = s.email
             WHERE s.token_hash = ? AND s.is_valid = 1 AND s.expires_at > ? AND u.is_active = 1",
        )
        .bind(&token_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(email.map(|(e,)| e))
    }

    // ========================================================================
    // Session Request Operations
    // ========================================================================

    /// Inserts a pending request unless the pair already has an open
    /// pending request or a live meeting at `now`. The check and the insert
    /// are one statement, so concurrent callers cannot both succeed.
    pub async fn create_request(
        &self,
        sender: &str,
        receiver: &str,
        scheduled_at: i64,
        duration: i64,
        now: i64,
    ) -> anyhow::Result<Option<RequestRow>> {
        let result = sqlx::query(
            "INSERT INTO session_requests (sender_email, receiver_email, scheduled_at, duration, status, created_at)
             SELECT ?1, ?2, ?3, ?4, 'pending', ?5
             WHERE NOT EXISTS (
                 SELECT 1 FROM session_requests
                 WHERE status = 'pending' AND scheduled_at > ?5
                   AND ((sender_email = ?1 AND receiver_email = ?2) OR (sender_email = ?2 AND receiver_email = ?1))
             )
             AND NOT EXISTS (
                 SELECT 1 FROM meetings
                 WHERE scheduled_at + duration * 60 >= ?5
                   AND ((participant_a = ?1 AND participant_b = ?2) OR (participant_a = ?2 AND participant_b = ?1))
             )",
        )
        .bind(sender)
        .bind(receiver)
        .bind(scheduled_at)
        .bind(duration)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_request(result.last_insert_rowid()).await
    }

    pub async fn get_request(&self, id: i64) -> anyhow::Result<Option<RequestRow>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {} FROM session_requests WHERE id = ?",
            REQUEST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Latest pending request between two users, in either direction.
    pub async fn pending_between(&self, a: &str, b: &str) -> anyhow::Result<Option<RequestRow>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {} FROM session_requests
             WHERE status = 'pending'
               AND ((sender_email = ? AND receiver_email = ?) OR (sender_email = ? AND receiver_email = ?))
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
            REQUEST_COLUMNS
        ))
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Marks a pending request answered. `false` when it was no longer
    /// pending.
    pub async fn answer_request(&self, id: i64, status: RequestStatus) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE session_requests SET status = ? WHERE id = ? AND status = 'pending'")
            .bind(status_str(status))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Accepts a pending request and books its meeting in one transaction.
    /// Nothing changes unless the request is pending and the pair has no
    /// live meeting at `now`.
    pub async fn accept_request(&self, id: i64, now: i64) -> anyhow::Result<AcceptOutcome> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE session_requests SET status = 'accepted' WHERE id = ? AND status = 'pending'")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(AcceptOutcome::NotPending);
        }

        let inserted = sqlx::query(
            "INSERT INTO meetings (request_id, participant_a, participant_b, scheduled_at, duration, created_at)
             SELECT r.id, r.sender_email, r.receiver_email, r.scheduled_at, r.duration, ?1
             FROM session_requests r
             WHERE r.id = ?2
               AND NOT EXISTS (
                   SELECT 1 FROM meetings m
                   WHERE m.scheduled_at + m.duration * 60 >= ?1
                     AND ((m.participant_a = r.sender_email AND m.participant_b = r.receiver_email)
                       OR (m.participant_a = r.receiver_email AND m.participant_b = r.sender_email))
               )",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(AcceptOutcome::PairBusy);
        }

        let meeting = sqlx::query_as::<_, MeetingRow>(&format!(
            "SELECT {} FROM meetings WHERE id = ?",
            MEETING_COLUMNS
        ))
        .bind(inserted.last_insert_rowid())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AcceptOutcome::Booked(meeting))
    }

    // ========================================================================
    // Meeting Operations
    // ========================================================================

    pub async fn get_meeting(&self, id: i64) -> anyhow::Result<Option<MeetingRow>> {
        let row = sqlx::query_as::<_, MeetingRow>(&format!(
            "SELECT {} FROM meetings WHERE id = ?",
            MEETING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Meetings of `email` that have not ended at `now`, by start time.
    pub async fn meetings_for(&self, email: &str, now: i64) -> anyhow::Result<Vec<MeetingRow>> {
        let rows = sqlx::query_as::<_, MeetingRow>(&format!(
            "SELECT {} FROM meetings
             WHERE (participant_a = ? OR participant_b = ?)
               AND scheduled_at + duration * 60 >= ?
             ORDER BY scheduled_at ASC, id ASC",
            MEETING_COLUMNS
        ))
        .bind(email)
        .bind(email)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn meetings_between(&self, a: &str, b: &str, now: i64) -> anyhow::Result<Vec<MeetingRow>> {
        let rows = sqlx::query_as::<_, MeetingRow>(&format!(
            "SELECT {} FROM meetings
             WHERE ((participant_a = ? AND participant_b = ?) OR (participant_a = ? AND participant_b = ?))
               AND scheduled_at + duration * 60 >= ?
             ORDER BY scheduled_at ASC, id ASC",
            MEETING_COLUMNS
        ))
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn delete_meeting(&self, id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM meetings WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Cleanup Operations
    // ========================================================================

    pub async fn cleanup_expired(&self, now: i64) -> anyhow::Result<CleanupReport> {
        let meetings = sqlx::query("DELETE FROM meetings WHERE scheduled_at + duration * 60 < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;

        // A request cannot be accepted once its start has passed
        let requests = sqlx::query(
            "UPDATE session_requests SET status = 'expired' WHERE status = 'pending' AND scheduled_at <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        let sessions = sqlx::query("DELETE FROM auth_sessions WHERE expires_at <= ? OR is_valid = 0")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(CleanupReport {
            meetings_removed: meetings.rows_affected(),
            requests_expired: requests.rows_affected(),
            sessions_removed: sessions.rows_affected(),
        })
    }
}
