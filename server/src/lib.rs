//! SkillSwap Server - session scheduling backend
//!
//! This server handles:
//! - User authentication via access keys
//! - Session requests between two users
//! - Meetings booked from accepted requests
//! - Periodic cleanup of ended meetings and stale requests

pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod models;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Router,
};
use chrono::FixedOffset;
use skillswap_core::{Clock, DEFAULT_API_PREFIX};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::storage::Storage;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Unix seconds
    pub fn now(&self) -> i64 {
        self.clock.now().timestamp()
    }

    /// Zone wall-clock times on the wire are read in.
    pub fn zone(&self) -> FixedOffset {
        self.clock.zone()
    }
}

pub fn router(state: AppState) -> Router {
    let sessions = Router::new()
        .route("/request", post(handlers::sessions::create_request))
        .route("/requests/:peer/latest", get(handlers::sessions::latest_request))
        .route("/accept/:id", post(handlers::sessions::accept_request))
        .route("/reject/:id", post(handlers::sessions::reject_request))
        .route("/meetings", get(handlers::sessions::list_meetings))
        .route("/meetings/:peer", get(handlers::sessions::meetings_with))
        .route("/meeting/:id", delete(handlers::sessions::delete_meeting));

    Router::new()
        // Health check
        .route("/health", get(handlers::health::health_check))

        // Authentication
        .route("/api/v1/auth/login", post(handlers::auth::login))

        // Requests and meetings
        .nest(DEFAULT_API_PREFIX, sessions)

        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Periodically drops ended meetings, expires requests whose start has
/// passed and purges dead auth sessions.
pub fn spawn_cleanup(storage: Arc<Storage>, clock: Arc<dyn Clock>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match storage.cleanup_expired(clock.now().timestamp()).await {
                Ok(report) => {
                    if !report.is_empty() {
                        tracing::info!(
                            "Cleanup: removed {} meetings, expired {} requests, removed {} sessions",
                            report.meetings_removed,
                            report.requests_expired,
                            report.sessions_removed
                        );
                    }
                }
                Err(e) => {
                    tracing::error!("Cleanup failed: {}", e);
                }
            }
        }
    })
}
