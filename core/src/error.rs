//! Error types for SkillSwap Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Selected time {requested} is not in the future (now {now})")]
    PastTime { requested: String, now: String },

    #[error("Server rejected request ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Cannot {event} while session is {state}")]
    InvalidTransition {
        state: &'static str,
        event: &'static str,
    },

    #[error("A media session is already active for {0}")]
    SessionAlreadyActive(String),

    #[error("Only the receiver of request {0} may answer it")]
    NotReceiver(i64),

    #[error("No pending request")]
    NoPendingRequest,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Media error: {0}")]
    Media(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether repeating the same action unchanged can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::PermissionDenied(_)
                | Error::Validation(_)
                | Error::PastTime { .. }
                | Error::NotReceiver(_)
                | Error::InvalidTransition { .. }
                | Error::NotLoggedIn
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Media(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::ConnectionFailure("ice".into()).is_retryable());
        assert!(Error::Media("no device".into()).is_retryable());
        assert!(Error::Remote { status: 503, message: "busy".into() }.is_retryable());

        assert!(!Error::NotReceiver(4).is_retryable());
        assert!(!Error::InvalidTransition {
            state: "ended",
            event: "start",
        }
        .is_retryable());
        assert!(!Error::PermissionDenied("mic".into()).is_retryable());
        assert!(!Error::NotLoggedIn.is_retryable());
    }
}
