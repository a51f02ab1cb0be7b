//! Session request and meeting handlers
//!
//! A pair of users has at most one pending request at a time and cannot
//! request again while a meeting between them is still live.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use skillswap_core::{Meeting, NewSessionRequest, RequestStatus, SessionRequest};

use crate::{
    error::{AppError, Result},
    models::*,
    AppState,
};

use super::{normalize_email, AuthUser};

/// Create a session request to another user
pub async fn create_request(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<NewSessionRequest>,
) -> Result<Json<SessionRequest>> {
    let receiver = normalize_email(&req.receiver_email);
    if receiver == auth.email {
        return Err(AppError::BadRequest("Cannot request a session with yourself".to_string()));
    }

    let max = state.config.schedule.max_duration_minutes;
    if req.duration == 0 || req.duration > max {
        return Err(AppError::BadRequest(format!(
            "Duration must be between 1 and {} minutes",
            max
        )));
    }

    let zone = state.zone();
    let scheduled_at = req
        .scheduled_date_time
        .resolve(&zone)
        .ok_or_else(|| AppError::BadRequest("Invalid scheduledDateTime".to_string()))?
        .timestamp();
    let now = state.now();
    if scheduled_at <= now {
        return Err(AppError::BadRequest("Scheduled time must be in the future".to_string()));
    }

    match state.storage.get_user(&receiver).await? {
        Some(user) if user.is_active => {}
        _ => return Err(AppError::NotFound("Receiver not found".to_string())),
    }

    let row = state
        .storage
        .create_request(&auth.email, &receiver, scheduled_at, i64::from(req.duration), now)
        .await?
        .ok_or_else(|| {
            AppError::Conflict("A pending request or live meeting already exists between you".to_string())
        })?;

    tracing::info!("Request {} from {} to {}", row.id, auth.email, receiver);

    Ok(Json(row.into_wire(&zone)))
}

/// Latest pending request between the caller and `peer`, or 204
pub async fn latest_request(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(peer): Path<String>,
) -> Result<Response> {
    let peer = normalize_email(&peer);
    // A pending request whose start has passed is expired even before cleanup runs
    let now = state.now();
    let row = state
        .storage
        .pending_between(&auth.email, &peer)
        .await?
        .filter(|r| r.scheduled_at > now);

    Ok(match row {
        Some(row) => Json(row.into_wire(&state.zone())).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// Loads a request the caller may answer.
async fn answerable(state: &AppState, auth: &AuthUser, id: i64) -> Result<RequestRow> {
    let row = state
        .storage
        .get_request(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Request not found".to_string()))?;

    if row.receiver_email != auth.email {
        return Err(AppError::Forbidden(
            "Only the receiver can answer this request".to_string(),
        ));
    }
    if row.status() != RequestStatus::Pending {
        return Err(AppError::Conflict("Request is no longer pending".to_string()));
    }
    if row.scheduled_at <= state.now() {
        return Err(AppError::Conflict("Request has expired".to_string()));
    }

    Ok(row)
}

/// Accept a pending request; books the meeting
pub async fn accept_request(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Meeting>> {
    answerable(&state, &auth, id).await?;

    let meeting = match state.storage.accept_request(id, state.now()).await? {
        AcceptOutcome::Booked(meeting) => meeting,
        AcceptOutcome::NotPending => {
            return Err(AppError::Conflict("Request is no longer pending".to_string()))
        }
        AcceptOutcome::PairBusy => {
            return Err(AppError::Conflict("A meeting is already scheduled".to_string()))
        }
    };

    tracing::info!("Request {} accepted, meeting {} booked", id, meeting.id);

    Ok(Json(meeting.into_wire(&state.zone())))
}

/// Reject a pending request
pub async fn reject_request(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    answerable(&state, &auth, id).await?;

    if !state.storage.answer_request(id, RequestStatus::Rejected).await? {
        return Err(AppError::Conflict("Request is no longer pending".to_string()));
    }

    tracing::info!("Request {} rejected by {}", id, auth.email);

    Ok(Json(json!({ "success": true })))
}

/// Live meetings between the caller and `peer`
pub async fn meetings_with(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(peer): Path<String>,
) -> Result<Json<Vec<Meeting>>> {
    let peer = normalize_email(&peer);
    let zone = state.zone();
    let rows = state
        .storage
        .meetings_between(&auth.email, &peer, state.now())
        .await?;

    Ok(Json(rows.into_iter().map(|m| m.into_wire(&zone)).collect()))
}

/// Every live meeting of the caller
pub async fn list_meetings(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<Meeting>>> {
    let zone = state.zone();
    let rows = state.storage.meetings_for(&auth.email, state.now()).await?;

    Ok(Json(rows.into_iter().map(|m| m.into_wire(&zone)).collect()))
}

/// Delete a meeting the caller participates in
pub async fn delete_meeting(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    let meeting = state
        .storage
        .get_meeting(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Meeting not found".to_string()))?;

    if !meeting.involves(&auth.email) {
        return Err(AppError::Forbidden("Not a participant of this meeting".to_string()));
    }

    state.storage.delete_meeting(id).await?;
    tracing::info!("Meeting {} deleted by {}", id, auth.email);

    Ok(Json(json!({ "success": true })))
}
