//! Authentication handlers

use axum::{extract::State, Json};
use crate::{
    crypto,
    error::{AppError, Result},
    models::*,
    AppState,
};

use super::normalize_email;

/// Login with email and access key
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let email = normalize_email(&req.email);

    // Verify credentials
    let valid = state
        .storage
        .verify_user_credentials(&email, &req.access_key)
        .await
        .map_err(|_| AppError::InvalidCredentials)?;

    if !valid {
        tracing::warn!("Failed login for {}", email);
        return Err(AppError::InvalidCredentials);
    }

    let token = crypto::generate_session_token()?;
    let expires_at = state
        .storage
        .create_session(&email, &token, state.config.auth.session_ttl_hours, state.now())
        .await?;

    tracing::info!("User {} logged in", email);

    Ok(Json(LoginResponse { token, expires_at }))
}
