use crate::auth::DeviceCredentials;
use crate::error::{AppError, Result};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use facerelay_protocol::SessionDescription;

/// Answer a device's session offer
pub async fn create_session(
    State(state): State<AppState>,
    credentials: DeviceCredentials,
    Json(offer): Json<SessionDescription>,
) -> Result<Json<SessionDescription>> {
    if offer.kind != "offer" {
        return Err(AppError::BadRequest(format!(
            "expected an offer, got '{}'",
            offer.kind
        )));
    }

    let answer = state
        .manager
        .admit(&credentials.device_id, &credentials.secret, offer)
        .await?;

    Ok(Json(answer))
}

/// Let a device hang up its own session
pub async fn close_session(
    State(state): State<AppState>,
    credentials: DeviceCredentials,
    Path(device_id): Path<String>,
) -> Result<StatusCode> {
    if credentials.device_id != device_id {
        return Err(AppError::Unauthorized);
    }
    state
        .authenticator
        .authenticate(&credentials.device_id, &credentials.secret)
        .await?;

    if state.manager.disconnect(&device_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("no live session for {}", device_id)))
    }
}
