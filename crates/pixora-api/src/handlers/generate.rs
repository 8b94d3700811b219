//! Generation endpoints

use crate::auth::{require_service_key, AuthContext};
use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use pixora_core::models::{AssetType, GenerationRequest, GenerationResponse};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;
use validator::Validate;

#[utoipa::path(
    post,
    path = "/api/v0/generations/image",
    tag = "generations",
    request_body = GenerationRequest,
    responses(
        (status = 200, description = "Generated image reference", body = GenerationResponse),
        (status = 400, description = "Malformed request or client IP"),
        (status = 401, description = "Sign-in required"),
        (status = 402, description = "Insufficient credits"),
        (status = 502, description = "Generation backend failure or timeout")
    ),
    security(("session_token" = []))
)]
pub async fn generate_image(
    auth: AuthContext,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<GenerationRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    request.validate().map_err(pixora_core::AppError::from)?;
    let response = state
        .admission
        .admit_generation(
            auth.user_id,
            auth.client_ip,
            AssetType::ImageGeneration,
            request,
        )
        .await
        .map_err(HttpAppError::from)?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/v0/generations/video",
    tag = "generations",
    request_body = GenerationRequest,
    responses(
        (status = 200, description = "Generated video reference", body = GenerationResponse),
        (status = 400, description = "Malformed request or client IP"),
        (status = 401, description = "Sign-in required"),
        (status = 402, description = "Insufficient credits"),
        (status = 502, description = "Generation backend failure or timeout")
    ),
    security(("session_token" = []))
)]
pub async fn generate_video(
    auth: AuthContext,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<GenerationRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    request.validate().map_err(pixora_core::AppError::from)?;
    let response = state
        .admission
        .admit_generation(
            auth.user_id,
            auth.client_ip,
            AssetType::VideoGeneration,
            request,
        )
        .await
        .map_err(HttpAppError::from)?;
    Ok(Json(response))
}

/// Completion callback from the vendor gateway.
#[derive(Debug, Deserialize, ToSchema)]
pub struct GenerationCallback {
    pub request_id: String,
    pub asset_url: String,
}

#[utoipa::path(
    post,
    path = "/api/v0/generations/callback",
    tag = "generations",
    request_body = GenerationCallback,
    responses(
        (status = 200, description = "Completion reconciled to the initiating activity record"),
        (status = 401, description = "Missing or invalid service key"),
        (status = 404, description = "No activity record for the request id")
    )
)]
pub async fn generation_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ValidatedJson(callback): ValidatedJson<GenerationCallback>,
) -> Result<impl IntoResponse, HttpAppError> {
    require_service_key(&headers, state.metering.service_api_key.as_deref())
        .map_err(HttpAppError::from)?;

    let activity_id = state
        .admission
        .complete_async(&callback.request_id, &callback.asset_url)
        .await
        .map_err(HttpAppError::from)?;

    Ok(Json(serde_json::json!({ "activity_id": activity_id })))
}
