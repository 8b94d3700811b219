//! User provisioning endpoint
//!
//! Invoked by the auth service when a registration completes; grants the
//! signup credit balance. Idempotent, so auth-side retries are harmless.

use crate::auth::require_service_key;
use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use pixora_core::models::is_genuine_user_id;
use pixora_db::CreditLedgerRepositoryTrait;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct ProvisionUserRequest {
    pub user_id: String,
}

#[utoipa::path(
    post,
    path = "/api/v0/users/provision",
    tag = "users",
    request_body = ProvisionUserRequest,
    responses(
        (status = 200, description = "Signup grant provisioned (or already present)"),
        (status = 400, description = "Placeholder or empty user id"),
        (status = 401, description = "Missing or invalid service key")
    )
)]
pub async fn provision_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ValidatedJson(request): ValidatedJson<ProvisionUserRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    require_service_key(&headers, state.metering.service_api_key.as_deref())
        .map_err(HttpAppError::from)?;

    let user_id = request.user_id.trim();
    if !is_genuine_user_id(user_id) {
        return Err(HttpAppError(pixora_core::AppError::InvalidInput(
            "A genuine user id is required".to_string(),
        )));
    }

    state
        .db
        .credit_ledger
        .provision_new_user(user_id, state.metering.signup_credit_grant)
        .await
        .map_err(HttpAppError::from)?;

    Ok(Json(serde_json::json!({
        "user_id": user_id,
        "granted": state.metering.signup_credit_grant,
    })))
}
