//! Activity ledger endpoints

use crate::auth::AuthContext;
use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Json},
};
use pixora_core::models::{AssetType, Identity};
use pixora_core::AppError;
use pixora_db::ActivityRepositoryTrait;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

fn resolve_caller_identity(auth: &AuthContext) -> Result<Identity, AppError> {
    Identity::resolve(auth.user_id.as_deref(), Some(&auth.client_ip)).ok_or_else(|| {
        AppError::InvalidInput("A user id or valid client IP is required".to_string())
    })
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ActivityQuery {
    /// Max records to return (default 20, cap 100)
    pub limit: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/api/v0/activity",
    tag = "activity",
    params(ActivityQuery),
    responses(
        (status = 200, description = "Recent activity for the caller's identity, newest first"),
        (status = 400, description = "No resolvable identity")
    ),
    security(("session_token" = []))
)]
pub async fn list_activity(
    auth: AuthContext,
    Query(query): Query<ActivityQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpAppError> {
    let identity = resolve_caller_identity(&auth).map_err(HttpAppError::from)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let records = state
        .db
        .activity
        .list_recent(&identity, limit)
        .await
        .map_err(HttpAppError::from)?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct LatestActivityQuery {
    /// Optional asset type filter ("img", "vid", "upl", "edit")
    pub asset_type: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v0/activity/latest",
    tag = "activity",
    params(LatestActivityQuery),
    responses(
        (status = 200, description = "Most recent activity record, or null"),
        (status = 400, description = "Unknown asset type filter or no identity")
    ),
    security(("session_token" = []))
)]
pub async fn latest_activity(
    auth: AuthContext,
    Query(query): Query<LatestActivityQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpAppError> {
    let identity = resolve_caller_identity(&auth).map_err(HttpAppError::from)?;

    let asset_type = match query.asset_type.as_deref() {
        None => None,
        Some(code) => Some(AssetType::from_code(code).ok_or_else(|| {
            HttpAppError(AppError::InvalidInput(format!(
                "Unknown asset type '{}'",
                code
            )))
        })?),
    };

    let record = state
        .db
        .activity
        .find_latest_by_identity(&identity, asset_type)
        .await
        .map_err(HttpAppError::from)?;
    Ok(Json(record))
}

/// Body for recording a gallery upload. Uploads are non-chargeable; the
/// record keeps the audit trail complete.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RecordUploadRequest {
    pub asset_url: String,
    #[serde(default = "default_upload_source")]
    pub source: String,
}

fn default_upload_source() -> String {
    "gallery-upload".to_string()
}

#[utoipa::path(
    post,
    path = "/api/v0/uploads/record",
    tag = "activity",
    request_body = RecordUploadRequest,
    responses(
        (status = 200, description = "Upload activity appended"),
        (status = 400, description = "No resolvable identity or empty asset URL")
    ),
    security(("session_token" = []))
)]
pub async fn record_upload(
    auth: AuthContext,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<RecordUploadRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    if request.asset_url.trim().is_empty() {
        return Err(HttpAppError(AppError::InvalidInput(
            "asset_url must not be empty".to_string(),
        )));
    }

    let activity_id = state
        .admission
        .record_upload(
            auth.user_id,
            auth.client_ip,
            request.asset_url,
            request.source,
        )
        .await
        .map_err(HttpAppError::from)?;

    Ok(Json(serde_json::json!({ "activity_id": activity_id })))
}
