//! Credit balance endpoints

use crate::auth::{require_service_key, AuthContext};
use crate::error::{HttpAppError, ValidatedJson};
use crate::services::AdmissionController;
use crate::state::{AppState, DbState};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use pixora_core::models::{resolve_tier, CreditBalance, TierInfo};
use pixora_db::{CreditLedgerRepositoryTrait, SubscriptionRepositoryTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct CreditBalanceResponse {
    /// Current balance; null when the identity has no ledger row yet
    pub credits: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/api/v0/credits",
    tag = "credits",
    responses(
        (status = 200, description = "Current balance for the caller's identity", body = CreditBalanceResponse),
        (status = 400, description = "No resolvable identity")
    ),
    security(("session_token" = []))
)]
pub async fn get_credits(
    auth: AuthContext,
    State(admission): State<AdmissionController>,
) -> Result<impl IntoResponse, HttpAppError> {
    let credits = admission
        .current_balance(auth.user_id.as_deref(), &auth.client_ip)
        .await
        .map_err(HttpAppError::from)?;
    Ok(Json(CreditBalanceResponse { credits }))
}

#[utoipa::path(
    get,
    path = "/api/v0/subscription",
    tag = "credits",
    responses(
        (status = 200, description = "Resolved subscription tier for the caller", body = TierInfo)
    ),
    security(("session_token" = []))
)]
pub async fn get_subscription_tier(
    auth: AuthContext,
    State(db): State<DbState>,
) -> Result<impl IntoResponse, HttpAppError> {
    let tier = match auth.user_id.as_deref() {
        None => TierInfo::free(),
        Some(user_id) => match db
            .subscriptions
            .get_for_user(user_id)
            .await
            .map_err(HttpAppError::from)?
        {
            Some(sub) => resolve_tier(&sub.product_name, &sub.status),
            None => TierInfo::free(),
        },
    };
    Ok(Json(tier))
}

#[utoipa::path(
    get,
    path = "/api/v0/credits/{identity_key}",
    tag = "credits",
    params(
        ("identity_key" = String, Path, description = "User id or normalized IP")
    ),
    responses(
        (status = 200, description = "Full balance row", body = CreditBalance),
        (status = 401, description = "Missing or invalid service key"),
        (status = 404, description = "No balance row for this identity")
    )
)]
pub async fn get_credit_row(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(identity_key): Path<String>,
) -> Result<impl IntoResponse, HttpAppError> {
    require_service_key(&headers, state.metering.service_api_key.as_deref())
        .map_err(HttpAppError::from)?;

    let row = state
        .db
        .credit_ledger
        .get_row(identity_key.trim())
        .await
        .map_err(HttpAppError::from)?
        .ok_or_else(|| {
            HttpAppError(pixora_core::AppError::NotFound(format!(
                "No credit balance for identity {}",
                identity_key
            )))
        })?;
    Ok(Json(row))
}

/// Purchase/refund increment, called by the billing service after a
/// completed checkout.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreditGrantRequest {
    pub identity_key: String,
    pub amount: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreditGrantResponse {
    pub identity_key: String,
    pub credits: i64,
}

#[utoipa::path(
    post,
    path = "/api/v0/credits/grant",
    tag = "credits",
    request_body = CreditGrantRequest,
    responses(
        (status = 200, description = "New balance after the grant", body = CreditGrantResponse),
        (status = 400, description = "Non-positive amount or empty identity"),
        (status = 401, description = "Missing or invalid service key")
    )
)]
pub async fn grant_credits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ValidatedJson(grant): ValidatedJson<CreditGrantRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    require_service_key(&headers, state.metering.service_api_key.as_deref())
        .map_err(HttpAppError::from)?;

    if grant.identity_key.trim().is_empty() {
        return Err(HttpAppError(pixora_core::AppError::InvalidInput(
            "identity_key must not be empty".to_string(),
        )));
    }
    if grant.amount <= 0 {
        return Err(HttpAppError(pixora_core::AppError::InvalidInput(
            "amount must be positive".to_string(),
        )));
    }

    let credits = state
        .db
        .credit_ledger
        .increment(grant.identity_key.trim(), grant.amount)
        .await
        .map_err(HttpAppError::from)?;

    tracing::info!(
        identity_key = %grant.identity_key,
        amount = grant.amount,
        new_balance = credits,
        "Applied credit grant"
    );

    Ok(Json(CreditGrantResponse {
        identity_key: grant.identity_key.trim().to_string(),
        credits,
    }))
}
