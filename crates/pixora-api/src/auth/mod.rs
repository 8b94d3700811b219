//! Session authentication
//!
//! The auth provider (OAuth flows, session issuance) lives outside this
//! service; what arrives here is a signed HS256 session token whose `sub` is
//! the user id. Absent token means anonymous — a first-class state, since
//! anonymous visitors are metered by IP. A present-but-invalid token is
//! rejected rather than downgraded to anonymous.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use pixora_core::AppError;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::HttpAppError;
use crate::utils::ip_extraction::extract_client_ip;

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User id
    pub sub: String,
    /// Expiry, seconds since epoch
    pub exp: i64,
    /// Issued at, seconds since epoch
    pub iat: i64,
}

/// Per-request identity context, inserted by [`identity_middleware`] and
/// extracted by handlers.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// User id from a valid session token; `None` for anonymous visitors
    pub user_id: Option<String>,
    /// Raw client IP as extracted from headers/socket (not yet normalized)
    pub client_ip: String,
}

/// State for the identity middleware.
#[derive(Clone)]
pub struct IdentityState {
    pub jwt_secret: String,
    pub trusted_proxy_count: usize,
}

/// Resolve every request to an [`AuthContext`].
///
/// Runs on all routes: generation handlers need both fields, read endpoints
/// need at least one, and the rate limiter keys off whichever is present.
pub async fn identity_middleware(
    State(state): State<std::sync::Arc<IdentityState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let socket_addr = request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|connect_info| connect_info.0);
    let client_ip = extract_client_ip(
        request.headers(),
        socket_addr.as_ref(),
        state.trusted_proxy_count,
    );

    let bearer = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let user_id = match bearer {
        None => None,
        Some(token) => match validate_session_token(token, &state.jwt_secret) {
            Ok(claims) => Some(claims.sub),
            Err(err) => {
                tracing::debug!(error = %err, "Rejected invalid session token");
                return HttpAppError(AppError::Unauthorized(
                    "Invalid or expired session token".to_string(),
                ))
                .into_response();
            }
        },
    };

    request.extensions_mut().insert(AuthContext {
        user_id,
        client_ip,
    });

    next.run(request).await
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = HttpAppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<AuthContext>().cloned().ok_or_else(|| {
            HttpAppError(AppError::Internal(
                "AuthContext missing; identity middleware not installed".to_string(),
            ))
        })
    }
}

/// Validate a session token and return its claims.
pub fn validate_session_token(token: &str, secret: &str) -> Result<SessionClaims, AppError> {
    let data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Unauthorized(format!("Invalid session token: {}", e)))?;
    Ok(data.claims)
}

/// Issue a session token. The production issuer is the external auth
/// service; this exists for local development and tests, sharing the secret.
#[allow(dead_code)]
pub fn issue_session_token(
    user_id: &str,
    secret: &str,
    expiry_hours: i64,
) -> Result<String, AppError> {
    let now = Utc::now();
    let claims = SessionClaims {
        sub: user_id.to_string(),
        exp: (now + Duration::hours(expiry_hours)).timestamp(),
        iat: now.timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Failed to issue session token: {}", e)))
}

/// Constant-time comparison for service-to-service API keys.
fn secure_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Guard for the provisioning/grant endpoints: the caller must present the
/// configured service key in `X-Service-Key`.
pub fn require_service_key(
    headers: &axum::http::HeaderMap,
    expected: Option<&str>,
) -> Result<(), AppError> {
    let expected = expected.ok_or_else(|| {
        AppError::Unauthorized("Service endpoints are disabled: no service key configured".to_string())
    })?;

    let provided = headers
        .get("x-service-key")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing service key".to_string()))?;

    if secure_compare(provided, expected) {
        Ok(())
    } else {
        Err(AppError::Unauthorized("Invalid service key".to_string()))
    }
}
