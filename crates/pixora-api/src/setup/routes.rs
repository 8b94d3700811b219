//! Route configuration and setup

use crate::api_doc::ApiDoc;
use crate::auth::{identity_middleware, IdentityState};
use crate::handlers;
use crate::middleware::{
    rate_limit_middleware, security_headers_middleware, HttpRateLimiter, SecurityHeadersConfig,
};
use crate::state::AppState;
use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Json, Router,
};
use pixora_core::Config;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

/// Setup all application routes
pub fn setup_routes(config: &Config, state: Arc<AppState>) -> Result<Router, anyhow::Error> {
    let cors = setup_cors(config)?;

    let identity_state = Arc::new(IdentityState {
        jwt_secret: config.jwt_secret.clone(),
        trusted_proxy_count: config.trusted_proxy_count,
    });

    let rate_limiter = Arc::new(HttpRateLimiter::new(
        config.http_rate_limit_per_minute,
        config.http_identity_rate_limit_per_minute,
    ));

    let security_headers_config = Arc::new(SecurityHeadersConfig::new(config.is_production()));

    let api_routes = Router::new()
        .route(
            "/api/v0/generations/image",
            post(handlers::generate::generate_image),
        )
        .route(
            "/api/v0/generations/video",
            post(handlers::generate::generate_video),
        )
        .route(
            "/api/v0/generations/callback",
            post(handlers::generate::generation_callback),
        )
        .route("/api/v0/credits", get(handlers::credits::get_credits))
        .route("/api/v0/credits/grant", post(handlers::credits::grant_credits))
        .route(
            "/api/v0/credits/{identity_key}",
            get(handlers::credits::get_credit_row),
        )
        .route(
            "/api/v0/subscription",
            get(handlers::credits::get_subscription_tier),
        )
        .route("/api/v0/users/provision", post(handlers::users::provision_user))
        .route("/api/v0/activity", get(handlers::activity::list_activity))
        .route(
            "/api/v0/activity/latest",
            get(handlers::activity::latest_activity),
        )
        .route(
            "/api/v0/uploads/record",
            post(handlers::activity::record_upload),
        )
        // Rate limiting keys off AuthContext, so it sits inside the identity
        // middleware layer (layers run bottom-up).
        .layer(axum::middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            identity_state,
            identity_middleware,
        ));

    let openapi = ApiDoc::openapi();
    let app = Router::new()
        .route("/health", get(handlers::health::health))
        .route(
            "/api/openapi.json",
            get(move || {
                let spec = openapi.clone();
                async move { Json(spec) }
            }),
        )
        .merge(api_routes)
        .nest(
            "/docs",
            utoipa_rapidoc::RapiDoc::new("/api/openapi.json")
                .path("/docs")
                .into(),
        )
        .layer(ConcurrencyLimitLayer::new(http_concurrency_limit()))
        .layer(axum::middleware::from_fn_with_state(
            security_headers_config,
            security_headers_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(app)
}

/// Server-level concurrency ceiling against resource exhaustion under
/// extreme load.
fn http_concurrency_limit() -> usize {
    std::env::var("HTTP_CONCURRENCY_LIMIT")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(10_000)
        .max(1)
}

fn setup_cors(config: &Config) -> Result<CorsLayer, anyhow::Error> {
    let cors = if config.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
    } else {
        let origins = config
            .cors_origins
            .iter()
            .map(|origin| origin.parse::<HeaderValue>())
            .collect::<Result<Vec<_>, _>>()?;
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
    };
    Ok(cors)
}
