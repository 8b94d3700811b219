//! HTTP rate limiting middleware
//!
//! Short-horizon abuse protection in front of the credit metering layer: a
//! sharded in-memory limiter keyed by authenticated user id when present,
//! else by raw client IP. Monthly quota enforcement lives in the admission
//! controller; this only smooths bursts.

use crate::auth::AuthContext;
use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_SHARD_COUNT: usize = 16;
const MAX_BUCKETS_PER_SHARD: usize = 10_000;
const WINDOW_SECONDS: u64 = 60;

#[derive(Clone)]
struct RateLimitBucket {
    count: u32,
    reset_at: Instant,
}

impl RateLimitBucket {
    fn new() -> Self {
        Self {
            count: 0,
            reset_at: Instant::now() + Duration::from_secs(WINDOW_SECONDS),
        }
    }

    fn check_and_increment(&mut self, limit: u32) -> (bool, u32) {
        let now = Instant::now();

        // Reset if window expired
        if now >= self.reset_at {
            self.count = 0;
            self.reset_at = now + Duration::from_secs(WINDOW_SECONDS);
        }

        if self.count < limit {
            self.count += 1;
            (true, limit.saturating_sub(self.count))
        } else {
            (false, 0)
        }
    }

    fn reset_in(&self) -> Duration {
        self.reset_at.saturating_duration_since(Instant::now())
    }
}

/// Sharded rate limiter to reduce lock contention.
///
/// Keys are hashed across separate mutex-guarded maps so concurrent requests
/// for different identities rarely contend on the same lock.
#[derive(Clone)]
pub struct HttpRateLimiter {
    shards: Vec<Arc<Mutex<HashMap<String, RateLimitBucket>>>>,
    shard_count: usize,
    limit_per_minute: u32,
    identity_limit_per_minute: Option<u32>,
}

impl HttpRateLimiter {
    pub fn new(limit_per_minute: u32, identity_limit_per_minute: Option<u32>) -> Self {
        Self::with_shards(limit_per_minute, identity_limit_per_minute, DEFAULT_SHARD_COUNT)
    }

    pub fn with_shards(
        limit_per_minute: u32,
        identity_limit_per_minute: Option<u32>,
        shard_count: usize,
    ) -> Self {
        let shards = (0..shard_count)
            .map(|_| Arc::new(Mutex::new(HashMap::new())))
            .collect();
        Self {
            shards,
            shard_count,
            limit_per_minute,
            identity_limit_per_minute,
        }
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shard_count
    }

    pub async fn check_rate_limit(&self, key: &str, limit: u32) -> Result<u32, Duration> {
        let shard = &self.shards[self.shard_index(key)];
        let mut buckets = shard.lock().await;

        // Evict before inserting when the shard is full: expired buckets
        // first, then the oldest, so the map stays bounded.
        if buckets.len() >= MAX_BUCKETS_PER_SHARD {
            let now = Instant::now();
            let grace = Duration::from_secs(WINDOW_SECONDS);
            buckets.retain(|_key, bucket| {
                bucket.reset_at > now || (now - bucket.reset_at) < grace
            });

            if buckets.len() >= MAX_BUCKETS_PER_SHARD {
                let oldest_key = buckets
                    .iter()
                    .min_by_key(|(_, bucket)| bucket.reset_at)
                    .map(|(k, _)| k.clone());
                if let Some(key_to_remove) = oldest_key {
                    buckets.remove(&key_to_remove);
                    tracing::debug!(
                        removed_key = %key_to_remove,
                        "Evicted oldest rate limit bucket at capacity"
                    );
                }
            }
        }

        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(RateLimitBucket::new);

        let (allowed, remaining) = bucket.check_and_increment(limit);
        if allowed {
            Ok(remaining)
        } else {
            Err(bucket.reset_in())
        }
    }
}

/// Per-minute HTTP rate limiting.
///
/// Keying priority: authenticated user id over client IP, so one shared NAT
/// address does not exhaust the anonymous bucket for signed-in users.
///
/// Adds `X-RateLimit-Limit` / `X-RateLimit-Remaining` headers, and
/// `Retry-After` on 429 responses.
pub async fn rate_limit_middleware(
    State(rate_limiter): State<Arc<HttpRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let (rate_limit_key, limit) = match request.extensions().get::<AuthContext>() {
        Some(ctx) if ctx.user_id.is_some() => {
            let identity_limit = rate_limiter
                .identity_limit_per_minute
                .unwrap_or(rate_limiter.limit_per_minute);
            (
                format!("user:{}", ctx.user_id.as_deref().unwrap_or_default()),
                identity_limit,
            )
        }
        Some(ctx) => (format!("ip:{}", ctx.client_ip), rate_limiter.limit_per_minute),
        None => ("ip:unknown".to_string(), rate_limiter.limit_per_minute),
    };

    match rate_limiter.check_rate_limit(&rate_limit_key, limit).await {
        Ok(remaining) => {
            let mut response = next.run(request).await;

            if let Ok(header_value) = HeaderValue::from_str(&limit.to_string()) {
                response
                    .headers_mut()
                    .insert("X-RateLimit-Limit", header_value);
            }
            if let Ok(header_value) = HeaderValue::from_str(&remaining.to_string()) {
                response
                    .headers_mut()
                    .insert("X-RateLimit-Remaining", header_value);
            }

            response
        }
        Err(reset_in) => {
            tracing::warn!(
                rate_limit_key = %rate_limit_key,
                limit = limit,
                "HTTP rate limit exceeded"
            );

            let reset_seconds = reset_in.as_secs().max(1);

            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                axum::Json(serde_json::json!({
                    "error": "Too many requests. Please slow down."
                })),
            )
                .into_response();

            if let Ok(header_value) = HeaderValue::from_str(&limit.to_string()) {
                response
                    .headers_mut()
                    .insert("X-RateLimit-Limit", header_value);
            }
            response
                .headers_mut()
                .insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
            if let Ok(header_value) = HeaderValue::from_str(&reset_seconds.to_string()) {
                response.headers_mut().insert("Retry-After", header_value);
            }

            response
        }
    }
}
