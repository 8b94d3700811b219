//! Generation request/response wire types

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use super::activity::AssetType;

/// Body of a generation request.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct GenerationRequest {
    #[validate(length(min = 1, max = 4000, message = "prompt must be 1-4000 characters"))]
    pub prompt: String,
    /// Vendor-specific knobs (aspect ratio, duration, style), passed through
    /// opaquely to the generation backend.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Asset reference returned to the caller on success.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct GenerationResponse {
    pub asset_url: String,
    pub asset_type: AssetType,
    /// Absent only if the audit write failed after a delivered asset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<i64>,
    pub credits_remaining: i64,
}

/// A job handed to the generation backend.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub asset_type: AssetType,
    pub prompt: String,
    pub parameters: serde_json::Value,
}

/// Immediate result of invoking the generation backend.
#[derive(Debug, Clone)]
pub enum InvokeOutcome {
    /// The backend produced the asset synchronously.
    Completed { asset_url: String },
    /// The backend accepted the job; completion must be polled.
    Accepted { request_id: String },
}

/// Result of one status poll for an accepted job.
#[derive(Debug, Clone)]
pub enum PollStatus {
    Completed { asset_url: String },
    Pending,
    Failed { reason: String },
}
