//! Credit balance models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::activity::AssetType;

/// Per-identity credit balance row. One row per ledger key, created lazily on
/// first activity or signup provisioning. Never deleted in normal operation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct CreditBalance {
    /// User id for registered users, normalized IP for anonymous visitors
    pub identity_key: String,
    pub credits: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fixed per-action credit costs, loaded from configuration.
#[derive(Debug, Clone, Copy)]
pub struct CreditCosts {
    pub image_generation: i64,
    pub video_generation: i64,
    pub edit: i64,
}

impl CreditCosts {
    /// Cost of one action of the given type. Uploads are free.
    pub fn cost_of(&self, asset_type: AssetType) -> i64 {
        match asset_type {
            AssetType::ImageGeneration => self.image_generation,
            AssetType::VideoGeneration => self.video_generation,
            AssetType::Edit => self.edit,
            AssetType::Upload => 0,
        }
    }
}

impl Default for CreditCosts {
    fn default() -> Self {
        Self {
            image_generation: 1,
            video_generation: 5,
            edit: 1,
        }
    }
}
