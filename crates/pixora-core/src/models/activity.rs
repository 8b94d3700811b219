//! Activity ledger models
//!
//! Every user-facing action outcome (generation, upload, edit) appends one
//! immutable activity record carrying the credit balance before and after the
//! action. The table doubles as the audit log and the source for monthly
//! quota counting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Placeholder stored in `asset_url` when the action produced no asset.
pub const FAILED_ASSET_URL: &str = "error:generation-failed";

/// Kind of asset an activity record accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    /// AI image generation ("img" on the wire)
    #[serde(rename = "img")]
    ImageGeneration,
    /// AI video generation ("vid" on the wire)
    #[serde(rename = "vid")]
    VideoGeneration,
    /// Raw gallery upload ("upl" on the wire), non-chargeable
    #[serde(rename = "upl")]
    Upload,
    /// Edit of an existing asset
    #[serde(rename = "edit")]
    Edit,
}

impl AssetType {
    /// Short wire/storage code.
    pub fn code(&self) -> &'static str {
        match self {
            AssetType::ImageGeneration => "img",
            AssetType::VideoGeneration => "vid",
            AssetType::Upload => "upl",
            AssetType::Edit => "edit",
        }
    }

    pub fn from_code(code: &str) -> Option<AssetType> {
        match code {
            "img" => Some(AssetType::ImageGeneration),
            "vid" => Some(AssetType::VideoGeneration),
            "upl" => Some(AssetType::Upload),
            "edit" => Some(AssetType::Edit),
            _ => None,
        }
    }

    /// Whether this action type debits credits at all.
    pub fn is_chargeable(&self) -> bool {
        matches!(
            self,
            AssetType::ImageGeneration | AssetType::VideoGeneration | AssetType::Edit
        )
    }
}

/// One immutable audit/ledger row.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ActivityRecord {
    pub id: i64,
    /// Originating surface or vendor (e.g. "web", "gallery-upload")
    pub asset_source: String,
    /// Wire code of the asset type ("img", "vid", "upl", "edit")
    pub asset_type: String,
    /// Credit balance before the action
    pub credits_before: i64,
    /// Credit balance after the action (== before for non-chargeable actions)
    pub credits_after: i64,
    /// Resulting asset URL, or an error placeholder on failure
    pub asset_url: String,
    /// Vendor-side request id for async reconciliation
    pub external_request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub prompt: String,
    /// 0 = free/anonymous, 1-3 = paid tiers
    pub subscription_tier: i32,
    pub user_id: Option<String>,
    /// Always subnet-grouped, never a raw address
    pub user_ip: String,
}

impl ActivityRecord {
    /// Whether the record captures a delivered asset rather than a failure.
    pub fn is_success(&self) -> bool {
        !self.asset_url.starts_with("error:")
    }
}

/// Input for appending a new activity record. The recorder assigns the id and
/// timestamp, and normalizes `user_ip` before persisting.
#[derive(Debug, Clone)]
pub struct NewActivityRecord {
    pub asset_source: String,
    pub asset_type: AssetType,
    pub credits_before: i64,
    pub credits_after: i64,
    pub asset_url: String,
    pub external_request_id: Option<String>,
    pub prompt: String,
    pub subscription_tier: i32,
    pub user_id: Option<String>,
    pub user_ip: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_type_codes_round_trip() {
        for ty in [
            AssetType::ImageGeneration,
            AssetType::VideoGeneration,
            AssetType::Upload,
            AssetType::Edit,
        ] {
            assert_eq!(AssetType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(AssetType::from_code("png"), None);
    }

    #[test]
    fn test_upload_is_not_chargeable() {
        assert!(!AssetType::Upload.is_chargeable());
        assert!(AssetType::ImageGeneration.is_chargeable());
        assert!(AssetType::VideoGeneration.is_chargeable());
    }

    #[test]
    fn test_failure_marker_is_not_a_success() {
        let record = ActivityRecord {
            id: 1,
            asset_source: "web".to_string(),
            asset_type: "img".to_string(),
            credits_before: 30,
            credits_after: 30,
            asset_url: FAILED_ASSET_URL.to_string(),
            external_request_id: None,
            created_at: Utc::now(),
            prompt: "a lighthouse at dusk".to_string(),
            subscription_tier: 0,
            user_id: Some("user-1".to_string()),
            user_ip: "192.168.1.0".to_string(),
        };
        assert!(!record.is_success());
    }
}
