//! Subscription tier resolution
//!
//! A tier is derived, never stored: a pure function of the billing provider's
//! (product name, subscription status) pair. Upstream tokens sometimes arrive
//! wrapped in stray quote characters from the billing sync; those are
//! stripped at this boundary before comparison.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Monthly request ceilings per paid tier.
const CREATOR_MONTHLY_CAP: i32 = 200;
const PRO_MONTHLY_CAP: i32 = 200;
const STUDIO_MONTHLY_CAP: i32 = 220;

/// Resolved subscription tier for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TierInfo {
    /// Whether the identity holds an active monthly subscription
    pub monthly_subscriber: bool,
    /// 0 = free/anonymous (pay-per-credit), 1-3 = paid tiers
    pub subscription_tier: i32,
    /// Monthly generation ceiling; 0 for tier 0 (no cap through this path)
    pub max_requests_per_month: i32,
}

impl TierInfo {
    /// Tier 0: no active subscription, pay-per-credit only.
    pub fn free() -> Self {
        Self {
            monthly_subscriber: false,
            subscription_tier: 0,
            max_requests_per_month: 0,
        }
    }
}

/// Map a raw (product name, subscription status) pair to a tier.
///
/// Unrecognized combinations fall back to tier 0 — pay-per-use/anonymous
/// treatment. No input ever raises an error.
pub fn resolve_tier(product_name: &str, subscription_status: &str) -> TierInfo {
    let product = clean_billing_token(product_name);
    let status = clean_billing_token(subscription_status);

    if !is_active_status(&status) {
        return TierInfo::free();
    }

    match product.as_str() {
        "creator" => TierInfo {
            monthly_subscriber: true,
            subscription_tier: 1,
            max_requests_per_month: CREATOR_MONTHLY_CAP,
        },
        "pro" => TierInfo {
            monthly_subscriber: true,
            subscription_tier: 2,
            max_requests_per_month: PRO_MONTHLY_CAP,
        },
        "studio" => TierInfo {
            monthly_subscriber: true,
            subscription_tier: 3,
            max_requests_per_month: STUDIO_MONTHLY_CAP,
        },
        _ => TierInfo::free(),
    }
}

/// Strip surrounding whitespace and quote characters from a billing token and
/// lowercase it. The upstream sync stores some fields with embedded quotes;
/// comparing the cleaned token keeps resolution stable either way.
fn clean_billing_token(token: &str) -> String {
    token
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_ascii_lowercase()
}

fn is_active_status(status: &str) -> bool {
    matches!(status, "active" | "trialing")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paid_tiers() {
        let creator = resolve_tier("Creator", "active");
        assert_eq!(creator.subscription_tier, 1);
        assert_eq!(creator.max_requests_per_month, 200);
        assert!(creator.monthly_subscriber);

        let pro = resolve_tier("Pro", "active");
        assert_eq!(pro.subscription_tier, 2);
        assert_eq!(pro.max_requests_per_month, 200);

        let studio = resolve_tier("Studio", "active");
        assert_eq!(studio.subscription_tier, 3);
        assert_eq!(studio.max_requests_per_month, 220);
    }

    #[test]
    fn test_quoted_tokens_resolve_like_bare_ones() {
        // The billing sync historically stored product names with embedded quotes.
        assert_eq!(resolve_tier("\"Pro\"", "active"), resolve_tier("Pro", "active"));
        assert_eq!(
            resolve_tier("'Studio'", "\"active\""),
            resolve_tier("Studio", "active")
        );
        assert_eq!(
            resolve_tier("  Creator  ", " active "),
            resolve_tier("Creator", "active")
        );
    }

    #[test]
    fn test_unknown_pairs_yield_free_tier_never_error() {
        for (product, status) in [
            ("Enterprise", "active"),
            ("Pro", "canceled"),
            ("Pro", "past_due"),
            ("", ""),
            ("garbage", "garbage"),
        ] {
            let tier = resolve_tier(product, status);
            assert_eq!(tier, TierInfo::free());
            assert_eq!(tier.subscription_tier, 0);
            assert_eq!(tier.max_requests_per_month, 0);
        }
    }

    #[test]
    fn test_trialing_counts_as_active() {
        assert!(resolve_tier("Pro", "trialing").monthly_subscriber);
    }

    #[test]
    fn test_inactive_paid_product_is_free_tier() {
        let tier = resolve_tier("Studio", "canceled");
        assert!(!tier.monthly_subscriber);
        assert_eq!(tier.subscription_tier, 0);
    }
}
