//! Subscription projection repository
//!
//! The billing provider (Stripe webhook service, out of scope here) keeps
//! this table current; this side only reads the (product_name, status) pair
//! that the tier resolver consumes.

use chrono::{DateTime, Utc};
use pixora_core::AppError;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// One row of the billing projection.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub user_id: String,
    pub product_name: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// Trait for subscription projection lookups.
#[async_trait::async_trait]
pub trait SubscriptionRepositoryTrait: Send + Sync {
    /// The raw (product_name, status) pair for a user, if any subscription
    /// has ever been synced. Tokens are returned as stored — cleaning happens
    /// in the tier resolver.
    async fn get_for_user(&self, user_id: &str) -> Result<Option<SubscriptionRow>, AppError>;
}

#[derive(Clone)]
pub struct PostgresSubscriptionRepository {
    pool: PgPool,
}

impl PostgresSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SubscriptionRepositoryTrait for PostgresSubscriptionRepository {
    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = "subscriptions",
        db.operation = "select"
    ))]
    async fn get_for_user(&self, user_id: &str) -> Result<Option<SubscriptionRow>, AppError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT user_id, product_name, status, updated_at \
             FROM subscriptions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}
