//! Activity ledger repository
//!
//! Append-only: `record` only ever inserts. The single correction path,
//! `set_asset_url`, exists for reconciling webhook-driven completions and is
//! deliberately separate from the append path.

use chrono::{DateTime, Utc};
use pixora_core::models::{ActivityRecord, AssetType, Identity, NewActivityRecord};
use pixora_core::{normalize_ip, AppError};
use sqlx::{PgPool, Row};

/// Trait for activity recorder operations.
/// This abstracts the database implementation (PostgreSQL).
#[async_trait::async_trait]
pub trait ActivityRepositoryTrait: Send + Sync {
    /// Append one record; returns the assigned id. The recorder normalizes
    /// the IP before persisting so the stored `user_ip` is always
    /// subnet-grouped, never raw.
    async fn record(&self, activity: NewActivityRecord) -> Result<i64, AppError>;

    /// Most recent record for an identity, optionally filtered by asset type.
    async fn find_latest_by_identity(
        &self,
        identity: &Identity,
        asset_type: Option<AssetType>,
    ) -> Result<Option<ActivityRecord>, AppError>;

    /// Record that initiated an asynchronous generation, by vendor request id.
    async fn find_by_external_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<ActivityRecord>, AppError>;

    /// Number of chargeable generations for an identity since `since`.
    /// Basis for monthly quota counting on subscriber tiers.
    async fn count_chargeable_since(
        &self,
        identity: &Identity,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError>;

    /// Recent records for an identity, newest first.
    async fn list_recent(
        &self,
        identity: &Identity,
        limit: i64,
    ) -> Result<Vec<ActivityRecord>, AppError>;

    /// Correction path for async reconciliation; never used by `record`.
    async fn set_asset_url(&self, id: i64, asset_url: &str) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct PostgresActivityRepository {
    pool: PgPool,
}

impl PostgresActivityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Identity match clause: registered users are matched on user_id, anonymous
/// visitors on the normalized IP column.
fn identity_filter(identity: &Identity) -> (&'static str, &str) {
    match identity.user_id() {
        Some(uid) => ("user_id = $1", uid),
        None => ("user_ip = $1", identity.ledger_key()),
    }
}

#[async_trait::async_trait]
impl ActivityRepositoryTrait for PostgresActivityRepository {
    #[tracing::instrument(skip(self, activity), fields(
        db.system = "postgresql",
        db.table = "activity_records",
        db.operation = "insert"
    ))]
    async fn record(&self, activity: NewActivityRecord) -> Result<i64, AppError> {
        let user_ip = normalize_ip(&activity.user_ip);

        let row = sqlx::query(
            r#"
            INSERT INTO activity_records (
                asset_source, asset_type, credits_before, credits_after,
                asset_url, external_request_id, prompt, subscription_tier,
                user_id, user_ip
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(&activity.asset_source)
        .bind(activity.asset_type.code())
        .bind(activity.credits_before)
        .bind(activity.credits_after)
        .bind(&activity.asset_url)
        .bind(&activity.external_request_id)
        .bind(&activity.prompt)
        .bind(activity.subscription_tier)
        .bind(&activity.user_id)
        .bind(&user_ip)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                error = ?e,
                asset_type = activity.asset_type.code(),
                user_id = ?activity.user_id,
                "Failed to insert activity record"
            );
            AppError::Database(e)
        })?;

        Ok(row.get::<i64, _>("id"))
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = "activity_records",
        db.operation = "select"
    ))]
    async fn find_latest_by_identity(
        &self,
        identity: &Identity,
        asset_type: Option<AssetType>,
    ) -> Result<Option<ActivityRecord>, AppError> {
        let (filter, key) = identity_filter(identity);

        let record = match asset_type {
            Some(ty) => {
                let query = format!(
                    "SELECT * FROM activity_records WHERE {} AND asset_type = $2 \
                     ORDER BY created_at DESC LIMIT 1",
                    filter
                );
                sqlx::query_as::<_, ActivityRecord>(&query)
                    .bind(key)
                    .bind(ty.code())
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT * FROM activity_records WHERE {} \
                     ORDER BY created_at DESC LIMIT 1",
                    filter
                );
                sqlx::query_as::<_, ActivityRecord>(&query)
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        Ok(record)
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = "activity_records",
        db.operation = "select"
    ))]
    async fn find_by_external_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<ActivityRecord>, AppError> {
        let record = sqlx::query_as::<_, ActivityRecord>(
            "SELECT * FROM activity_records WHERE external_request_id = $1 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = "activity_records",
        db.operation = "count"
    ))]
    async fn count_chargeable_since(
        &self,
        identity: &Identity,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let (filter, key) = identity_filter(identity);
        let query = format!(
            "SELECT COUNT(*) AS n FROM activity_records \
             WHERE {} AND asset_type IN ('img', 'vid', 'edit') AND created_at >= $2",
            filter
        );

        let row = sqlx::query(&query)
            .bind(key)
            .bind(since)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get::<i64, _>("n"))
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = "activity_records",
        db.operation = "select"
    ))]
    async fn list_recent(
        &self,
        identity: &Identity,
        limit: i64,
    ) -> Result<Vec<ActivityRecord>, AppError> {
        let (filter, key) = identity_filter(identity);
        let query = format!(
            "SELECT * FROM activity_records WHERE {} ORDER BY created_at DESC LIMIT $2",
            filter
        );

        let records = sqlx::query_as::<_, ActivityRecord>(&query)
            .bind(key)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = "activity_records",
        db.operation = "update"
    ))]
    async fn set_asset_url(&self, id: i64, asset_url: &str) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE activity_records SET asset_url = $2 WHERE id = $1")
            .bind(id)
            .bind(asset_url)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Activity record {} not found", id)));
        }
        Ok(())
    }
}
