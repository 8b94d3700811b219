//! Credit ledger repository
//!
//! One balance row per identity key (user id or normalized IP). All balance
//! mutations go through the conditional-update statements here so that the
//! database's native atomicity is the single guard against concurrent
//! overdraft: two decrements racing for the same row can never both pass the
//! `credits >= amount` predicate.

use pixora_core::models::CreditBalance;
use pixora_core::AppError;
use sqlx::{PgPool, Row};

/// Trait for credit ledger operations.
/// This abstracts the database implementation (PostgreSQL) so the admission
/// controller can be tested against an in-memory double.
#[async_trait::async_trait]
pub trait CreditLedgerRepositoryTrait: Send + Sync {
    /// Current balance for an identity. User id takes precedence: when a
    /// non-empty user id is given the lookup uses it alone; otherwise the
    /// normalized IP is used. `None` when no row exists or neither field
    /// carries a value.
    async fn get_balance(
        &self,
        user_id: Option<&str>,
        user_ip: Option<&str>,
    ) -> Result<Option<i64>, AppError>;

    /// Atomically subtract `amount`, failing without mutation if the balance
    /// would go negative. Returns the new balance.
    async fn decrement(&self, identity_key: &str, amount: i64) -> Result<i64, AppError>;

    /// Atomically add `amount`, creating the row lazily if the identity has
    /// never been seen. Returns the new balance.
    async fn increment(&self, identity_key: &str, amount: i64) -> Result<i64, AppError>;

    /// Insert the signup-grant row for a freshly registered user. Idempotent:
    /// re-provisioning an existing user leaves their balance untouched.
    async fn provision_new_user(&self, user_id: &str, grant: i64) -> Result<(), AppError>;

    /// Full balance row for one identity key, for support tooling.
    async fn get_row(&self, identity_key: &str) -> Result<Option<CreditBalance>, AppError>;
}

#[derive(Clone)]
pub struct PostgresCreditLedgerRepository {
    pool: PgPool,
}

impl PostgresCreditLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn balance_for_key(&self, key: &str) -> Result<Option<i64>, AppError> {
        let row = sqlx::query("SELECT credits FROM credit_balances WHERE identity_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("credits")))
    }
}

#[async_trait::async_trait]
impl CreditLedgerRepositoryTrait for PostgresCreditLedgerRepository {
    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = "credit_balances",
        db.operation = "select"
    ))]
    async fn get_balance(
        &self,
        user_id: Option<&str>,
        user_ip: Option<&str>,
    ) -> Result<Option<i64>, AppError> {
        // Resolution precedence: a present, non-empty user id queries by user
        // id only; otherwise the (already normalized) IP is the key.
        if let Some(uid) = user_id.filter(|id| !id.trim().is_empty()) {
            return self.balance_for_key(uid.trim()).await;
        }
        if let Some(ip) = user_ip.filter(|ip| !ip.trim().is_empty()) {
            return self.balance_for_key(ip.trim()).await;
        }
        Ok(None)
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = "credit_balances",
        db.operation = "update"
    ))]
    async fn decrement(&self, identity_key: &str, amount: i64) -> Result<i64, AppError> {
        let updated = sqlx::query(
            r#"
            UPDATE credit_balances
            SET credits = credits - $2, updated_at = now()
            WHERE identity_key = $1 AND credits >= $2
            RETURNING credits
            "#,
        )
        .bind(identity_key)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, identity_key = %identity_key, "Failed to decrement credits");
            AppError::Database(e)
        })?;

        match updated {
            Some(row) => Ok(row.get::<i64, _>("credits")),
            None => {
                // The conditional update did not match: either the row is
                // missing or the balance is short. Distinguish for the caller.
                match self.balance_for_key(identity_key).await? {
                    Some(balance) => Err(AppError::InsufficientCredits {
                        balance,
                        required: amount,
                    }),
                    None => Err(AppError::NotFound(format!(
                        "No credit balance for identity {}",
                        identity_key
                    ))),
                }
            }
        }
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = "credit_balances",
        db.operation = "upsert"
    ))]
    async fn increment(&self, identity_key: &str, amount: i64) -> Result<i64, AppError> {
        let row = sqlx::query(
            r#"
            INSERT INTO credit_balances (identity_key, credits)
            VALUES ($1, $2)
            ON CONFLICT (identity_key)
            DO UPDATE SET credits = credit_balances.credits + EXCLUDED.credits,
                          updated_at = now()
            RETURNING credits
            "#,
        )
        .bind(identity_key)
        .bind(amount)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, identity_key = %identity_key, "Failed to increment credits");
            AppError::Database(e)
        })?;

        Ok(row.get::<i64, _>("credits"))
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = "credit_balances",
        db.operation = "insert"
    ))]
    async fn provision_new_user(&self, user_id: &str, grant: i64) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO credit_balances (identity_key, credits)
            VALUES ($1, $2)
            ON CONFLICT (identity_key) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(grant)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, user_id = %user_id, "Failed to provision new user");
            AppError::Database(e)
        })?;

        tracing::info!(user_id = %user_id, grant = grant, "Provisioned signup credit grant");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = "credit_balances",
        db.operation = "select"
    ))]
    async fn get_row(&self, identity_key: &str) -> Result<Option<CreditBalance>, AppError> {
        let row = sqlx::query_as::<_, CreditBalance>(
            "SELECT identity_key, credits, created_at, updated_at \
             FROM credit_balances WHERE identity_key = $1",
        )
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
