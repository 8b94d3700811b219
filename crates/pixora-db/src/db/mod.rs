//! Database repositories for data access layer
//!
//! This module contains all repository implementations for database
//! operations. Each repository is responsible for a specific domain entity:
//! the credit ledger, the activity ledger, and the billing projection.

pub mod activity;
pub mod credit_ledger;
pub mod subscription;

pub use activity::{ActivityRepositoryTrait, PostgresActivityRepository};
pub use credit_ledger::{CreditLedgerRepositoryTrait, PostgresCreditLedgerRepository};
pub use subscription::{
    PostgresSubscriptionRepository, SubscriptionRepositoryTrait, SubscriptionRow,
};
