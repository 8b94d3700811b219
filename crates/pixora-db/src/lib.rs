//! Pixora database layer
//!
//! PostgreSQL repositories for the credit ledger, the activity ledger, and
//! the billing subscription projection. Connection pools are constructed at
//! startup and injected; repositories are cheap to clone.

pub mod db;

pub use db::{
    ActivityRepositoryTrait, CreditLedgerRepositoryTrait, PostgresActivityRepository,
    PostgresCreditLedgerRepository, PostgresSubscriptionRepository, SubscriptionRepositoryTrait,
    SubscriptionRow,
};
