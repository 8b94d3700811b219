//! Application state and sub-state extractors.
//!
//! AppState is split into domain sub-states so handlers can extract only what
//! they need via Axum's `FromRef`, and to avoid a single god object.

use pixora_core::Config;
use pixora_db::{
    PostgresActivityRepository, PostgresCreditLedgerRepository, PostgresSubscriptionRepository,
};
use sqlx::PgPool;
use std::sync::Arc;

use crate::services::AdmissionController;

/// Database pool and concrete repositories.
#[derive(Clone)]
pub struct DbState {
    pub pool: PgPool,
    pub credit_ledger: PostgresCreditLedgerRepository,
    pub activity: PostgresActivityRepository,
    pub subscriptions: PostgresSubscriptionRepository,
}

/// Metering configuration that handlers consult directly.
#[derive(Clone)]
pub struct MeteringConfig {
    pub signup_credit_grant: i64,
    pub service_api_key: Option<String>,
}

// ----- AppState -----

/// Main application state: aggregates sub-states for dependency injection.
#[derive(Clone)]
pub struct AppState {
    pub db: DbState,
    pub admission: AdmissionController,
    pub metering: MeteringConfig,
    pub config: Config,
}

// ----- FromRef for sub-state extraction -----

impl axum::extract::FromRef<Arc<AppState>> for DbState {
    fn from_ref(state: &Arc<AppState>) -> Self {
        state.db.clone()
    }
}

impl axum::extract::FromRef<Arc<AppState>> for AdmissionController {
    fn from_ref(state: &Arc<AppState>) -> Self {
        state.admission.clone()
    }
}

impl axum::extract::FromRef<Arc<AppState>> for MeteringConfig {
    fn from_ref(state: &Arc<AppState>) -> Self {
        state.metering.clone()
    }
}

fn _assert_app_state_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<AppState>();
    assert_sync::<AppState>();
}
