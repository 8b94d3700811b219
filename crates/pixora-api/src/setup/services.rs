//! Service and repository initialization
//!
//! Everything is constructed here, once, and handed to the router through
//! AppState — repositories and the admission controller are injectable
//! service objects with explicit lifecycle, not hidden singletons.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use pixora_core::Config;
use pixora_db::{
    PostgresActivityRepository, PostgresCreditLedgerRepository, PostgresSubscriptionRepository,
};
use sqlx::PgPool;

use crate::services::{AdmissionController, AdmissionPolicy, HttpGenerationBackend};
use crate::state::{AppState, DbState, MeteringConfig};

pub async fn initialize_services(config: &Config, pool: PgPool) -> Result<Arc<AppState>> {
    let credit_ledger = PostgresCreditLedgerRepository::new(pool.clone());
    let activity = PostgresActivityRepository::new(pool.clone());
    let subscriptions = PostgresSubscriptionRepository::new(pool.clone());

    let backend = HttpGenerationBackend::new(
        config.generation_base_url.clone(),
        config.generation_api_key.clone(),
    )?;

    let admission = AdmissionController::new(
        Arc::new(credit_ledger.clone()),
        Arc::new(activity.clone()),
        Arc::new(subscriptions.clone()),
        Arc::new(backend),
        AdmissionPolicy {
            costs: config.credit_costs(),
            poll_interval: Duration::from_millis(config.generation_poll_interval_ms),
            deadline: Duration::from_secs(config.generation_deadline_secs),
        },
    );

    tracing::info!(
        image_cost = config.image_generation_cost,
        video_cost = config.video_generation_cost,
        signup_grant = config.signup_credit_grant,
        deadline_secs = config.generation_deadline_secs,
        "Admission controller initialized"
    );

    Ok(Arc::new(AppState {
        db: DbState {
            pool,
            credit_ledger,
            activity,
            subscriptions,
        },
        admission,
        metering: MeteringConfig {
            signup_credit_grant: config.signup_credit_grant,
            service_api_key: config.service_api_key.clone(),
        },
        config: config.clone(),
    }))
}
