//! Request admission controller
//!
//! Orchestrates one generation request end to end: resolve identity, resolve
//! tier, charge credits, invoke the generation backend, settle (commit or
//! refund), and append the activity record.
//!
//! The charge is taken *before* the backend is invoked — the conditional
//! ledger update is what keeps two racing requests from both spending the
//! last credit — and refunded on any failure. The charge/invoke/settle
//! sequence runs inside a spawned task so a disconnecting client cannot
//! abandon an unsettled provisional charge.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use pixora_core::models::{
    resolve_tier, AssetType, CreditCosts, GenerationJob, GenerationRequest, GenerationResponse,
    Identity, InvokeOutcome, NewActivityRecord, TierInfo, FAILED_ASSET_URL,
};
use pixora_core::AppError;
use pixora_db::{ActivityRepositoryTrait, CreditLedgerRepositoryTrait, SubscriptionRepositoryTrait};

use super::generation::{await_completion, GenerationBackend};

/// Originating surface recorded on generation activity.
const GENERATION_SOURCE: &str = "web";

/// Tuning knobs for the admission controller, from configuration.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy {
    pub costs: CreditCosts,
    pub poll_interval: Duration,
    /// Overall wait bound for one generation, polling included
    pub deadline: Duration,
}

/// The admission controller. All collaborators are injected as trait objects
/// with explicit lifecycle — constructed once at startup, no hidden
/// singletons — so tests substitute doubles freely.
#[derive(Clone)]
pub struct AdmissionController {
    ledger: Arc<dyn CreditLedgerRepositoryTrait>,
    activity: Arc<dyn ActivityRepositoryTrait>,
    subscriptions: Arc<dyn SubscriptionRepositoryTrait>,
    backend: Arc<dyn GenerationBackend>,
    policy: AdmissionPolicy,
}

impl AdmissionController {
    pub fn new(
        ledger: Arc<dyn CreditLedgerRepositoryTrait>,
        activity: Arc<dyn ActivityRepositoryTrait>,
        subscriptions: Arc<dyn SubscriptionRepositoryTrait>,
        backend: Arc<dyn GenerationBackend>,
        policy: AdmissionPolicy,
    ) -> Self {
        Self {
            ledger,
            activity,
            subscriptions,
            backend,
            policy,
        }
    }

    /// Admit and execute one generation request.
    ///
    /// State machine: RESOLVE_IDENTITY → CHECK_BALANCE → (REJECT | PROCEED)
    /// → INVOKE_EXTERNAL → (SUCCESS_COMMIT | FAILURE_ROLLBACK) →
    /// RECORD_ACTIVITY → RESPOND.
    #[tracing::instrument(skip(self, request), fields(asset_type = asset_type.code()))]
    pub async fn admit_generation(
        &self,
        user_id: Option<String>,
        raw_ip: String,
        asset_type: AssetType,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, AppError> {
        // RESOLVE_IDENTITY: generation requires a signed-in user and a usable
        // client address. Rejections here have no side effects.
        let identity = self.resolve_generation_identity(user_id, &raw_ip)?;
        let tier = self.resolve_tier_for(&identity).await;

        // CHECK_BALANCE: subscribers inside their monthly ceiling are not
        // charged; everyone else pays the fixed per-action cost.
        let charge = self.effective_charge(&identity, &tier, asset_type).await?;
        let balance_after_charge = self.apply_charge(&identity, charge).await?;
        let balance_before = balance_after_charge + charge;

        // INVOKE_EXTERNAL + settle. Spawned so client disconnects cannot
        // abandon the provisional charge: the task always runs to settlement.
        let controller = self.clone();
        let identity_for_task = identity.clone();
        let outcome = tokio::spawn(async move {
            controller
                .invoke_and_settle(
                    identity_for_task,
                    tier,
                    asset_type,
                    request,
                    charge,
                    balance_before,
                )
                .await
        })
        .await
        .map_err(|e| AppError::Internal(format!("Generation task panicked: {}", e)))?;

        outcome
    }

    /// Append a non-chargeable upload activity. Anonymous uploads are
    /// accepted — they are metered by normalized IP.
    pub async fn record_upload(
        &self,
        user_id: Option<String>,
        raw_ip: String,
        asset_url: String,
        source: String,
    ) -> Result<i64, AppError> {
        let identity = Identity::resolve(user_id.as_deref(), Some(&raw_ip)).ok_or_else(|| {
            AppError::InvalidInput("A user id or valid client IP is required".to_string())
        })?;

        let tier = self.resolve_tier_for(&identity).await;
        let balance = self
            .ledger
            .get_balance(identity.user_id(), identity.normalized_ip())
            .await?
            .unwrap_or(0);

        self.activity
            .record(NewActivityRecord {
                asset_source: source,
                asset_type: AssetType::Upload,
                credits_before: balance,
                credits_after: balance,
                asset_url,
                external_request_id: None,
                prompt: String::new(),
                subscription_tier: tier.subscription_tier,
                user_id: identity.user_id().map(String::from),
                user_ip: identity.normalized_ip().unwrap_or_default().to_string(),
            })
            .await
    }

    /// Current balance for the caller's identity.
    pub async fn current_balance(
        &self,
        user_id: Option<&str>,
        raw_ip: &str,
    ) -> Result<Option<i64>, AppError> {
        let identity = Identity::resolve(user_id, Some(raw_ip));
        match identity {
            Some(id) => self.ledger.get_balance(id.user_id(), id.normalized_ip()).await,
            None => Ok(None),
        }
    }

    /// Reconcile a webhook-driven completion back to the record that
    /// initiated it. Returns the reconciled record id.
    pub async fn complete_async(
        &self,
        external_request_id: &str,
        asset_url: &str,
    ) -> Result<i64, AppError> {
        let record = self
            .activity
            .find_by_external_request_id(external_request_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "No activity for generation request {}",
                    external_request_id
                ))
            })?;

        self.activity.set_asset_url(record.id, asset_url).await?;
        tracing::info!(
            activity_id = record.id,
            external_request_id = %external_request_id,
            "Reconciled async generation completion"
        );
        Ok(record.id)
    }

    fn resolve_generation_identity(
        &self,
        user_id: Option<String>,
        raw_ip: &str,
    ) -> Result<Identity, AppError> {
        // Generation requires both halves: a genuine user id (else the
        // frontend shows its sign-in prompt) and a usable client address.
        match Identity::resolve(user_id.as_deref(), Some(raw_ip)) {
            Some(identity @ Identity::Both { .. }) => Ok(identity),
            Some(Identity::ByIp(_)) => Err(AppError::SignInRequired(
                "Sign in to generate images and videos".to_string(),
            )),
            Some(Identity::ByUser(_)) | None => Err(AppError::InvalidInput(
                "A valid client IP is required".to_string(),
            )),
        }
    }

    async fn resolve_tier_for(&self, identity: &Identity) -> TierInfo {
        let Some(user_id) = identity.user_id() else {
            return TierInfo::free();
        };
        match self.subscriptions.get_for_user(user_id).await {
            Ok(Some(sub)) => resolve_tier(&sub.product_name, &sub.status),
            Ok(None) => TierInfo::free(),
            Err(err) => {
                // A billing-projection outage must not block paying-by-credit
                // users; they just lose the subscriber shortcut this request.
                tracing::warn!(error = %err, user_id = %user_id, "Subscription lookup failed");
                TierInfo::free()
            }
        }
    }

    /// Credits to charge for this request: zero for subscribers inside their
    /// monthly ceiling, the fixed action cost otherwise.
    async fn effective_charge(
        &self,
        identity: &Identity,
        tier: &TierInfo,
        asset_type: AssetType,
    ) -> Result<i64, AppError> {
        let cost = self.policy.costs.cost_of(asset_type);
        if !tier.monthly_subscriber {
            return Ok(cost);
        }

        let used = self
            .activity
            .count_chargeable_since(identity, start_of_month(Utc::now()))
            .await?;
        if used < i64::from(tier.max_requests_per_month) {
            Ok(0)
        } else {
            tracing::info!(
                ledger_key = %identity.ledger_key(),
                used = used,
                cap = tier.max_requests_per_month,
                "Monthly ceiling reached; falling back to pay-per-credit"
            );
            Ok(cost)
        }
    }

    /// Provisionally decrement the charge. A missing balance row reads as a
    /// zero balance: the user was never provisioned or never bought credits.
    async fn apply_charge(&self, identity: &Identity, charge: i64) -> Result<i64, AppError> {
        if charge == 0 {
            return Ok(self
                .ledger
                .get_balance(identity.user_id(), identity.normalized_ip())
                .await?
                .unwrap_or(0));
        }

        match self.ledger.decrement(identity.ledger_key(), charge).await {
            Ok(new_balance) => Ok(new_balance),
            Err(AppError::NotFound(_)) => Err(AppError::InsufficientCredits {
                balance: 0,
                required: charge,
            }),
            Err(err) => Err(err),
        }
    }

    async fn invoke_and_settle(
        &self,
        identity: Identity,
        tier: TierInfo,
        asset_type: AssetType,
        request: GenerationRequest,
        charge: i64,
        balance_before: i64,
    ) -> Result<GenerationResponse, AppError> {
        let job = GenerationJob {
            asset_type,
            prompt: request.prompt.clone(),
            parameters: request.parameters,
        };

        let invocation = self.invoke_bounded(&job).await;

        match invocation {
            Ok((asset_url, external_request_id)) => {
                // SUCCESS_COMMIT. A lost audit record must not block
                // returning the asset: it was already produced.
                let activity_id = self
                    .try_record(NewActivityRecord {
                        asset_source: GENERATION_SOURCE.to_string(),
                        asset_type,
                        credits_before: balance_before,
                        credits_after: balance_before - charge,
                        asset_url: asset_url.clone(),
                        external_request_id,
                        prompt: request.prompt,
                        subscription_tier: tier.subscription_tier,
                        user_id: identity.user_id().map(String::from),
                        user_ip: identity.normalized_ip().unwrap_or_default().to_string(),
                    })
                    .await;

                Ok(GenerationResponse {
                    asset_url,
                    asset_type,
                    activity_id,
                    credits_remaining: balance_before - charge,
                })
            }
            Err(err) => {
                // FAILURE_ROLLBACK: restore the provisional charge, then
                // record the failed attempt with the restored balance.
                if charge > 0 {
                    if let Err(refund_err) =
                        self.ledger.increment(identity.ledger_key(), charge).await
                    {
                        tracing::error!(
                            error = %refund_err,
                            ledger_key = %identity.ledger_key(),
                            charge = charge,
                            "Failed to refund provisional charge"
                        );
                    }
                }

                self.try_record(NewActivityRecord {
                    asset_source: GENERATION_SOURCE.to_string(),
                    asset_type,
                    credits_before: balance_before,
                    credits_after: balance_before,
                    asset_url: FAILED_ASSET_URL.to_string(),
                    external_request_id: None,
                    prompt: request.prompt,
                    subscription_tier: tier.subscription_tier,
                    user_id: identity.user_id().map(String::from),
                    user_ip: identity.normalized_ip().unwrap_or_default().to_string(),
                })
                .await;

                Err(err)
            }
        }
    }

    /// Invoke the backend, polling accepted jobs under the deadline. Returns
    /// the asset URL and the vendor request id when one was assigned.
    async fn invoke_bounded(
        &self,
        job: &GenerationJob,
    ) -> Result<(String, Option<String>), AppError> {
        match self.backend.invoke(job).await? {
            InvokeOutcome::Completed { asset_url } => Ok((asset_url, None)),
            InvokeOutcome::Accepted { request_id } => {
                let asset_url = await_completion(
                    self.backend.as_ref(),
                    &request_id,
                    self.policy.poll_interval,
                    self.policy.deadline,
                )
                .await?;
                Ok((asset_url, Some(request_id)))
            }
        }
    }

    /// Record activity, logging instead of failing on persistence errors.
    async fn try_record(&self, record: NewActivityRecord) -> Option<i64> {
        match self.activity.record(record).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::error!(error = %err, "Failed to write activity record");
                None
            }
        }
    }
}

/// First instant of the current calendar month (UTC), the window start for
/// monthly quota counting.
fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pixora_core::models::{ActivityRecord, PollStatus};
    use pixora_db::SubscriptionRow;
    use std::collections::HashMap;
    use std::sync::Mutex;

    // ----- In-memory doubles -----

    #[derive(Default)]
    struct MemoryLedger {
        balances: Mutex<HashMap<String, i64>>,
    }

    impl MemoryLedger {
        fn with_balance(key: &str, credits: i64) -> Arc<Self> {
            let ledger = Self::default();
            ledger
                .balances
                .lock()
                .unwrap()
                .insert(key.to_string(), credits);
            Arc::new(ledger)
        }

        fn balance(&self, key: &str) -> Option<i64> {
            self.balances.lock().unwrap().get(key).copied()
        }

        fn row_count(&self) -> usize {
            self.balances.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CreditLedgerRepositoryTrait for MemoryLedger {
        async fn get_balance(
            &self,
            user_id: Option<&str>,
            user_ip: Option<&str>,
        ) -> Result<Option<i64>, AppError> {
            let balances = self.balances.lock().unwrap();
            if let Some(uid) = user_id.filter(|id| !id.is_empty()) {
                return Ok(balances.get(uid).copied());
            }
            if let Some(ip) = user_ip.filter(|ip| !ip.is_empty()) {
                return Ok(balances.get(ip).copied());
            }
            Ok(None)
        }

        async fn decrement(&self, identity_key: &str, amount: i64) -> Result<i64, AppError> {
            let mut balances = self.balances.lock().unwrap();
            let Some(balance) = balances.get_mut(identity_key) else {
                return Err(AppError::NotFound(format!(
                    "No credit balance for identity {}",
                    identity_key
                )));
            };
            if *balance < amount {
                return Err(AppError::InsufficientCredits {
                    balance: *balance,
                    required: amount,
                });
            }
            *balance -= amount;
            Ok(*balance)
        }

        async fn increment(&self, identity_key: &str, amount: i64) -> Result<i64, AppError> {
            let mut balances = self.balances.lock().unwrap();
            let balance = balances.entry(identity_key.to_string()).or_insert(0);
            *balance += amount;
            Ok(*balance)
        }

        async fn provision_new_user(&self, user_id: &str, grant: i64) -> Result<(), AppError> {
            self.balances
                .lock()
                .unwrap()
                .entry(user_id.to_string())
                .or_insert(grant);
            Ok(())
        }

        async fn get_row(
            &self,
            identity_key: &str,
        ) -> Result<Option<pixora_core::models::CreditBalance>, AppError> {
            let now = Utc::now();
            Ok(self.balances.lock().unwrap().get(identity_key).map(|credits| {
                pixora_core::models::CreditBalance {
                    identity_key: identity_key.to_string(),
                    credits: *credits,
                    created_at: now,
                    updated_at: now,
                }
            }))
        }
    }

    #[derive(Default)]
    struct MemoryActivity {
        records: Mutex<Vec<ActivityRecord>>,
    }

    impl MemoryActivity {
        fn all(&self) -> Vec<ActivityRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActivityRepositoryTrait for MemoryActivity {
        async fn record(&self, activity: NewActivityRecord) -> Result<i64, AppError> {
            let mut records = self.records.lock().unwrap();
            let id = records.len() as i64 + 1;
            records.push(ActivityRecord {
                id,
                asset_source: activity.asset_source,
                asset_type: activity.asset_type.code().to_string(),
                credits_before: activity.credits_before,
                credits_after: activity.credits_after,
                asset_url: activity.asset_url,
                external_request_id: activity.external_request_id,
                created_at: Utc::now(),
                prompt: activity.prompt,
                subscription_tier: activity.subscription_tier,
                user_id: activity.user_id,
                user_ip: pixora_core::normalize_ip(&activity.user_ip),
            });
            Ok(id)
        }

        async fn find_latest_by_identity(
            &self,
            identity: &Identity,
            asset_type: Option<AssetType>,
        ) -> Result<Option<ActivityRecord>, AppError> {
            let records = self.records.lock().unwrap();
            Ok(records
                .iter()
                .rev()
                .find(|r| {
                    matches_identity(r, identity)
                        && asset_type.map_or(true, |ty| r.asset_type == ty.code())
                })
                .cloned())
        }

        async fn find_by_external_request_id(
            &self,
            request_id: &str,
        ) -> Result<Option<ActivityRecord>, AppError> {
            let records = self.records.lock().unwrap();
            Ok(records
                .iter()
                .rev()
                .find(|r| r.external_request_id.as_deref() == Some(request_id))
                .cloned())
        }

        async fn count_chargeable_since(
            &self,
            identity: &Identity,
            since: DateTime<Utc>,
        ) -> Result<i64, AppError> {
            let records = self.records.lock().unwrap();
            Ok(records
                .iter()
                .filter(|r| {
                    matches_identity(r, identity)
                        && r.created_at >= since
                        && ["img", "vid", "edit"].contains(&r.asset_type.as_str())
                })
                .count() as i64)
        }

        async fn list_recent(
            &self,
            identity: &Identity,
            limit: i64,
        ) -> Result<Vec<ActivityRecord>, AppError> {
            let records = self.records.lock().unwrap();
            Ok(records
                .iter()
                .rev()
                .filter(|r| matches_identity(r, identity))
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn set_asset_url(&self, id: i64, asset_url: &str) -> Result<(), AppError> {
            let mut records = self.records.lock().unwrap();
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| AppError::NotFound(format!("Activity record {} not found", id)))?;
            record.asset_url = asset_url.to_string();
            Ok(())
        }
    }

    fn matches_identity(record: &ActivityRecord, identity: &Identity) -> bool {
        match identity.user_id() {
            Some(uid) => record.user_id.as_deref() == Some(uid),
            None => record.user_ip == identity.ledger_key(),
        }
    }

    #[derive(Default)]
    struct MemorySubscriptions {
        rows: Mutex<HashMap<String, SubscriptionRow>>,
    }

    impl MemorySubscriptions {
        fn with_subscription(user_id: &str, product: &str, status: &str) -> Arc<Self> {
            let subs = Self::default();
            subs.rows.lock().unwrap().insert(
                user_id.to_string(),
                SubscriptionRow {
                    user_id: user_id.to_string(),
                    product_name: product.to_string(),
                    status: status.to_string(),
                    updated_at: Utc::now(),
                },
            );
            Arc::new(subs)
        }
    }

    #[async_trait]
    impl SubscriptionRepositoryTrait for MemorySubscriptions {
        async fn get_for_user(&self, user_id: &str) -> Result<Option<SubscriptionRow>, AppError> {
            Ok(self.rows.lock().unwrap().get(user_id).cloned())
        }
    }

    enum Script {
        Complete(&'static str),
        CompleteAsync(&'static str, &'static str),
        FailInvoke,
        NeverComplete,
    }

    struct ScriptedBackend {
        script: Script,
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn invoke(&self, _job: &GenerationJob) -> Result<InvokeOutcome, AppError> {
            match &self.script {
                Script::Complete(url) => Ok(InvokeOutcome::Completed {
                    asset_url: url.to_string(),
                }),
                Script::CompleteAsync(request_id, _) => Ok(InvokeOutcome::Accepted {
                    request_id: request_id.to_string(),
                }),
                Script::NeverComplete => Ok(InvokeOutcome::Accepted {
                    request_id: "req-hang".to_string(),
                }),
                Script::FailInvoke => {
                    Err(AppError::GenerationFailed("vendor rejected".to_string()))
                }
            }
        }

        async fn poll_status(&self, _request_id: &str) -> Result<PollStatus, AppError> {
            match &self.script {
                Script::CompleteAsync(_, url) => Ok(PollStatus::Completed {
                    asset_url: url.to_string(),
                }),
                Script::NeverComplete => Ok(PollStatus::Pending),
                _ => Ok(PollStatus::Failed {
                    reason: "unexpected poll".to_string(),
                }),
            }
        }
    }

    fn controller(
        ledger: Arc<MemoryLedger>,
        activity: Arc<MemoryActivity>,
        subscriptions: Arc<MemorySubscriptions>,
        script: Script,
    ) -> AdmissionController {
        AdmissionController::new(
            ledger,
            activity,
            subscriptions,
            Arc::new(ScriptedBackend { script }),
            AdmissionPolicy {
                costs: CreditCosts::default(),
                poll_interval: Duration::from_millis(1),
                deadline: Duration::from_millis(20),
            },
        )
    }

    fn image_request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            parameters: serde_json::Value::Null,
        }
    }

    // ----- Tests -----

    #[tokio::test]
    async fn test_new_user_first_generation_charges_one_credit() {
        let ledger = Arc::new(MemoryLedger::default());
        ledger.provision_new_user("user-1", 30).await.unwrap();
        let activity = Arc::new(MemoryActivity::default());
        let ctrl = controller(
            ledger.clone(),
            activity.clone(),
            Arc::new(MemorySubscriptions::default()),
            Script::Complete("https://cdn.example.com/a.png"),
        );

        let response = ctrl
            .admit_generation(
                Some("user-1".to_string()),
                "203.0.113.9".to_string(),
                AssetType::ImageGeneration,
                image_request("a red bicycle"),
            )
            .await
            .unwrap();

        assert_eq!(response.credits_remaining, 29);
        assert_eq!(ledger.balance("user-1"), Some(29));

        let records = activity.all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].credits_before, 30);
        assert_eq!(records[0].credits_after, 29);
        assert_eq!(records[0].asset_url, "https://cdn.example.com/a.png");
        assert_eq!(records[0].user_ip, "203.0.113.0");
    }

    #[tokio::test]
    async fn test_balance_after_n_generations() {
        let ledger = MemoryLedger::with_balance("user-1", 30);
        let activity = Arc::new(MemoryActivity::default());
        let ctrl = controller(
            ledger.clone(),
            activity.clone(),
            Arc::new(MemorySubscriptions::default()),
            Script::Complete("https://cdn.example.com/a.png"),
        );

        for _ in 0..5 {
            ctrl.admit_generation(
                Some("user-1".to_string()),
                "203.0.113.9".to_string(),
                AssetType::ImageGeneration,
                image_request("p"),
            )
            .await
            .unwrap();
        }

        assert_eq!(ledger.balance("user-1"), Some(25));
        assert_eq!(activity.all().len(), 5);
    }

    #[tokio::test]
    async fn test_anonymous_rejected_without_side_effects() {
        let ledger = Arc::new(MemoryLedger::default());
        let activity = Arc::new(MemoryActivity::default());
        let ctrl = controller(
            ledger.clone(),
            activity.clone(),
            Arc::new(MemorySubscriptions::default()),
            Script::Complete("https://cdn.example.com/a.png"),
        );

        let err = ctrl
            .admit_generation(
                None,
                "10.1.2.99".to_string(),
                AssetType::ImageGeneration,
                image_request("p"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::SignInRequired(_)));
        // No ledger row for the raw or normalized IP, no activity.
        assert_eq!(ledger.row_count(), 0);
        assert!(activity.all().is_empty());
    }

    #[tokio::test]
    async fn test_missing_ip_rejected_as_malformed() {
        let ctrl = controller(
            Arc::new(MemoryLedger::default()),
            Arc::new(MemoryActivity::default()),
            Arc::new(MemorySubscriptions::default()),
            Script::Complete("https://cdn.example.com/a.png"),
        );

        let err = ctrl
            .admit_generation(
                Some("user-1".to_string()),
                "unknown".to_string(),
                AssetType::ImageGeneration,
                image_request("p"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_insufficient_credits_rejected_before_invoke() {
        let ledger = MemoryLedger::with_balance("user-1", 2);
        let activity = Arc::new(MemoryActivity::default());
        let ctrl = controller(
            ledger.clone(),
            activity.clone(),
            Arc::new(MemorySubscriptions::default()),
            // Backend would fail loudly if it were reached.
            Script::FailInvoke,
        );

        let err = ctrl
            .admit_generation(
                Some("user-1".to_string()),
                "203.0.113.9".to_string(),
                AssetType::VideoGeneration,
                image_request("p"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InsufficientCredits { balance: 2, required: 5 }));
        assert_eq!(ledger.balance("user-1"), Some(2));
        assert!(activity.all().is_empty());
    }

    #[tokio::test]
    async fn test_unprovisioned_user_reads_as_zero_balance() {
        let ctrl = controller(
            Arc::new(MemoryLedger::default()),
            Arc::new(MemoryActivity::default()),
            Arc::new(MemorySubscriptions::default()),
            Script::Complete("https://cdn.example.com/a.png"),
        );

        let err = ctrl
            .admit_generation(
                Some("user-never-seen".to_string()),
                "203.0.113.9".to_string(),
                AssetType::ImageGeneration,
                image_request("p"),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::InsufficientCredits { balance: 0, required: 1 }
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_refunds_and_records_marker() {
        let ledger = MemoryLedger::with_balance("user-1", 30);
        let activity = Arc::new(MemoryActivity::default());
        let ctrl = controller(
            ledger.clone(),
            activity.clone(),
            Arc::new(MemorySubscriptions::default()),
            Script::FailInvoke,
        );

        let err = ctrl
            .admit_generation(
                Some("user-1".to_string()),
                "203.0.113.9".to_string(),
                AssetType::ImageGeneration,
                image_request("p"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::GenerationFailed(_)));
        assert_eq!(ledger.balance("user-1"), Some(30));

        let records = activity.all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].asset_url, FAILED_ASSET_URL);
        assert!(!records[0].is_success());
        // Balance restored: before == after.
        assert_eq!(records[0].credits_before, 30);
        assert_eq!(records[0].credits_after, 30);
    }

    #[tokio::test]
    async fn test_timeout_after_provisional_charge_restores_balance() {
        let ledger = MemoryLedger::with_balance("user-1", 30);
        let activity = Arc::new(MemoryActivity::default());
        let ctrl = controller(
            ledger.clone(),
            activity.clone(),
            Arc::new(MemorySubscriptions::default()),
            Script::NeverComplete,
        );

        let err = ctrl
            .admit_generation(
                Some("user-1".to_string()),
                "203.0.113.9".to_string(),
                AssetType::ImageGeneration,
                image_request("p"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::GenerationTimeout(_)));
        assert_eq!(ledger.balance("user-1"), Some(30));
        let records = activity.all();
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_success());
    }

    #[tokio::test]
    async fn test_async_completion_records_external_request_id() {
        let ledger = MemoryLedger::with_balance("user-1", 30);
        let activity = Arc::new(MemoryActivity::default());
        let ctrl = controller(
            ledger.clone(),
            activity.clone(),
            Arc::new(MemorySubscriptions::default()),
            Script::CompleteAsync("req-77", "https://cdn.example.com/v.mp4"),
        );

        let response = ctrl
            .admit_generation(
                Some("user-1".to_string()),
                "203.0.113.9".to_string(),
                AssetType::VideoGeneration,
                image_request("p"),
            )
            .await
            .unwrap();

        assert_eq!(response.asset_url, "https://cdn.example.com/v.mp4");
        assert_eq!(ledger.balance("user-1"), Some(25));
        let records = activity.all();
        assert_eq!(records[0].external_request_id.as_deref(), Some("req-77"));
    }

    #[tokio::test]
    async fn test_subscriber_in_quota_not_charged() {
        let ledger = MemoryLedger::with_balance("user-1", 10);
        let activity = Arc::new(MemoryActivity::default());
        let ctrl = controller(
            ledger.clone(),
            activity.clone(),
            MemorySubscriptions::with_subscription("user-1", "Pro", "active"),
            Script::Complete("https://cdn.example.com/a.png"),
        );

        let response = ctrl
            .admit_generation(
                Some("user-1".to_string()),
                "203.0.113.9".to_string(),
                AssetType::ImageGeneration,
                image_request("p"),
            )
            .await
            .unwrap();

        assert_eq!(response.credits_remaining, 10);
        assert_eq!(ledger.balance("user-1"), Some(10));

        let records = activity.all();
        assert_eq!(records[0].credits_before, records[0].credits_after);
        assert_eq!(records[0].subscription_tier, 2);
    }

    #[tokio::test]
    async fn test_subscriber_over_cap_pays_credits() {
        let ledger = MemoryLedger::with_balance("user-1", 10);
        let activity = Arc::new(MemoryActivity::default());

        // Pre-fill this month's ledger up to the Pro cap.
        let identity = Identity::resolve(Some("user-1"), Some("203.0.113.9")).unwrap();
        for _ in 0..200 {
            activity
                .record(NewActivityRecord {
                    asset_source: "web".to_string(),
                    asset_type: AssetType::ImageGeneration,
                    credits_before: 10,
                    credits_after: 10,
                    asset_url: "https://cdn.example.com/old.png".to_string(),
                    external_request_id: None,
                    prompt: String::new(),
                    subscription_tier: 2,
                    user_id: identity.user_id().map(String::from),
                    user_ip: "203.0.113.9".to_string(),
                })
                .await
                .unwrap();
        }

        let ctrl = controller(
            ledger.clone(),
            activity.clone(),
            MemorySubscriptions::with_subscription("user-1", "Pro", "active"),
            Script::Complete("https://cdn.example.com/a.png"),
        );

        let response = ctrl
            .admit_generation(
                Some("user-1".to_string()),
                "203.0.113.9".to_string(),
                AssetType::ImageGeneration,
                image_request("p"),
            )
            .await
            .unwrap();

        assert_eq!(response.credits_remaining, 9);
        assert_eq!(ledger.balance("user-1"), Some(9));
    }

    #[tokio::test]
    async fn test_upload_recorded_without_charge() {
        let ledger = MemoryLedger::with_balance("user-1", 7);
        let activity = Arc::new(MemoryActivity::default());
        let ctrl = controller(
            ledger.clone(),
            activity.clone(),
            Arc::new(MemorySubscriptions::default()),
            Script::Complete("unused"),
        );

        let id = ctrl
            .record_upload(
                Some("user-1".to_string()),
                "203.0.113.9".to_string(),
                "https://cdn.example.com/u.jpg".to_string(),
                "gallery-upload".to_string(),
            )
            .await
            .unwrap();

        assert_eq!(id, 1);
        assert_eq!(ledger.balance("user-1"), Some(7));
        let records = activity.all();
        assert_eq!(records[0].asset_type, "upl");
        assert_eq!(records[0].credits_before, 7);
        assert_eq!(records[0].credits_after, 7);
    }

    #[tokio::test]
    async fn test_complete_async_reconciles_initiating_record() {
        let ledger = MemoryLedger::with_balance("user-1", 30);
        let activity = Arc::new(MemoryActivity::default());
        let ctrl = controller(
            ledger,
            activity.clone(),
            Arc::new(MemorySubscriptions::default()),
            Script::CompleteAsync("req-5", "https://cdn.example.com/tmp.png"),
        );

        ctrl.admit_generation(
            Some("user-1".to_string()),
            "203.0.113.9".to_string(),
            AssetType::ImageGeneration,
            image_request("p"),
        )
        .await
        .unwrap();

        let record_id = ctrl
            .complete_async("req-5", "https://cdn.example.com/final.png")
            .await
            .unwrap();

        let records = activity.all();
        let record = records.iter().find(|r| r.id == record_id).unwrap();
        assert_eq!(record.asset_url, "https://cdn.example.com/final.png");

        let missing = ctrl
            .complete_async("req-unknown", "https://cdn.example.com/x.png")
            .await
            .unwrap_err();
        assert!(matches!(missing, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_current_balance_precedence() {
        let ledger = Arc::new(MemoryLedger::default());
        ledger.increment("user-1", 12).await.unwrap();
        ledger.increment("198.51.100.0", 3).await.unwrap();
        let ctrl = controller(
            ledger,
            Arc::new(MemoryActivity::default()),
            Arc::new(MemorySubscriptions::default()),
            Script::Complete("unused"),
        );

        // Signed-in: user key wins even with an IP present.
        let balance = ctrl
            .current_balance(Some("user-1"), "198.51.100.44")
            .await
            .unwrap();
        assert_eq!(balance, Some(12));

        // Anonymous: normalized IP key.
        let balance = ctrl.current_balance(None, "198.51.100.44").await.unwrap();
        assert_eq!(balance, Some(3));

        // Nothing usable.
        let balance = ctrl.current_balance(None, "unknown").await.unwrap();
        assert_eq!(balance, None);
    }

    #[test]
    fn test_start_of_month() {
        let now = Utc.with_ymd_and_hms(2026, 8, 6, 15, 30, 0).unwrap();
        let start = start_of_month(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap());
    }
}
