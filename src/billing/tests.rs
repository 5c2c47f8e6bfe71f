//! Engine scenario tests
//!
//! End-to-end flows through `SubscriptionEngine` against an in-memory SQLite
//! store, a scripted billing provider and a manual clock:
//! - Default record creation and concurrent first reads
//! - Purchases, expiry discovered on read, renewal and reinstatement
//! - Restoration, cancellation and usage counters

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::*;
use crate::clock::{Clock, ManualClock};
use crate::config::EngineConfig;
use crate::store::{PersistenceGateway, SqliteStore, StoreResult};
use crate::verifier::testing::{product_answer, subscription_answer, ScriptedVerifier};
use crate::verifier::{AbortSignal, Acknowledger, VerifierError};

const ACCOUNT: AccountId = 42;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap()
}

fn never() -> AbortSignal {
    AbortSignal::never()
}

struct Harness {
    engine: SubscriptionEngine,
    store: Arc<SqliteStore>,
    verifier: Arc<ScriptedVerifier>,
    clock: Arc<ManualClock>,
}

impl Harness {
    async fn history(&self) -> Vec<HistoryRecord> {
        self.history_of(ACCOUNT).await
    }

    /// History without the row written when the default record was created
    async fn transitions(&self) -> Vec<HistoryRecord> {
        self.history()
            .await
            .into_iter()
            .filter(|r| r.event_type != HistoryEventType::Initial)
            .collect()
    }

    async fn history_of(&self, account_id: AccountId) -> Vec<HistoryRecord> {
        self.store
            .page_history(account_id, 100, 1)
            .await
            .unwrap()
            .items
    }

    async fn verifications(&self) -> Vec<VerificationRecord> {
        self.store.recent_verifications(ACCOUNT, 100).await.unwrap()
    }

    async fn stored(&self) -> Subscription {
        self.store
            .find_active_subscription(ACCOUNT)
            .await
            .unwrap()
            .expect("subscription should exist")
    }

    async fn buy(&self, purchase_token: &str, product_id: &str) -> Subscription {
        self.engine
            .process_purchase(ACCOUNT, purchase_token, product_id, &never())
            .await
            .unwrap()
            .expect("purchase should apply")
    }
}

fn harness(verifier: ScriptedVerifier) -> Harness {
    build_harness(verifier, EngineConfig::default(), None, Acknowledger::disabled())
}

fn build_harness(
    verifier: ScriptedVerifier,
    config: EngineConfig,
    cache: Option<Arc<dyn EntitlementCache>>,
    acknowledger: Acknowledger,
) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let verifier = Arc::new(verifier);
    let clock = Arc::new(ManualClock::new(start()));

    let mut builder = SubscriptionEngine::builder(store.clone(), verifier.clone())
        .config(config)
        .clock(clock.clone())
        .acknowledger(acknowledger);
    if let Some(cache) = cache {
        builder = builder.cache(cache);
    }

    Harness {
        engine: builder.build(),
        store,
        verifier,
        clock,
    }
}

fn monthly_until(expiry: DateTime<Utc>) -> ScriptedVerifier {
    ScriptedVerifier::new().with_subscription(
        "monthly_premium",
        "tok-m",
        Ok(subscription_answer(Some(expiry))),
    )
}

// ==================== Default record ====================

#[tokio::test]
async fn test_first_read_creates_free_subscription_once() {
    let h = harness(ScriptedVerifier::new());
    for _ in 0..3 {
        h.store.add_usage_item(ACCOUNT, start()).await.unwrap();
    }

    let first = h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    let second = h.engine.get_subscription(ACCOUNT, true, &never()).await.unwrap();

    assert_eq!(first.tier, SubscriptionTier::Free);
    assert!(first.is_active);
    assert_eq!(first.current_usage, 3, "seeded from owned items");
    assert_eq!(first.id, second.id);
    let events = h.history().await;
    assert_eq!(events.len(), 1, "creation is recorded once");
    assert_eq!(events[0].event_type, HistoryEventType::Initial);
    assert_eq!(events[0].previous_tier, None);
    assert_eq!(events[0].new_tier, Some(SubscriptionTier::Free));
    assert_eq!(events[0].source, EventSource::System);
    assert_eq!(events[0].subscription_id, Some(first.id));
    assert_eq!(events[0].change_direction(), ChangeDirection::Initial);
    assert!(h.verifier.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_reads_share_one_record() {
    let h = Arc::new(build_harness(
        ScriptedVerifier::new(),
        EngineConfig::default(),
        Some(Arc::new(NoopCache)),
        Acknowledger::disabled(),
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.engine
                .get_subscription(ACCOUNT, false, &AbortSignal::never())
                .await
                .unwrap()
                .id
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1, "all readers see the same record");

    let created: Vec<_> = h
        .history()
        .await
        .into_iter()
        .filter(|r| r.event_type == HistoryEventType::Initial)
        .collect();
    assert_eq!(created.len(), 1, "only the winning creator records the creation");
}

// ==================== Purchases ====================

#[tokio::test]
async fn test_free_account_at_limit_buys_yearly() {
    let token = "tok-yearly";
    let h = harness(ScriptedVerifier::new().with_subscription(
        "yearly_premium",
        token,
        Ok(subscription_answer(Some(start() + Duration::days(365)))),
    ));

    h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    assert!(h.engine.increment_usage(ACCOUNT, 500).await.unwrap());
    assert!(!h.engine.can_add_items(ACCOUNT).await.unwrap());
    assert_eq!(h.engine.remaining_items(ACCOUNT).await.unwrap(), 0);
    assert_eq!(
        h.engine.check_quota(ACCOUNT, 1).await.unwrap(),
        QuotaCheck::Denied { limit: 500, used: 500 }
    );

    let sub = h.buy(token, "yearly_premium").await;
    assert_eq!(sub.tier, SubscriptionTier::Yearly);
    assert!(sub.is_active);
    assert_eq!(sub.current_usage, 500);
    assert_eq!(sub.expires_at, Some(start() + Duration::days(365)));

    assert!(h.engine.can_add_items(ACCOUNT).await.unwrap());
    assert_eq!(h.engine.remaining_items(ACCOUNT).await.unwrap(), UNLIMITED);

    let events = h.transitions().await;
    assert_eq!(events.len(), 1);
    let purchase = &events[0];
    assert_eq!(purchase.event_type, HistoryEventType::Purchase);
    assert_eq!(purchase.previous_tier, Some(SubscriptionTier::Free));
    assert_eq!(purchase.new_tier, Some(SubscriptionTier::Yearly));
    assert_eq!(purchase.amount_paid, Some(499));
    assert_eq!(purchase.currency.as_deref(), Some("USD"));
    assert_eq!(purchase.purchase_token.as_deref(), Some(token));
    assert_eq!(purchase.source, EventSource::App);
    assert_eq!(purchase.change_direction(), ChangeDirection::Upgrade);

    let log = h.verifications().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, VerificationStatus::Success);
    assert_eq!(log[0].verification_type, VerificationType::Initial);
    assert!(log[0].duration_ms.is_some());
    assert_eq!(log[0].price_amount_micros, Some(4_990_000));
}

#[tokio::test]
async fn test_purchase_without_expiry_never_expires() {
    let h = harness(ScriptedVerifier::new().with_subscription(
        "monthly_premium",
        "tok-open",
        Ok(subscription_answer(None)),
    ));

    let sub = h.buy("tok-open", "monthly_premium").await;
    assert_eq!(sub.expires_at, None);
    assert!(!sub.is_expired(start() + Duration::days(3650)));

    h.clock.advance(Duration::days(400));
    let later = h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    assert_eq!(later.tier, SubscriptionTier::Monthly);
    assert!(later.is_active);
    assert_eq!(later.expires_at, None);
    assert_eq!(later.last_verified_at, Some(h.clock.now()));

    assert_eq!(h.transitions().await.len(), 1, "no renewal without an expiry");
    let log = h.verifications().await;
    assert_eq!(log.len(), 2);
    assert!(log
        .iter()
        .any(|r| r.verification_type == VerificationType::Periodic));
}

#[tokio::test]
async fn test_lifetime_purchase_is_one_time() {
    let h = harness(ScriptedVerifier::new().with_product(
        "lifetime_premium",
        "tok-life",
        Ok(product_answer()),
    ));

    let sub = h.buy("tok-life", "lifetime_premium").await;
    assert_eq!(sub.tier, SubscriptionTier::Lifetime);
    assert_eq!(sub.expires_at, None);
    assert_eq!(sub.order_id.as_deref(), Some("GPA.2222-3333"));

    let purchase = &h.transitions().await[0];
    assert_eq!(purchase.amount_paid, None);
    assert!(purchase
        .metadata
        .as_deref()
        .is_some_and(|m| m.contains("one_time")));
}

#[tokio::test]
async fn test_invalid_input_rejected_before_any_call() {
    let h = harness(ScriptedVerifier::new());

    let cases = [
        ("", "monthly_premium", Rejection::MissingPurchaseToken),
        ("   ", "monthly_premium", Rejection::MissingPurchaseToken),
        ("tok", "", Rejection::MissingProductId),
        (
            "tok",
            "gold_plan",
            Rejection::UnknownProduct {
                product_id: "gold_plan".to_string(),
            },
        ),
    ];
    for (token, product, expected) in cases {
        let outcome = h
            .engine
            .process_purchase(ACCOUNT, token, product, &never())
            .await
            .unwrap();
        assert_eq!(outcome, Err(expected));
    }

    assert!(h.verifier.calls().is_empty());
    assert!(h.verifications().await.is_empty());
    assert!(h.store.find_active_subscription(ACCOUNT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rejected_purchase_records_failure() {
    let h = harness(ScriptedVerifier::new());

    let outcome = h
        .engine
        .process_purchase(ACCOUNT, "tok-unknown", "monthly_premium", &never())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        Err(Rejection::VerificationFailed {
            http_status: Some(404),
            ..
        })
    ));

    let log = h.verifications().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, VerificationStatus::Failed);
    assert_eq!(log[0].http_status, Some(404));

    let sub = h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    assert_eq!(sub.tier, SubscriptionTier::Free);
    assert!(h.transitions().await.is_empty());
}

#[tokio::test]
async fn test_expired_purchase_not_applied() {
    let h = harness(monthly_until(start() - Duration::days(1)));

    let outcome = h
        .engine
        .process_purchase(ACCOUNT, "tok-m", "monthly_premium", &never())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Err(Rejection::PurchaseExpired {
            product_id: "monthly_premium".to_string()
        })
    );

    let log = h.verifications().await;
    assert_eq!(log[0].status, VerificationStatus::Failed);
    assert!(h.transitions().await.is_empty());
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let verifier = monthly_until(start() + Duration::days(30));
    verifier.set_delay(std::time::Duration::from_millis(300));
    let config = EngineConfig {
        verifier_timeout: std::time::Duration::from_millis(30),
        ..EngineConfig::default()
    };
    let h = build_harness(verifier, config, None, Acknowledger::disabled());

    let outcome = h
        .engine
        .process_purchase(ACCOUNT, "tok-m", "monthly_premium", &never())
        .await
        .unwrap();
    match outcome {
        Err(Rejection::VerificationFailed { message, .. }) => {
            assert!(message.contains("timed out"), "{}", message)
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(h.verifications().await[0].status, VerificationStatus::Failed);
}

#[tokio::test]
async fn test_aborted_purchase_makes_no_call() {
    let h = harness(monthly_until(start() + Duration::days(30)));
    let (handle, signal) = AbortSignal::new();
    handle.abort();

    let outcome = h
        .engine
        .process_purchase(ACCOUNT, "tok-m", "monthly_premium", &signal)
        .await
        .unwrap();
    assert!(matches!(outcome, Err(Rejection::VerificationFailed { .. })));
    assert!(h.verifier.calls().is_empty());
    assert!(h.store.find_active_subscription(ACCOUNT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unacknowledged_purchase_is_acknowledged_in_background() {
    let verifier = Arc::new(monthly_until(start() + Duration::days(30)));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let engine = SubscriptionEngine::builder(store, verifier.clone())
        .clock(Arc::new(ManualClock::new(start())))
        .acknowledger(Acknowledger::spawn(verifier.clone(), 4))
        .build();

    engine
        .process_purchase(ACCOUNT, "tok-m", "monthly_premium", &never())
        .await
        .unwrap()
        .unwrap();

    for _ in 0..50 {
        if !verifier.acknowledged().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(verifier.acknowledged(), vec!["tok-m".to_string()]);
}

// ==================== Periodic verification ====================

#[tokio::test]
async fn test_monthly_expiry_discovered_on_read() {
    let h = harness(monthly_until(start() - Duration::hours(2)));

    let mut seeded = Subscription::new_free(ACCOUNT, 12, start() - Duration::days(31));
    seeded.tier = SubscriptionTier::Monthly;
    seeded.purchase_token = Some("tok-m".to_string());
    seeded.product_id = Some("monthly_premium".to_string());
    seeded.expires_at = Some(start() + Duration::days(1));
    h.store.create_subscription(&seeded).await.unwrap();

    let sub = h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    assert_eq!(sub.tier, SubscriptionTier::Free);
    assert!(!sub.is_active);
    assert_eq!(sub.expires_at, Some(start() - Duration::hours(2)));
    assert_eq!(sub.last_verified_at, Some(start()));
    assert_eq!(h.stored().await.tier, SubscriptionTier::Free);

    let events = h.transitions().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, HistoryEventType::Expiration);
    assert_eq!(events[0].previous_tier, Some(SubscriptionTier::Monthly));
    assert_eq!(events[0].new_tier, Some(SubscriptionTier::Free));
    assert_eq!(events[0].source, EventSource::Billing);

    let log = h.verifications().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].verification_type, VerificationType::Periodic);
    assert_eq!(log[0].subscription_id, Some(sub.id));

    assert_eq!(h.engine.remaining_items(ACCOUNT).await.unwrap(), 488);
}

#[tokio::test]
async fn test_later_expiry_records_renewal() {
    let h = harness(monthly_until(start() + Duration::days(30)));
    h.buy("tok-m", "monthly_premium").await;

    h.clock.advance(Duration::days(25));
    let renewed_until = start() + Duration::days(60);
    h.verifier.set_subscription(
        "monthly_premium",
        "tok-m",
        Ok(subscription_answer(Some(renewed_until))),
    );

    let sub = h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    assert_eq!(sub.tier, SubscriptionTier::Monthly);
    assert_eq!(sub.expires_at, Some(renewed_until));

    let events = h.transitions().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, HistoryEventType::Renewal);
    assert_eq!(events[0].previous_expires_at, Some(start() + Duration::days(30)));
    assert_eq!(events[0].new_expires_at, Some(renewed_until));
    assert_eq!(events[0].amount_paid, Some(499));
}

#[tokio::test]
async fn test_lapsed_subscription_reinstated_by_valid_answer() {
    let h = harness(monthly_until(start() + Duration::days(30)));
    h.buy("tok-m", "monthly_premium").await;

    h.clock.advance(Duration::days(31));
    let lapsed = h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    assert_eq!(lapsed.tier, SubscriptionTier::Free);

    h.verifier.set_subscription(
        "monthly_premium",
        "tok-m",
        Ok(subscription_answer(Some(start() + Duration::days(61)))),
    );
    h.clock.advance(Duration::hours(24));
    let sub = h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();

    assert_eq!(sub.tier, SubscriptionTier::Monthly);
    assert!(sub.is_active);
    let events = h.transitions().await;
    assert_eq!(events[0].event_type, HistoryEventType::Renewal);
    assert_eq!(events[0].previous_tier, Some(SubscriptionTier::Free));
    assert_eq!(events[0].new_tier, Some(SubscriptionTier::Monthly));
}

#[tokio::test]
async fn test_provider_outage_keeps_last_known_state() {
    let h = harness(monthly_until(start() + Duration::days(30)));
    h.buy("tok-m", "monthly_premium").await;

    h.verifier.set_subscription(
        "monthly_premium",
        "tok-m",
        Err(VerifierError::Transport {
            status: Some(503),
            message: "service unavailable".to_string(),
        }),
    );
    h.clock.advance(Duration::hours(25));

    let sub = h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    assert_eq!(sub.tier, SubscriptionTier::Monthly);
    assert!(sub.is_active);

    let validated = h.engine.validate_subscription(ACCOUNT, &never()).await.unwrap();
    assert!(matches!(
        validated,
        Err(Rejection::VerificationFailed {
            http_status: Some(503),
            ..
        })
    ));

    let failed = h
        .verifications()
        .await
        .into_iter()
        .filter(|r| r.status == VerificationStatus::Failed)
        .count();
    assert_eq!(failed, 2);
    assert_eq!(h.transitions().await.len(), 1);
}

#[tokio::test]
async fn test_cache_serves_snapshot_until_ttl() {
    let h = harness(monthly_until(start() + Duration::days(30)));
    h.buy("tok-m", "monthly_premium").await;
    let cached = h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();

    h.store.set_usage(ACCOUNT, 77, start()).await.unwrap();
    let still_cached = h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    assert_eq!(still_cached.current_usage, cached.current_usage);

    h.clock.advance(Duration::minutes(31));
    let fresh = h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    assert_eq!(fresh.current_usage, 77);
    assert_eq!(h.verifier.calls().len(), 1, "within the interval no re-check");

    h.engine.get_subscription(ACCOUNT, true, &never()).await.unwrap();
    assert_eq!(h.verifier.calls().len(), 2, "forced refresh re-checks");
    assert!(h
        .verifications()
        .await
        .iter()
        .any(|r| r.verification_type == VerificationType::Manual));
}

// ==================== Cache consistency ====================

/// Gateway that can hold one subscription read after it has hit the store
struct GatedStore {
    inner: Arc<SqliteStore>,
    armed: AtomicBool,
    paused: Notify,
    release: Notify,
}

impl GatedStore {
    fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            paused: Notify::new(),
            release: Notify::new(),
        }
    }

    fn hold_next_read(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PersistenceGateway for GatedStore {
    async fn find_active_subscription(
        &self,
        account_id: AccountId,
    ) -> StoreResult<Option<Subscription>> {
        let found = self.inner.find_active_subscription(account_id).await;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.paused.notify_one();
            self.release.notified().await;
        }
        found
    }

    async fn create_subscription(&self, subscription: &Subscription) -> StoreResult<Subscription> {
        self.inner.create_subscription(subscription).await
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> StoreResult<usize> {
        self.inner.update_subscription(subscription, expected_version).await
    }

    async fn apply_usage_delta(
        &self,
        account_id: AccountId,
        delta: i64,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        self.inner
            .apply_usage_delta(account_id, delta, expected_version, now)
            .await
    }

    async fn set_usage(
        &self,
        account_id: AccountId,
        usage: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        self.inner.set_usage(account_id, usage, now).await
    }

    async fn append_verification_record(&self, record: &VerificationRecord) -> StoreResult<i64> {
        self.inner.append_verification_record(record).await
    }

    async fn latest_successful_verification(
        &self,
        purchase_token: &str,
    ) -> StoreResult<Option<VerificationRecord>> {
        self.inner.latest_successful_verification(purchase_token).await
    }

    async fn recent_verifications(
        &self,
        account_id: AccountId,
        limit: u32,
    ) -> StoreResult<Vec<VerificationRecord>> {
        self.inner.recent_verifications(account_id, limit).await
    }

    async fn append_history_record(&self, record: &HistoryRecord) -> StoreResult<i64> {
        self.inner.append_history_record(record).await
    }

    async fn page_history(
        &self,
        account_id: AccountId,
        page_size: u32,
        page_number: u32,
    ) -> StoreResult<Page<HistoryRecord>> {
        self.inner.page_history(account_id, page_size, page_number).await
    }

    async fn count_actual_usage_items(&self, account_id: AccountId) -> StoreResult<i64> {
        self.inner.count_actual_usage_items(account_id).await
    }

    async fn count_active_subscriptions(&self, now: DateTime<Utc>) -> StoreResult<i64> {
        self.inner.count_active_subscriptions(now).await
    }

    async fn count_history_events(
        &self,
        event_type: HistoryEventType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<i64> {
        self.inner.count_history_events(event_type, start, end).await
    }

    async fn sum_revenue(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<i64> {
        self.inner.sum_revenue(start, end).await
    }

    async fn count_free_accounts(&self) -> StoreResult<i64> {
        self.inner.count_free_accounts().await
    }

    async fn active_by_tier(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<(SubscriptionTier, i64)>> {
        self.inner.active_by_tier(now).await
    }

    async fn count_accounts_at_limit(&self, limit: i64) -> StoreResult<i64> {
        self.inner.count_accounts_at_limit(limit).await
    }

    async fn average_usage(&self, paid: bool) -> StoreResult<f64> {
        self.inner.average_usage(paid).await
    }
}

#[tokio::test]
async fn test_write_during_cache_miss_is_not_overwritten_by_stale_read() {
    let gated = Arc::new(GatedStore::new(Arc::new(SqliteStore::open_in_memory().unwrap())));
    let engine = Arc::new(
        SubscriptionEngine::builder(gated.clone(), Arc::new(ScriptedVerifier::new()))
            .clock(Arc::new(ManualClock::new(start())))
            .acknowledger(Acknowledger::disabled())
            .build(),
    );

    engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    assert!(engine.increment_usage(ACCOUNT, 499).await.unwrap());

    gated.hold_next_read();
    let reader = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .get_subscription(ACCOUNT, false, &AbortSignal::never())
                .await
                .unwrap()
        })
    };
    gated.paused.notified().await;

    // Commits and invalidates while the reader still holds usage 499
    assert!(engine.increment_usage(ACCOUNT, 1).await.unwrap());
    gated.release.notify_one();
    assert_eq!(reader.await.unwrap().current_usage, 499);

    assert!(!engine.can_add_items(ACCOUNT).await.unwrap());
    assert_eq!(engine.remaining_items(ACCOUNT).await.unwrap(), 0);
    assert_eq!(
        engine.get_subscription(ACCOUNT, false, &never()).await.unwrap().current_usage,
        500
    );
}

// ==================== Restoration ====================

#[tokio::test]
async fn test_restoration_with_only_third_token_valid() {
    let h = harness(ScriptedVerifier::new().with_subscription(
        "yearly_premium",
        "tok-c",
        Ok(subscription_answer(Some(start() + Duration::days(365)))),
    ));
    let tokens: Vec<String> = ["tok-a", "tok-b", "tok-c"]
        .iter()
        .map(|t| t.to_string())
        .collect();

    let sub = h
        .engine
        .restore_purchases(ACCOUNT, &tokens, &never())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.tier, SubscriptionTier::Yearly);
    assert_eq!(sub.purchase_token.as_deref(), Some("tok-c"));

    let log = h.verifications().await;
    for token in ["tok-a", "tok-b"] {
        let rows: Vec<_> = log.iter().filter(|r| r.purchase_token == token).collect();
        assert_eq!(rows.len(), 1, "one record for {}", token);
        assert_eq!(rows[0].status, VerificationStatus::Failed);
        assert_eq!(rows[0].verification_type, VerificationType::Manual);
    }
    let applied: Vec<_> = log.iter().filter(|r| r.purchase_token == "tok-c").collect();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].status, VerificationStatus::Success);
    assert_eq!(applied[0].product_id, "yearly_premium");

    let events = h.transitions().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].new_tier, Some(SubscriptionTier::Yearly));
}

#[tokio::test]
async fn test_restoration_reuses_known_product() {
    let h = harness(ScriptedVerifier::new().with_product(
        "lifetime_premium",
        "tok-life",
        Ok(product_answer()),
    ));
    h.engine
        .process_purchase(7, "tok-life", "lifetime_premium", &never())
        .await
        .unwrap()
        .unwrap();

    let sub = h
        .engine
        .restore_purchases(ACCOUNT, &["tok-life".to_string()], &never())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.tier, SubscriptionTier::Lifetime);
    assert_eq!(
        h.verifier.calls(),
        vec![
            "lifetime_premium:tok-life".to_string(),
            "lifetime_premium:tok-life".to_string()
        ],
        "no catalog probing once the product is known"
    );
}

#[tokio::test]
async fn test_restoration_without_usable_tokens() {
    let h = harness(ScriptedVerifier::new());

    let empty = h
        .engine
        .restore_purchases(ACCOUNT, &["".to_string(), "  ".to_string()], &never())
        .await
        .unwrap();
    assert_eq!(empty, Err(Rejection::NoPurchaseTokens));
    assert!(h.verifier.calls().is_empty());

    let unknown = h
        .engine
        .restore_purchases(ACCOUNT, &["tok-x".to_string()], &never())
        .await
        .unwrap();
    assert_eq!(unknown, Err(Rejection::NothingToRestore));
    assert_eq!(h.verifier.calls().len(), 3, "every catalog product probed");
    assert_eq!(h.verifications().await.len(), 1);
}

// ==================== Cancellation ====================

#[tokio::test]
async fn test_cancel_free_account_rejected() {
    let h = harness(ScriptedVerifier::new());
    let outcome = h.engine.cancel_subscription(ACCOUNT, "no reason", &never()).await.unwrap();
    assert_eq!(outcome, Err(Rejection::AlreadyFree));

    let rendered = OperationResult::from(outcome);
    assert!(!rendered.successful);
    assert_eq!(rendered.message.as_deref(), Some("User is already on free tier"));
}

#[tokio::test]
async fn test_cancel_drops_to_free_and_stops_renewal() {
    let h = harness(monthly_until(start() + Duration::days(30)));
    h.buy("tok-m", "monthly_premium").await;

    let outcome = h
        .engine
        .cancel_subscription(ACCOUNT, "too expensive", &never())
        .await
        .unwrap();
    assert_eq!(outcome, Ok(true));
    assert_eq!(h.verifier.cancelled(), vec!["tok-m".to_string()]);

    let stored = h.stored().await;
    assert_eq!(stored.tier, SubscriptionTier::Free);
    assert!(!stored.is_active);
    assert_eq!(stored.purchase_token, None);
    assert_eq!(stored.expires_at, Some(start() + Duration::days(30)));

    let events = h.transitions().await;
    assert_eq!(events[0].event_type, HistoryEventType::Cancellation);
    assert_eq!(events[0].previous_tier, Some(SubscriptionTier::Monthly));
    assert_eq!(events[0].purchase_token.as_deref(), Some("tok-m"));
    assert!(events[0]
        .metadata
        .as_deref()
        .is_some_and(|m| m.contains("too expensive")));

    let calls_before = h.verifier.calls().len();
    h.clock.advance(Duration::days(2));
    let sub = h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    assert_eq!(sub.tier, SubscriptionTier::Free);
    assert_eq!(h.verifier.calls().len(), calls_before, "cancelled record is not re-verified");
}

#[tokio::test]
async fn test_provider_refusal_leaves_subscription() {
    let h = harness(monthly_until(start() + Duration::days(30)));
    h.buy("tok-m", "monthly_premium").await;
    h.verifier.refuse_cancellation();

    let outcome = h.engine.cancel_subscription(ACCOUNT, "moving", &never()).await.unwrap();
    assert_eq!(outcome, Err(Rejection::ProviderCancelFailed));
    assert_eq!(h.stored().await.tier, SubscriptionTier::Monthly);
    assert_eq!(h.transitions().await.len(), 1);
}

#[tokio::test]
async fn test_aborted_cancellation_leaves_subscription() {
    let h = harness(monthly_until(start() + Duration::days(30)));
    h.buy("tok-m", "monthly_premium").await;
    let (handle, signal) = AbortSignal::new();
    handle.abort();

    let outcome = h
        .engine
        .cancel_subscription(ACCOUNT, "moving", &signal)
        .await
        .unwrap();
    assert_eq!(outcome, Err(Rejection::ProviderCancelFailed));
    assert!(h.verifier.cancelled().is_empty(), "no provider call after abort");
    assert_eq!(h.stored().await.tier, SubscriptionTier::Monthly);
    assert_eq!(h.transitions().await.len(), 1);
}

#[tokio::test]
async fn test_cancel_lifetime_skips_provider() {
    let h = harness(ScriptedVerifier::new().with_product(
        "lifetime_premium",
        "tok-life",
        Ok(product_answer()),
    ));
    h.buy("tok-life", "lifetime_premium").await;

    let outcome = h.engine.cancel_subscription(ACCOUNT, "refund", &never()).await.unwrap();
    assert_eq!(outcome, Ok(true));
    assert!(h.verifier.cancelled().is_empty());
}

// ==================== Usage ====================

#[tokio::test]
async fn test_usage_counter_guards() {
    let h = harness(ScriptedVerifier::new());

    assert!(!h.engine.increment_usage(ACCOUNT, 1).await.unwrap(), "no record yet");
    h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();

    assert!(!h.engine.increment_usage(ACCOUNT, 0).await.unwrap());
    assert!(!h.engine.decrement_usage(ACCOUNT, -3).await.unwrap());
    assert!(h.engine.increment_usage(ACCOUNT, 5).await.unwrap());
    assert!(!h.engine.decrement_usage(ACCOUNT, 10).await.unwrap(), "never below zero");
    assert!(h.engine.decrement_usage(ACCOUNT, 5).await.unwrap());
    assert_eq!(h.stored().await.current_usage, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_never_lose_updates() {
    let h = Arc::new(harness(ScriptedVerifier::new()));
    h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    h.store.set_usage(ACCOUNT, 495, start()).await.unwrap();
    let before = h.stored().await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.engine.increment_usage(ACCOUNT, 1).await.unwrap()
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap() {
            successes += 1;
        }
    }

    let after = h.stored().await;
    assert!(successes >= 1);
    assert_eq!(after.current_usage, 495 + successes);
    assert_eq!(after.version, before.version + successes);
}

#[tokio::test]
async fn test_refresh_reseeds_from_owned_items() {
    let h = harness(ScriptedVerifier::new());
    let mut ids = Vec::new();
    for _ in 0..7 {
        ids.push(h.store.add_usage_item(ACCOUNT, start()).await.unwrap());
    }
    h.store.remove_usage_item(ids[0], start()).await.unwrap();

    assert_eq!(h.engine.refresh_usage(ACCOUNT).await.unwrap(), 6);
    assert_eq!(h.stored().await.current_usage, 6);

    h.store.set_usage(ACCOUNT, 100, start()).await.unwrap();
    assert_eq!(h.engine.refresh_usage(ACCOUNT).await.unwrap(), 6);
    assert_eq!(h.stored().await.current_usage, 6);
}

// ==================== History and analytics ====================

#[tokio::test]
async fn test_history_paging_is_clamped() {
    let h = harness(ScriptedVerifier::new());
    let sub = h.engine.get_subscription(ACCOUNT, false, &never()).await.unwrap();
    for i in 0..5 {
        let record = HistoryRecord::new(
            &sub,
            HistoryEventType::Renewal,
            Some(SubscriptionTier::Monthly),
            Some(SubscriptionTier::Monthly),
            EventSource::Billing,
            start() + Duration::minutes(i),
        );
        h.store.append_history_record(&record).await.unwrap();
    }

    let page = h.engine.get_history(ACCOUNT, 10_000, 0).await.unwrap();
    assert_eq!(page.page_size, 100);
    assert_eq!(page.page_number, 1);
    assert_eq!(page.items.len(), 6, "five renewals after the creation row");
    assert_eq!(page.items[0].created_at, start() + Duration::minutes(4));
    assert_eq!(page.items[5].event_type, HistoryEventType::Initial);

    let last = h.engine.get_history(ACCOUNT, 2, 3).await.unwrap();
    assert_eq!(last.items.len(), 2);
    assert_eq!(last.total_count, 6);
    assert_eq!(last.total_pages(), 3);

    assert!(h.engine.verification_log(ACCOUNT, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_analytics_over_mixed_accounts() {
    let verifier = ScriptedVerifier::new()
        .with_subscription(
            "yearly_premium",
            "tok-1",
            Ok(subscription_answer(Some(start() + Duration::days(365)))),
        )
        .with_subscription(
            "monthly_premium",
            "tok-3",
            Ok(subscription_answer(Some(start() + Duration::days(30)))),
        );
    let h = harness(verifier);
    let e = &h.engine;

    e.process_purchase(1, "tok-1", "yearly_premium", &never())
        .await
        .unwrap()
        .unwrap();
    e.get_subscription(2, false, &never()).await.unwrap();
    assert!(e.increment_usage(2, 500).await.unwrap());
    e.process_purchase(3, "tok-3", "monthly_premium", &never())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(e.cancel_subscription(3, "switching", &never()).await.unwrap(), Ok(true));

    let analytics = e
        .get_analytics(start() - Duration::days(1), start() + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(analytics.total_active_subscriptions, 2);
    assert_eq!(analytics.new_subscriptions_in_period, 2);
    assert_eq!(analytics.cancelled_subscriptions_in_period, 1);
    assert_eq!(analytics.expired_subscriptions_in_period, 0);
    assert_eq!(analytics.revenue_in_period, 998);
    assert_eq!(analytics.subscriptions_by_tier.get(&SubscriptionTier::Yearly), Some(&1));
    assert_eq!(analytics.subscriptions_by_tier.get(&SubscriptionTier::Free), Some(&1));
    assert_eq!(analytics.total_free_users, 2);
    assert_eq!(analytics.users_at_limit, 1);
    assert_eq!(analytics.average_items_free, 250.0);
    assert_eq!(analytics.average_items_paid, 0.0);

    let later = e
        .get_analytics(start() + Duration::days(1), start() + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(later.new_subscriptions_in_period, 0);
    assert_eq!(h.history_of(3).await.len(), 3);
}
