//! Subscription engine
//!
//! The single entry point callers use. Reads go through the entitlement
//! cache, fall back to the store and re-verify with the billing provider when
//! the scheduler says a check is due. Every write invalidates the account's
//! cache entry.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use super::analytics::{AnalyticsAggregator, SubscriptionAnalytics};
use super::cache::{EntitlementCache, TtlCache};
use super::limits::{QuotaCheck, QuotaPolicy};
use super::purchase::PurchaseProcessor;
use super::restore::RestorationResolver;
use super::scheduler::VerificationScheduler;
use super::types::{AccountId, HistoryRecord, Outcome, Page, Subscription, VerificationRecord};
use super::usage::QuotaLedger;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::store::{PersistenceGateway, SqliteStore};
use crate::verifier::{AbortSignal, Acknowledger, BillingVerifier, GooglePlayVerifier};

pub struct SubscriptionEngine {
    store: Arc<dyn PersistenceGateway>,
    cache: Arc<dyn EntitlementCache>,
    clock: Arc<dyn Clock>,
    scheduler: VerificationScheduler,
    policy: QuotaPolicy,
    max_page_size: u32,
    processor: Arc<PurchaseProcessor>,
    resolver: RestorationResolver,
    ledger: QuotaLedger,
    analytics: AnalyticsAggregator,
}

/// Wires the engine's collaborators; unset parts fall back to defaults
pub struct EngineBuilder {
    store: Arc<dyn PersistenceGateway>,
    verifier: Arc<dyn BillingVerifier>,
    config: EngineConfig,
    cache: Option<Arc<dyn EntitlementCache>>,
    clock: Option<Arc<dyn Clock>>,
    acknowledger: Option<Acknowledger>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn EntitlementCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn acknowledger(mut self, acknowledger: Acknowledger) -> Self {
        self.acknowledger = Some(acknowledger);
        self
    }

    pub fn build(self) -> SubscriptionEngine {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(TtlCache::new(config.cache_ttl, clock.clone())));
        let acknowledger = self
            .acknowledger
            .unwrap_or_else(|| Acknowledger::spawn(self.verifier.clone(), config.ack_queue_capacity));

        let processor = Arc::new(PurchaseProcessor::new(
            self.store.clone(),
            self.verifier,
            config.catalog.clone(),
            clock.clone(),
            config.verifier_timeout,
            acknowledger,
        ));

        SubscriptionEngine {
            resolver: RestorationResolver::new(processor.clone(), self.store.clone(), clock.clone()),
            ledger: QuotaLedger::new(
                self.store.clone(),
                cache.clone(),
                clock.clone(),
                processor.clone(),
            ),
            analytics: AnalyticsAggregator::new(
                self.store.clone(),
                clock.clone(),
                config.free_item_limit,
            ),
            scheduler: VerificationScheduler::new(config.verification_interval),
            policy: QuotaPolicy::new(config.free_item_limit),
            max_page_size: config.max_page_size,
            store: self.store,
            cache,
            clock,
            processor,
        }
    }
}

impl SubscriptionEngine {
    pub fn builder(
        store: Arc<dyn PersistenceGateway>,
        verifier: Arc<dyn BillingVerifier>,
    ) -> EngineBuilder {
        EngineBuilder {
            store,
            verifier,
            config: EngineConfig::default(),
            cache: None,
            clock: None,
            acknowledger: None,
        }
    }

    /// Production wiring: SQLite at the configured path and the Google Play verifier
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        let path = config.resolve_database_path()?;
        let store = SqliteStore::open(&path)?;
        let verifier = GooglePlayVerifier::from_config(&config);
        info!(path = %path.display(), "Opened subscription engine");

        Ok(Self::builder(Arc::new(store), Arc::new(verifier))
            .config(config)
            .build())
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    /// Current entitlement, verifying with the provider when due
    pub async fn get_subscription(
        &self,
        account_id: AccountId,
        force_refresh: bool,
        abort: &AbortSignal,
    ) -> EngineResult<Subscription> {
        if !force_refresh {
            if let Some(cached) = self.cache.get(account_id) {
                debug!(account_id, "Subscription served from cache");
                return Ok(cached);
            }
        }

        let ticket = self.cache.ticket();
        let subscription = self.processor.load_or_create(account_id).await?;
        let subscription = match self.scheduler.due(&subscription, self.clock.now(), force_refresh) {
            Some(trigger) => {
                self.processor
                    .reverify(subscription, trigger, abort)
                    .await?
                    .subscription
            }
            None => subscription,
        };

        self.cache.put(account_id, subscription.clone(), ticket);
        Ok(subscription)
    }

    /// Forced provider check; a failed check is reported instead of swallowed
    pub async fn validate_subscription(
        &self,
        account_id: AccountId,
        abort: &AbortSignal,
    ) -> EngineResult<Outcome<Subscription>> {
        let ticket = self.cache.ticket();
        let current = self.processor.load_or_create(account_id).await?;
        let Some(trigger) = self.scheduler.due(&current, self.clock.now(), true) else {
            self.cache.put(account_id, current.clone(), ticket);
            return Ok(Ok(current));
        };

        let reverified = self.processor.reverify(current, trigger, abort).await?;
        self.cache
            .put(account_id, reverified.subscription.clone(), ticket);
        match reverified.failure {
            Some(failure) => Ok(Err(failure)),
            None => Ok(Ok(reverified.subscription)),
        }
    }

    pub async fn process_purchase(
        &self,
        account_id: AccountId,
        purchase_token: &str,
        product_id: &str,
        abort: &AbortSignal,
    ) -> EngineResult<Outcome<Subscription>> {
        let outcome = self
            .processor
            .process_purchase(account_id, purchase_token, product_id, abort)
            .await;
        self.cache.invalidate(account_id);
        outcome
    }

    pub async fn restore_purchases(
        &self,
        account_id: AccountId,
        purchase_tokens: &[String],
        abort: &AbortSignal,
    ) -> EngineResult<Outcome<Subscription>> {
        let outcome = self
            .resolver
            .restore(account_id, purchase_tokens, abort)
            .await;
        self.cache.invalidate(account_id);
        outcome
    }

    pub async fn cancel_subscription(
        &self,
        account_id: AccountId,
        reason: &str,
        abort: &AbortSignal,
    ) -> EngineResult<Outcome<bool>> {
        let outcome = self.processor.cancel(account_id, reason, abort).await;
        self.cache.invalidate(account_id);
        outcome
    }

    pub async fn can_add_items(&self, account_id: AccountId) -> EngineResult<bool> {
        let subscription = self
            .get_subscription(account_id, false, &AbortSignal::never())
            .await?;
        Ok(self.policy.can_add(&subscription))
    }

    /// Items left under the quota, `UNLIMITED` for paid tiers
    pub async fn remaining_items(&self, account_id: AccountId) -> EngineResult<i64> {
        let subscription = self
            .get_subscription(account_id, false, &AbortSignal::never())
            .await?;
        Ok(self.policy.remaining(&subscription))
    }

    pub async fn check_quota(&self, account_id: AccountId, requested: i64) -> EngineResult<QuotaCheck> {
        let subscription = self
            .get_subscription(account_id, false, &AbortSignal::never())
            .await?;
        Ok(self.policy.check(&subscription, requested))
    }

    pub async fn increment_usage(&self, account_id: AccountId, count: i64) -> EngineResult<bool> {
        self.ledger.increment(account_id, count).await
    }

    pub async fn decrement_usage(&self, account_id: AccountId, count: i64) -> EngineResult<bool> {
        self.ledger.decrement(account_id, count).await
    }

    pub async fn refresh_usage(&self, account_id: AccountId) -> EngineResult<i64> {
        self.ledger.refresh(account_id).await
    }

    /// Newest-first history; page size is clamped to the configured maximum
    pub async fn get_history(
        &self,
        account_id: AccountId,
        page_size: u32,
        page_number: u32,
    ) -> EngineResult<Page<HistoryRecord>> {
        let page_size = page_size.clamp(1, self.max_page_size.max(1));
        let page_number = page_number.max(1);
        Ok(self
            .store
            .page_history(account_id, page_size, page_number)
            .await?)
    }

    /// Most recent provider checks for the account
    pub async fn verification_log(
        &self,
        account_id: AccountId,
        limit: u32,
    ) -> EngineResult<Vec<VerificationRecord>> {
        let limit = limit.clamp(1, self.max_page_size.max(1));
        Ok(self.store.recent_verifications(account_id, limit).await?)
    }

    pub async fn get_analytics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<SubscriptionAnalytics> {
        self.analytics.collect(start, end).await
    }
}
