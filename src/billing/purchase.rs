//! Purchase processing
//!
//! Owns every entitlement transition for an account: seeding the default
//! free record, applying verified purchases, reconciling periodic checks and
//! cancelling. Each provider answer is persisted as a `VerificationRecord`
//! before the subscription row is touched, and the row itself is only ever
//! written with a version precondition.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::catalog::{Product, ProductCatalog, ProductKind};
use super::scheduler::VerificationTrigger;
use super::types::{
    AccountId, EventSource, HistoryEventType, HistoryRecord, Outcome, Rejection, Subscription,
    SubscriptionTier, VerificationRecord, VerificationStatus, VerificationType,
};
use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::store::{PersistenceGateway, StoreError};
use crate::verifier::{
    acknowledgement_label, guarded, token_fingerprint, AbortSignal, AcknowledgementJob,
    Acknowledger, BillingVerifier, ProductPurchase, SubscriptionPurchase, VerifierError,
};

/// Attempts at a version-guarded write before reporting a conflict
pub const MAX_WRITE_ATTEMPTS: usize = 3;

/// Provider answer for either product kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerifiedPurchase {
    Subscription(SubscriptionPurchase),
    OneTime(ProductPurchase),
}

impl VerifiedPurchase {
    /// None for one-time products and for subscriptions without an expiry
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Subscription(p) => p.expires_at(),
            Self::OneTime(_) => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Self::Subscription(p) => p.is_valid(),
            Self::OneTime(p) => p.is_valid(),
        }
    }

    pub fn order_id(&self) -> Option<&str> {
        match self {
            Self::Subscription(p) => p.order_id.as_deref(),
            Self::OneTime(p) => p.order_id.as_deref(),
        }
    }

    pub fn price_amount_micros(&self) -> Option<i64> {
        match self {
            Self::Subscription(p) => p.price_amount_micros,
            Self::OneTime(_) => None,
        }
    }

    pub fn currency(&self) -> Option<&str> {
        match self {
            Self::Subscription(p) => p.price_currency_code.as_deref(),
            Self::OneTime(_) => None,
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        match self {
            Self::Subscription(p) => p.is_acknowledged(),
            Self::OneTime(p) => p.is_acknowledged(),
        }
    }

    fn purchase_state_label(&self) -> &'static str {
        match self {
            Self::Subscription(p) => p.purchase_state_label(),
            Self::OneTime(p) => p.purchase_state_label(),
        }
    }

    /// Why this answer cannot grant an entitlement at `now`
    pub fn rejection(&self, product_id: &str, now: DateTime<Utc>) -> Option<Rejection> {
        if !self.is_valid() {
            return Some(Rejection::VerificationFailed {
                message: format!("purchase is {}", self.purchase_state_label()),
                http_status: None,
            });
        }
        if self.expires_at().is_some_and(|expiry| expiry <= now) {
            return Some(Rejection::PurchaseExpired {
                product_id: product_id.to_string(),
            });
        }
        None
    }

    fn fill_record(&self, record: &mut VerificationRecord) {
        record.order_id = self.order_id().map(str::to_string);
        record.purchase_state = Some(self.purchase_state_label().to_string());

        match self {
            Self::Subscription(p) => {
                record.acknowledgement_state =
                    acknowledgement_label(p.acknowledgement_state).map(str::to_string);
                record.start_time_millis = p.start_time_millis;
                record.expiry_time_millis = p.expiry_time_millis;
                record.auto_renewing = p.auto_renewing;
                record.price_amount_micros = p.price_amount_micros;
                record.price_currency_code = p.price_currency_code.clone();
                record.country_code = p.country_code.clone();
                record.raw_response = p.raw_response.clone();
            }
            Self::OneTime(p) => {
                record.acknowledgement_state =
                    acknowledgement_label(p.acknowledgement_state).map(str::to_string);
                record.purchase_time_millis = p.purchase_time_millis;
                record.country_code = p.region_code.clone();
                record.raw_response = p.raw_response.clone();
            }
        }

        if self.is_valid() {
            record.status = VerificationStatus::Success;
        } else {
            record.status = VerificationStatus::Failed;
            record.error_message = Some(format!("purchase is {}", self.purchase_state_label()));
        }
    }
}

/// One provider call and the audit row describing it
#[derive(Debug)]
pub struct Attempt {
    pub record: VerificationRecord,
    pub result: Result<VerifiedPurchase, VerifierError>,
}

/// Result of a periodic or forced verification
#[derive(Debug, Clone)]
pub struct Reverified {
    pub subscription: Subscription,
    /// Set when the provider could not confirm the purchase
    pub failure: Option<Rejection>,
}

impl Reverified {
    fn unchanged(subscription: Subscription) -> Self {
        Self {
            subscription,
            failure: None,
        }
    }

    fn failed(subscription: Subscription, failure: Rejection) -> Self {
        Self {
            subscription,
            failure: Some(failure),
        }
    }
}

/// Tier change produced by reconciling a provider answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub event: HistoryEventType,
    pub from: SubscriptionTier,
    pub to: SubscriptionTier,
}

/// Fold a provider answer into the stored record.
///
/// Expiry at or before `now` drops an active paid record to Free. A valid
/// answer reinstates a lapsed record, and a later expiry on an active record
/// counts as a renewal.
pub fn reconcile(
    current: &Subscription,
    product: &Product,
    purchase: &VerifiedPurchase,
    now: DateTime<Utc>,
) -> (Subscription, Option<Transition>) {
    let mut updated = current.clone();
    let expires_at = purchase.expires_at();
    updated.expires_at = expires_at;
    updated.last_verified_at = Some(now);
    updated.updated_at = Some(now);
    if let Some(order_id) = purchase.order_id() {
        updated.order_id = Some(order_id.to_string());
    }

    let still_valid = expires_at.map_or(true, |expiry| expiry > now);
    if !still_valid {
        updated.is_active = false;
        if current.is_active && current.tier.is_paid() {
            updated.tier = SubscriptionTier::Free;
            let transition = Transition {
                event: HistoryEventType::Expiration,
                from: current.tier,
                to: SubscriptionTier::Free,
            };
            return (updated, Some(transition));
        }
        return (updated, None);
    }

    updated.is_active = true;
    if !current.is_active || !current.tier.is_paid() {
        updated.tier = product.tier;
        let transition = Transition {
            event: HistoryEventType::Renewal,
            from: current.tier,
            to: product.tier,
        };
        return (updated, Some(transition));
    }

    match (current.expires_at, expires_at) {
        (Some(previous), Some(next)) if next > previous => {
            let transition = Transition {
                event: HistoryEventType::Renewal,
                from: current.tier,
                to: current.tier,
            };
            (updated, Some(transition))
        }
        _ => (updated, None),
    }
}

pub struct PurchaseProcessor {
    store: Arc<dyn PersistenceGateway>,
    verifier: Arc<dyn BillingVerifier>,
    catalog: ProductCatalog,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    acknowledger: Acknowledger,
}

impl PurchaseProcessor {
    pub fn new(
        store: Arc<dyn PersistenceGateway>,
        verifier: Arc<dyn BillingVerifier>,
        catalog: ProductCatalog,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        acknowledger: Acknowledger,
    ) -> Self {
        Self {
            store,
            verifier,
            catalog,
            clock,
            timeout,
            acknowledger,
        }
    }

    pub fn catalog(&self) -> &ProductCatalog {
        &self.catalog
    }

    /// The account's live record, creating the default free one on first use
    pub async fn load_or_create(&self, account_id: AccountId) -> EngineResult<Subscription> {
        if let Some(existing) = self.store.find_active_subscription(account_id).await? {
            return Ok(existing);
        }

        let usage = self.store.count_actual_usage_items(account_id).await?;
        let fresh = Subscription::new_free(account_id, usage, self.clock.now());

        match self.store.create_subscription(&fresh).await {
            Ok(created) => {
                let history = HistoryRecord::new(
                    &created,
                    HistoryEventType::Initial,
                    None,
                    Some(SubscriptionTier::Free),
                    EventSource::System,
                    created.created_at,
                );
                self.store.append_history_record(&history).await?;

                info!(account_id, usage, "Created default free subscription");
                Ok(created)
            }
            Err(StoreError::DuplicateSubscription(_)) => {
                debug!(account_id, "Subscription created concurrently, reading it back");
                self.store
                    .find_active_subscription(account_id)
                    .await?
                    .ok_or(EngineError::SubscriptionMissing(account_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ask the provider about a token without persisting anything
    pub async fn verify(
        &self,
        account_id: AccountId,
        product: &Product,
        purchase_token: &str,
        verification_type: VerificationType,
        abort: &AbortSignal,
    ) -> Attempt {
        let started_at = self.clock.now();
        let timer = Instant::now();

        let result = match product.kind {
            ProductKind::Subscription => guarded(
                self.verifier
                    .verify_subscription(&product.product_id, purchase_token),
                self.timeout,
                abort,
            )
            .await
            .map(VerifiedPurchase::Subscription),
            ProductKind::OneTime => guarded(
                self.verifier
                    .verify_one_time_purchase(&product.product_id, purchase_token),
                self.timeout,
                abort,
            )
            .await
            .map(VerifiedPurchase::OneTime),
        };

        let mut record = VerificationRecord::pending(
            account_id,
            purchase_token,
            &product.product_id,
            verification_type,
            started_at,
        );
        record.completed_at = Some(self.clock.now());
        record.duration_ms = Some(i64::try_from(timer.elapsed().as_millis()).unwrap_or(i64::MAX));

        match &result {
            Ok(purchase) => purchase.fill_record(&mut record),
            Err(e) => {
                debug!(
                    account_id,
                    product_id = %product.product_id,
                    token = %token_fingerprint(purchase_token),
                    error = %e,
                    "Provider did not confirm purchase"
                );
                record.status = VerificationStatus::Failed;
                record.error_message = Some(e.to_string());
                record.http_status = e.http_status();
            }
        }

        Attempt { record, result }
    }

    /// Verify and apply a purchase reported by the client
    pub async fn process_purchase(
        &self,
        account_id: AccountId,
        purchase_token: &str,
        product_id: &str,
        abort: &AbortSignal,
    ) -> EngineResult<Outcome<Subscription>> {
        let purchase_token = purchase_token.trim();
        let product_id = product_id.trim();
        if purchase_token.is_empty() {
            return Ok(Err(Rejection::MissingPurchaseToken));
        }
        if product_id.is_empty() {
            return Ok(Err(Rejection::MissingProductId));
        }
        let Some(product) = self.catalog.lookup(product_id).cloned() else {
            warn!(account_id, product_id, "Purchase for unknown product");
            return Ok(Err(Rejection::UnknownProduct {
                product_id: product_id.to_string(),
            }));
        };

        info!(
            account_id,
            product_id,
            token = %token_fingerprint(purchase_token),
            "Processing purchase"
        );

        let attempt = self
            .verify(
                account_id,
                &product,
                purchase_token,
                VerificationType::Initial,
                abort,
            )
            .await;
        self.settle(account_id, &product, purchase_token, attempt)
            .await
    }

    /// Persist a verification attempt and apply it when usable
    pub async fn settle(
        &self,
        account_id: AccountId,
        product: &Product,
        purchase_token: &str,
        attempt: Attempt,
    ) -> EngineResult<Outcome<Subscription>> {
        let Attempt { mut record, result } = attempt;
        let now = self.clock.now();

        let usable = match result {
            Err(e) => Err(Rejection::VerificationFailed {
                message: e.to_string(),
                http_status: e.http_status(),
            }),
            Ok(purchase) => match purchase.rejection(&product.product_id, now) {
                Some(rejection) => Err(rejection),
                None => Ok(purchase),
            },
        };

        if let Err(rejection) = &usable {
            if record.status == VerificationStatus::Success {
                record.status = VerificationStatus::Failed;
                record.error_message = Some(rejection.to_string());
            }
        }
        self.store.append_verification_record(&record).await?;

        match usable {
            Ok(purchase) => {
                self.apply_purchase(account_id, product, purchase_token, &purchase)
                    .await
            }
            Err(rejection) => {
                warn!(
                    account_id,
                    product_id = %product.product_id,
                    reason = %rejection,
                    "Purchase not applied"
                );
                Ok(Err(rejection))
            }
        }
    }

    async fn apply_purchase(
        &self,
        account_id: AccountId,
        product: &Product,
        purchase_token: &str,
        purchase: &VerifiedPurchase,
    ) -> EngineResult<Outcome<Subscription>> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.load_or_create(account_id).await?;
            let now = self.clock.now();

            let mut updated = current.clone();
            if current.tier != product.tier || !current.is_active {
                updated.started_at = now;
            }
            updated.tier = product.tier;
            updated.is_active = true;
            updated.expires_at = purchase.expires_at();
            updated.last_verified_at = Some(now);
            updated.purchase_token = Some(purchase_token.to_string());
            updated.product_id = Some(product.product_id.clone());
            updated.order_id = purchase.order_id().map(str::to_string);
            updated.updated_at = Some(now);

            if self.store.update_subscription(&updated, current.version).await? == 0 {
                debug!(account_id, attempt, "Subscription changed during purchase, retrying");
                continue;
            }
            updated.version = current.version + 1;

            let transition = Transition {
                event: HistoryEventType::Purchase,
                from: current.tier,
                to: updated.tier,
            };
            let history = self.history(
                &updated,
                &current,
                transition,
                EventSource::App,
                Some(purchase),
                now,
            );
            self.store.append_history_record(&history).await?;

            if !purchase.is_acknowledged() {
                self.acknowledge(product, purchase_token);
            }

            info!(
                account_id,
                previous = %current.tier,
                tier = %updated.tier,
                expires_at = ?updated.expires_at,
                "Applied purchase"
            );
            return Ok(Ok(updated));
        }

        warn!(account_id, "Gave up applying purchase after repeated concurrent updates");
        Ok(Err(Rejection::ConcurrentUpdate))
    }

    /// Re-check the stored purchase with the provider and reconcile.
    ///
    /// Provider failures leave the record untouched and are reported in
    /// `Reverified::failure`.
    pub async fn reverify(
        &self,
        current: Subscription,
        trigger: VerificationTrigger,
        abort: &AbortSignal,
    ) -> EngineResult<Reverified> {
        let account_id = current.account_id;
        let (Some(purchase_token), Some(product_id)) =
            (current.purchase_token.clone(), current.product_id.clone())
        else {
            return Ok(Reverified::unchanged(current));
        };
        if purchase_token.is_empty() {
            return Ok(Reverified::unchanged(current));
        }

        let Some(product) = self.catalog.lookup(&product_id).cloned() else {
            warn!(account_id, product_id, "Stored product is not in the catalog, skipping verification");
            return Ok(Reverified::failed(
                current,
                Rejection::UnknownProduct { product_id },
            ));
        };

        debug!(account_id, trigger = ?trigger, "Verifying subscription with provider");
        let Attempt { mut record, result } = self
            .verify(
                account_id,
                &product,
                &purchase_token,
                trigger.verification_type(),
                abort,
            )
            .await;
        record.subscription_id = Some(current.id);
        self.store.append_verification_record(&record).await?;

        let purchase = match result {
            Ok(purchase) if purchase.is_valid() => purchase,
            Ok(purchase) => {
                warn!(account_id, "Provider reports purchase is no longer valid, keeping record");
                let failure = Rejection::VerificationFailed {
                    message: format!("purchase is {}", purchase.purchase_state_label()),
                    http_status: None,
                };
                return Ok(Reverified::failed(current, failure));
            }
            Err(e) => {
                warn!(account_id, error = %e, "Verification failed, keeping last known subscription");
                let failure = Rejection::VerificationFailed {
                    message: e.to_string(),
                    http_status: e.http_status(),
                };
                return Ok(Reverified::failed(current, failure));
            }
        };

        if !purchase.is_acknowledged() {
            self.acknowledge(&product, &purchase_token);
        }

        let now = self.clock.now();
        let (mut updated, transition) = reconcile(&current, &product, &purchase, now);

        if self.store.update_subscription(&updated, current.version).await? == 0 {
            debug!(account_id, "Subscription changed during verification, using stored record");
            let latest = self.load_or_create(account_id).await?;
            return Ok(Reverified::unchanged(latest));
        }
        updated.version = current.version + 1;

        if let Some(transition) = transition {
            let history = self.history(
                &updated,
                &current,
                transition,
                EventSource::Billing,
                Some(&purchase),
                now,
            );
            self.store.append_history_record(&history).await?;
            info!(
                account_id,
                event = %transition.event,
                from = %transition.from,
                to = %transition.to,
                "Subscription changed after verification"
            );
        }

        Ok(Reverified::unchanged(updated))
    }

    /// Drop the account to Free, stopping provider renewal first
    pub async fn cancel(
        &self,
        account_id: AccountId,
        reason: &str,
        abort: &AbortSignal,
    ) -> EngineResult<Outcome<bool>> {
        let mut current = self.load_or_create(account_id).await?;
        if !current.tier.is_paid() {
            return Ok(Err(Rejection::AlreadyFree));
        }

        let renewing = current
            .product_id
            .as_deref()
            .and_then(|id| self.catalog.lookup(id))
            .filter(|product| product.kind == ProductKind::Subscription);
        if let (Some(product), Some(token)) = (renewing, current.purchase_token.as_deref()) {
            let call = async {
                Ok::<_, VerifierError>(
                    self.verifier
                        .cancel_subscription(&product.product_id, token)
                        .await,
                )
            };
            let accepted = match guarded(call, self.timeout, abort).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!(account_id, error = %e, "Cancellation call did not complete");
                    false
                }
            };

            if !accepted {
                warn!(account_id, "Provider refused cancellation, subscription left unchanged");
                return Ok(Err(Rejection::ProviderCancelFailed));
            }
        }

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let now = self.clock.now();
            let mut updated = current.clone();
            updated.tier = SubscriptionTier::Free;
            updated.is_active = false;
            updated.purchase_token = None;
            updated.product_id = None;
            updated.updated_at = Some(now);

            if self.store.update_subscription(&updated, current.version).await? == 1 {
                updated.version = current.version + 1;

                let transition = Transition {
                    event: HistoryEventType::Cancellation,
                    from: current.tier,
                    to: SubscriptionTier::Free,
                };
                let mut history =
                    self.history(&updated, &current, transition, EventSource::App, None, now);
                history.metadata = Some(serde_json::json!({ "reason": reason }).to_string());
                self.store.append_history_record(&history).await?;

                info!(account_id, previous = %current.tier, reason, "Cancelled subscription");
                return Ok(Ok(true));
            }

            debug!(account_id, attempt, "Subscription changed during cancellation, retrying");
            current = self.load_or_create(account_id).await?;
            if !current.tier.is_paid() {
                return Ok(Err(Rejection::AlreadyFree));
            }
        }

        Ok(Err(Rejection::ConcurrentUpdate))
    }

    fn acknowledge(&self, product: &Product, purchase_token: &str) {
        self.acknowledger.enqueue(AcknowledgementJob {
            kind: product.kind,
            product_id: product.product_id.clone(),
            purchase_token: purchase_token.to_string(),
        });
    }

    fn history(
        &self,
        updated: &Subscription,
        previous: &Subscription,
        transition: Transition,
        source: EventSource,
        purchase: Option<&VerifiedPurchase>,
        now: DateTime<Utc>,
    ) -> HistoryRecord {
        let mut history = HistoryRecord::new(
            updated,
            transition.event,
            Some(transition.from),
            Some(transition.to),
            source,
            now,
        );
        history.purchase_token = updated
            .purchase_token
            .clone()
            .or_else(|| previous.purchase_token.clone());
        history.product_id = updated
            .product_id
            .clone()
            .or_else(|| previous.product_id.clone());
        history.order_id = updated.order_id.clone();
        history.previous_expires_at = previous.expires_at;
        history.new_expires_at = updated.expires_at;

        if let Some(purchase) = purchase {
            let pays = matches!(
                transition.event,
                HistoryEventType::Purchase | HistoryEventType::Renewal
            );
            if pays {
                // Micros to cents
                history.amount_paid = purchase.price_amount_micros().map(|micros| micros / 10_000);
                history.currency = purchase.currency().map(str::to_string);
            }
            history.metadata = serde_json::to_string(purchase).ok();
        }
        history
    }
}
