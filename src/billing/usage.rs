//! Usage counter maintenance
//!
//! The stored counter only moves through version-guarded deltas, so two
//! concurrent increments can never both apply against the same snapshot.
//! A lost race reports `false` rather than retrying; `refresh` reseeds the
//! counter from the items the account actually holds.

use std::sync::Arc;
use tracing::{debug, info};

use super::cache::EntitlementCache;
use super::purchase::PurchaseProcessor;
use super::types::AccountId;
use crate::clock::Clock;
use crate::error::EngineResult;
use crate::store::PersistenceGateway;

pub struct QuotaLedger {
    store: Arc<dyn PersistenceGateway>,
    cache: Arc<dyn EntitlementCache>,
    clock: Arc<dyn Clock>,
    processor: Arc<PurchaseProcessor>,
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn PersistenceGateway>,
        cache: Arc<dyn EntitlementCache>,
        clock: Arc<dyn Clock>,
        processor: Arc<PurchaseProcessor>,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            processor,
        }
    }

    /// Add `count` items. Not capped by the quota; callers check first.
    pub async fn increment(&self, account_id: AccountId, count: i64) -> EngineResult<bool> {
        if count <= 0 {
            return Ok(false);
        }
        self.apply_delta(account_id, count).await
    }

    /// Remove `count` items; refused when the counter would go negative
    pub async fn decrement(&self, account_id: AccountId, count: i64) -> EngineResult<bool> {
        if count <= 0 {
            return Ok(false);
        }
        self.apply_delta(account_id, -count).await
    }

    async fn apply_delta(&self, account_id: AccountId, delta: i64) -> EngineResult<bool> {
        let Some(current) = self.store.find_active_subscription(account_id).await? else {
            debug!(account_id, "No subscription to update usage on");
            return Ok(false);
        };

        let rows = self
            .store
            .apply_usage_delta(account_id, delta, current.version, self.clock.now())
            .await?;
        self.cache.invalidate(account_id);

        if rows == 0 {
            debug!(
                account_id,
                delta,
                usage = current.current_usage,
                "Usage update lost a race or would go negative"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Reseed the counter from the actual item count and return it
    pub async fn refresh(&self, account_id: AccountId) -> EngineResult<i64> {
        let actual = self.store.count_actual_usage_items(account_id).await?;
        let rows = self
            .store
            .set_usage(account_id, actual, self.clock.now())
            .await?;

        if rows == 0 {
            // First use: the default record is seeded from the same count
            self.processor.load_or_create(account_id).await?;
        }
        self.cache.invalidate(account_id);

        info!(account_id, usage = actual, "Refreshed usage count");
        Ok(actual)
    }
}
