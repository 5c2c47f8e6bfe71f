//! Subscription analytics
//!
//! Read-only rollups over subscription and history records. Nothing here is
//! cached; every call hits the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::types::{HistoryEventType, SubscriptionTier};
use crate::clock::Clock;
use crate::error::EngineResult;
use crate::store::PersistenceGateway;

/// Snapshot counts for `[period_start, period_end)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionAnalytics {
    pub total_active_subscriptions: i64,
    pub new_subscriptions_in_period: i64,
    pub cancelled_subscriptions_in_period: i64,
    pub expired_subscriptions_in_period: i64,
    /// Cents, summed across currencies
    pub revenue_in_period: i64,
    pub subscriptions_by_tier: BTreeMap<SubscriptionTier, i64>,
    pub total_free_users: i64,
    pub users_at_limit: i64,
    pub average_items_free: f64,
    pub average_items_paid: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl SubscriptionAnalytics {
    /// Net subscriber change over the window
    pub fn net_growth(&self) -> i64 {
        self.new_subscriptions_in_period
            - self.cancelled_subscriptions_in_period
            - self.expired_subscriptions_in_period
    }

    pub fn paid_subscriptions(&self) -> i64 {
        self.subscriptions_by_tier
            .iter()
            .filter(|(tier, _)| tier.is_paid())
            .map(|(_, count)| count)
            .sum()
    }
}

pub struct AnalyticsAggregator {
    store: Arc<dyn PersistenceGateway>,
    clock: Arc<dyn Clock>,
    free_item_limit: i64,
}

impl AnalyticsAggregator {
    pub fn new(store: Arc<dyn PersistenceGateway>, clock: Arc<dyn Clock>, free_item_limit: i64) -> Self {
        Self {
            store,
            clock,
            free_item_limit,
        }
    }

    pub async fn collect(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<SubscriptionAnalytics> {
        let now = self.clock.now();
        let store = &self.store;

        let subscriptions_by_tier: BTreeMap<SubscriptionTier, i64> =
            store.active_by_tier(now).await?.into_iter().collect();

        let analytics = SubscriptionAnalytics {
            total_active_subscriptions: store.count_active_subscriptions(now).await?,
            new_subscriptions_in_period: store
                .count_history_events(HistoryEventType::Purchase, start, end)
                .await?,
            cancelled_subscriptions_in_period: store
                .count_history_events(HistoryEventType::Cancellation, start, end)
                .await?,
            expired_subscriptions_in_period: store
                .count_history_events(HistoryEventType::Expiration, start, end)
                .await?,
            revenue_in_period: store.sum_revenue(start, end).await?,
            subscriptions_by_tier,
            total_free_users: store.count_free_accounts().await?,
            users_at_limit: store.count_accounts_at_limit(self.free_item_limit).await?,
            average_items_free: store.average_usage(false).await?,
            average_items_paid: store.average_usage(true).await?,
            period_start: start,
            period_end: end,
        };

        debug!(
            active = analytics.total_active_subscriptions,
            new = analytics.new_subscriptions_in_period,
            "Collected subscription analytics"
        );
        Ok(analytics)
    }
}
