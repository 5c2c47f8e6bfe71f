//! Item quota enforcement
//!
//! Free accounts are capped at a fixed number of vocabulary items.
//! Paid tiers have no cap and report `UNLIMITED` as their remaining count.

use serde::{Deserialize, Serialize};

use super::types::{Subscription, SubscriptionTier, UNLIMITED};

/// Default item cap for the free tier
pub const FREE_ITEM_LIMIT: i64 = 500;

/// Result of checking whether items may be added
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum QuotaCheck {
    #[serde(rename = "allowed")]
    Allowed { remaining: i64 },
    #[serde(rename = "denied")]
    Denied { limit: i64, used: i64 },
}

impl QuotaCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Tier-to-limit table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaPolicy {
    pub free_item_limit: i64,
}

impl QuotaPolicy {
    pub fn new(free_item_limit: i64) -> Self {
        Self { free_item_limit }
    }

    /// Item limit for a tier, `UNLIMITED` for paid tiers
    pub fn limit_for(&self, tier: SubscriptionTier) -> i64 {
        match tier {
            SubscriptionTier::Free => self.free_item_limit,
            SubscriptionTier::Monthly | SubscriptionTier::Yearly | SubscriptionTier::Lifetime => {
                UNLIMITED
            }
        }
    }

    pub fn can_add(&self, subscription: &Subscription) -> bool {
        subscription.tier.is_paid() || subscription.current_usage < self.free_item_limit
    }

    pub fn remaining(&self, subscription: &Subscription) -> i64 {
        if subscription.tier.is_paid() {
            return UNLIMITED;
        }
        (self.free_item_limit - subscription.current_usage).max(0)
    }

    /// Check whether `requested` more items fit in the quota
    pub fn check(&self, subscription: &Subscription, requested: i64) -> QuotaCheck {
        if subscription.tier.is_paid() {
            return QuotaCheck::Allowed {
                remaining: UNLIMITED,
            };
        }

        let remaining = self.remaining(subscription);
        if requested > remaining || remaining == 0 {
            return QuotaCheck::Denied {
                limit: self.free_item_limit,
                used: subscription.current_usage,
            };
        }

        QuotaCheck::Allowed {
            remaining: remaining - requested,
        }
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::new(FREE_ITEM_LIMIT)
    }
}
