//! Subscription state and verification
//!
//! This module handles:
//! - Subscription tiers and the per-account entitlement record
//! - Purchase verification, restoration and cancellation
//! - Item quota enforcement with optimistic usage counters
//! - A TTL cache in front of the store and periodic re-verification
//! - Read-only analytics over subscriptions and history

mod analytics;
mod cache;
mod catalog;
mod engine;
mod limits;
mod purchase;
mod restore;
mod scheduler;
mod types;
mod usage;

#[cfg(test)]
mod tests;

pub use analytics::{AnalyticsAggregator, SubscriptionAnalytics};
pub use cache::{CacheTicket, EntitlementCache, NoopCache, TtlCache, CACHE_TTL_MINUTES};
pub use catalog::{Product, ProductCatalog, ProductKind};
pub use engine::{EngineBuilder, SubscriptionEngine};
pub use limits::{QuotaCheck, QuotaPolicy, FREE_ITEM_LIMIT};
pub use purchase::{
    reconcile, Attempt, PurchaseProcessor, Reverified, Transition, VerifiedPurchase,
    MAX_WRITE_ATTEMPTS,
};
pub use restore::RestorationResolver;
pub use scheduler::{VerificationScheduler, VerificationTrigger};
#[allow(unused_imports)]
pub use types::{
    from_millis, AccountId, ChangeDirection, EventSource, HistoryEventType, HistoryRecord,
    OperationResult, Outcome, Page, ParseEnumError, Rejection, Subscription, SubscriptionTier,
    VerificationRecord, VerificationStatus, VerificationType, EXPIRING_SOON_DAYS, UNLIMITED,
    VERIFICATION_INTERVAL_HOURS,
};
pub use usage::QuotaLedger;
