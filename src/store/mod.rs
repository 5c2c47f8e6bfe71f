//! Persistence gateway
//!
//! The engine talks to durable storage only through `PersistenceGateway`.
//! `SqliteStore` is the bundled implementation.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::billing::{
    AccountId, HistoryEventType, HistoryRecord, Page, Subscription, SubscriptionTier,
    VerificationRecord,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("account {0} already has an active subscription")]
    DuplicateSubscription(AccountId),
    #[error("failed to open store: {0}")]
    Open(String),
    #[error("store task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage for subscription, verification and history records
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// The single non-deleted subscription for an account
    async fn find_active_subscription(
        &self,
        account_id: AccountId,
    ) -> StoreResult<Option<Subscription>>;

    /// Insert a new subscription and return it with its assigned id.
    ///
    /// Fails with `DuplicateSubscription` when the account already has one.
    async fn create_subscription(&self, subscription: &Subscription) -> StoreResult<Subscription>;

    /// Overwrite the record if its stored version still equals `expected_version`.
    ///
    /// The stored version becomes `expected_version + 1`. Returns rows affected.
    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> StoreResult<usize>;

    /// Add `delta` to the usage counter if the version matches and the
    /// result would not drop below zero. Returns rows affected.
    async fn apply_usage_delta(
        &self,
        account_id: AccountId,
        delta: i64,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<usize>;

    /// Unconditionally overwrite the usage counter
    async fn set_usage(
        &self,
        account_id: AccountId,
        usage: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<usize>;

    async fn append_verification_record(&self, record: &VerificationRecord) -> StoreResult<i64>;

    /// Most recent successful check for a purchase token, across accounts
    async fn latest_successful_verification(
        &self,
        purchase_token: &str,
    ) -> StoreResult<Option<VerificationRecord>>;

    async fn recent_verifications(
        &self,
        account_id: AccountId,
        limit: u32,
    ) -> StoreResult<Vec<VerificationRecord>>;

    async fn append_history_record(&self, record: &HistoryRecord) -> StoreResult<i64>;

    /// Newest-first page of history; `page_number` starts at 1
    async fn page_history(
        &self,
        account_id: AccountId,
        page_size: u32,
        page_number: u32,
    ) -> StoreResult<Page<HistoryRecord>>;

    /// Items the account actually holds, used to reseed the usage counter
    async fn count_actual_usage_items(&self, account_id: AccountId) -> StoreResult<i64>;

    /// Active, non-deleted subscriptions that have not expired at `now`
    async fn count_active_subscriptions(&self, now: DateTime<Utc>) -> StoreResult<i64>;

    /// History events of one type with `start <= created_at < end`
    async fn count_history_events(
        &self,
        event_type: HistoryEventType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<i64>;

    /// Sum of `amount_paid` (cents) over payment events in `[start, end)`
    async fn sum_revenue(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<i64>;

    async fn count_free_accounts(&self) -> StoreResult<i64>;

    async fn active_by_tier(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<(SubscriptionTier, i64)>>;

    /// Free accounts whose usage reached `limit`
    async fn count_accounts_at_limit(&self, limit: i64) -> StoreResult<i64>;

    /// Mean usage over free (`paid = false`) or paid accounts, 0 when none
    async fn average_usage(&self, paid: bool) -> StoreResult<f64>;
}
