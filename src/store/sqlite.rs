//! SQLite-backed persistence gateway
//!
//! A single connection behind a mutex; every call runs on the blocking
//! pool so async callers never stall the runtime. Timestamps are stored as
//! epoch milliseconds, enums as their text names.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use super::{PersistenceGateway, StoreError, StoreResult};
use crate::billing::{
    from_millis, AccountId, HistoryEventType, HistoryRecord, Page, ParseEnumError, Subscription,
    SubscriptionTier, VerificationRecord, VerificationStatus,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS subscriptions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL,
        tier TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        started_at INTEGER NOT NULL,
        expires_at INTEGER,
        last_verified_at INTEGER,
        purchase_token TEXT,
        product_id TEXT,
        order_id TEXT,
        current_usage INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        updated_at INTEGER,
        deleted_at INTEGER
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_live_account
        ON subscriptions(account_id) WHERE deleted_at IS NULL;

    CREATE TABLE IF NOT EXISTS verification_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL,
        subscription_id INTEGER,
        purchase_token TEXT NOT NULL,
        product_id TEXT NOT NULL,
        order_id TEXT,
        status TEXT NOT NULL,
        purchase_state TEXT,
        acknowledgement_state TEXT,
        purchase_time_millis INTEGER,
        start_time_millis INTEGER,
        expiry_time_millis INTEGER,
        auto_renewing INTEGER,
        price_amount_micros INTEGER,
        price_currency_code TEXT,
        country_code TEXT,
        raw_response TEXT,
        error_message TEXT,
        http_status INTEGER,
        duration_ms INTEGER,
        verification_type TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        completed_at INTEGER,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_verification_token
        ON verification_records(purchase_token, status);
    CREATE INDEX IF NOT EXISTS idx_verification_account
        ON verification_records(account_id, started_at DESC);

    CREATE TABLE IF NOT EXISTS history_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL,
        subscription_id INTEGER,
        event_type TEXT NOT NULL,
        previous_tier TEXT,
        new_tier TEXT,
        purchase_token TEXT,
        product_id TEXT,
        order_id TEXT,
        amount_paid INTEGER,
        currency TEXT,
        previous_expires_at INTEGER,
        new_expires_at INTEGER,
        metadata TEXT,
        error_message TEXT,
        source TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_history_account
        ON history_records(account_id, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_history_event
        ON history_records(event_type, created_at);

    CREATE TABLE IF NOT EXISTS usage_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        deleted_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_usage_items_account
        ON usage_items(account_id) WHERE deleted_at IS NULL;
"#;

const SUBSCRIPTION_COLUMNS: &str = "id, account_id, tier, is_active, started_at, expires_at, \
     last_verified_at, purchase_token, product_id, order_id, current_usage, version, \
     created_at, updated_at, deleted_at";

const VERIFICATION_COLUMNS: &str = "id, account_id, subscription_id, purchase_token, \
     product_id, order_id, status, purchase_state, acknowledgement_state, \
     purchase_time_millis, start_time_millis, expiry_time_millis, auto_renewing, \
     price_amount_micros, price_currency_code, country_code, raw_response, error_message, \
     http_status, duration_ms, verification_type, started_at, completed_at, created_at";

const HISTORY_COLUMNS: &str = "id, account_id, subscription_id, event_type, previous_tier, \
     new_tier, purchase_token, product_id, order_id, amount_paid, currency, \
     previous_expires_at, new_expires_at, metadata, error_message, source, created_at";

/// Live (non-deleted, active, unexpired) subscriptions; binds `?1` to now
const LIVE_FILTER: &str =
    "deleted_at IS NULL AND is_active = 1 AND (expires_at IS NULL OR expires_at > ?1)";

/// SQLite implementation of `PersistenceGateway`
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database file, creating parent directories
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("failed to create {:?}: {}", parent, e)))?;
        }

        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "Opened subscription database");
        Self::with_schema(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Record one owned item for an account, returning its id
    pub async fn add_usage_item(
        &self,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO usage_items (account_id, created_at) VALUES (?1, ?2)",
                params![account_id, now.timestamp_millis()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Soft-delete an owned item
    pub async fn remove_usage_item(&self, item_id: i64, now: DateTime<Utc>) -> StoreResult<usize> {
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "UPDATE usage_items SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
                params![now.timestamp_millis(), item_id],
            )?)
        })
        .await
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn opt_millis(time: Option<DateTime<Utc>>) -> Option<i64> {
    time.map(|t| t.timestamp_millis())
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    from_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(millis) => from_millis(millis)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis)),
        None => Ok(None),
    }
}

fn parse_text<T>(idx: usize, text: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let text: String = row.get(idx)?;
    parse_text(idx, &text)
}

fn opt_enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = ParseEnumError>,
{
    row.get::<_, Option<String>>(idx)?
        .map(|text| parse_text(idx, &text))
        .transpose()
}

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: row.get(0)?,
        account_id: row.get(1)?,
        tier: enum_col(row, 2)?,
        is_active: row.get(3)?,
        started_at: time_col(row, 4)?,
        expires_at: opt_time_col(row, 5)?,
        last_verified_at: opt_time_col(row, 6)?,
        purchase_token: row.get(7)?,
        product_id: row.get(8)?,
        order_id: row.get(9)?,
        current_usage: row.get(10)?,
        version: row.get(11)?,
        created_at: time_col(row, 12)?,
        updated_at: opt_time_col(row, 13)?,
        deleted_at: opt_time_col(row, 14)?,
    })
}

fn verification_from_row(row: &Row<'_>) -> rusqlite::Result<VerificationRecord> {
    Ok(VerificationRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        subscription_id: row.get(2)?,
        purchase_token: row.get(3)?,
        product_id: row.get(4)?,
        order_id: row.get(5)?,
        status: enum_col(row, 6)?,
        purchase_state: row.get(7)?,
        acknowledgement_state: row.get(8)?,
        purchase_time_millis: row.get(9)?,
        start_time_millis: row.get(10)?,
        expiry_time_millis: row.get(11)?,
        auto_renewing: row.get(12)?,
        price_amount_micros: row.get(13)?,
        price_currency_code: row.get(14)?,
        country_code: row.get(15)?,
        raw_response: row.get(16)?,
        error_message: row.get(17)?,
        http_status: row.get(18)?,
        duration_ms: row.get(19)?,
        verification_type: enum_col(row, 20)?,
        started_at: time_col(row, 21)?,
        completed_at: opt_time_col(row, 22)?,
        created_at: time_col(row, 23)?,
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        subscription_id: row.get(2)?,
        event_type: enum_col(row, 3)?,
        previous_tier: opt_enum_col(row, 4)?,
        new_tier: opt_enum_col(row, 5)?,
        purchase_token: row.get(6)?,
        product_id: row.get(7)?,
        order_id: row.get(8)?,
        amount_paid: row.get(9)?,
        currency: row.get(10)?,
        previous_expires_at: opt_time_col(row, 11)?,
        new_expires_at: opt_time_col(row, 12)?,
        metadata: row.get(13)?,
        error_message: row.get(14)?,
        source: enum_col(row, 15)?,
        created_at: time_col(row, 16)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl PersistenceGateway for SqliteStore {
    async fn find_active_subscription(
        &self,
        account_id: AccountId,
    ) -> StoreResult<Option<Subscription>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM subscriptions WHERE account_id = ?1 AND deleted_at IS NULL",
                SUBSCRIPTION_COLUMNS
            );
            Ok(conn
                .query_row(&sql, params![account_id], subscription_from_row)
                .optional()?)
        })
        .await
    }

    async fn create_subscription(&self, subscription: &Subscription) -> StoreResult<Subscription> {
        let mut sub = subscription.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO subscriptions (account_id, tier, is_active, started_at, expires_at,
                     last_verified_at, purchase_token, product_id, order_id, current_usage,
                     version, created_at, updated_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    sub.account_id,
                    sub.tier.as_str(),
                    sub.is_active,
                    sub.started_at.timestamp_millis(),
                    opt_millis(sub.expires_at),
                    opt_millis(sub.last_verified_at),
                    sub.purchase_token,
                    sub.product_id,
                    sub.order_id,
                    sub.current_usage,
                    sub.version,
                    sub.created_at.timestamp_millis(),
                    opt_millis(sub.updated_at),
                    opt_millis(sub.deleted_at),
                ],
            );

            match inserted {
                Ok(_) => {
                    sub.id = conn.last_insert_rowid();
                    Ok(sub)
                }
                Err(e) if is_unique_violation(&e) => {
                    Err(StoreError::DuplicateSubscription(sub.account_id))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> StoreResult<usize> {
        let sub = subscription.clone();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "UPDATE subscriptions SET
                     tier = ?1, is_active = ?2, started_at = ?3, expires_at = ?4,
                     last_verified_at = ?5, purchase_token = ?6, product_id = ?7,
                     order_id = ?8, current_usage = ?9, updated_at = ?10, deleted_at = ?11,
                     version = version + 1
                 WHERE id = ?12 AND version = ?13",
                params![
                    sub.tier.as_str(),
                    sub.is_active,
                    sub.started_at.timestamp_millis(),
                    opt_millis(sub.expires_at),
                    opt_millis(sub.last_verified_at),
                    sub.purchase_token,
                    sub.product_id,
                    sub.order_id,
                    sub.current_usage,
                    opt_millis(sub.updated_at),
                    opt_millis(sub.deleted_at),
                    sub.id,
                    expected_version,
                ],
            )?)
        })
        .await
    }

    async fn apply_usage_delta(
        &self,
        account_id: AccountId,
        delta: i64,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "UPDATE subscriptions
                 SET current_usage = current_usage + ?1, version = version + 1, updated_at = ?2
                 WHERE account_id = ?3 AND deleted_at IS NULL AND version = ?4
                   AND (?1 >= 0 OR current_usage + ?1 >= 0)",
                params![delta, now.timestamp_millis(), account_id, expected_version],
            )?)
        })
        .await
    }

    async fn set_usage(
        &self,
        account_id: AccountId,
        usage: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "UPDATE subscriptions
                 SET current_usage = ?1, version = version + 1, updated_at = ?2
                 WHERE account_id = ?3 AND deleted_at IS NULL",
                params![usage, now.timestamp_millis(), account_id],
            )?)
        })
        .await
    }

    async fn append_verification_record(&self, record: &VerificationRecord) -> StoreResult<i64> {
        let r = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO verification_records (account_id, subscription_id, purchase_token,
                     product_id, order_id, status, purchase_state, acknowledgement_state,
                     purchase_time_millis, start_time_millis, expiry_time_millis, auto_renewing,
                     price_amount_micros, price_currency_code, country_code, raw_response,
                     error_message, http_status, duration_ms, verification_type, started_at,
                     completed_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                params![
                    r.account_id,
                    r.subscription_id,
                    r.purchase_token,
                    r.product_id,
                    r.order_id,
                    r.status.as_str(),
                    r.purchase_state,
                    r.acknowledgement_state,
                    r.purchase_time_millis,
                    r.start_time_millis,
                    r.expiry_time_millis,
                    r.auto_renewing,
                    r.price_amount_micros,
                    r.price_currency_code,
                    r.country_code,
                    r.raw_response,
                    r.error_message,
                    r.http_status,
                    r.duration_ms,
                    r.verification_type.as_str(),
                    r.started_at.timestamp_millis(),
                    opt_millis(r.completed_at),
                    r.created_at.timestamp_millis(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn latest_successful_verification(
        &self,
        purchase_token: &str,
    ) -> StoreResult<Option<VerificationRecord>> {
        let token = purchase_token.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM verification_records
                 WHERE purchase_token = ?1 AND status = ?2
                 ORDER BY COALESCE(completed_at, started_at) DESC, id DESC
                 LIMIT 1",
                VERIFICATION_COLUMNS
            );
            Ok(conn
                .query_row(
                    &sql,
                    params![token, VerificationStatus::Success.as_str()],
                    verification_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn recent_verifications(
        &self,
        account_id: AccountId,
        limit: u32,
    ) -> StoreResult<Vec<VerificationRecord>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM verification_records
                 WHERE account_id = ?1
                 ORDER BY started_at DESC, id DESC
                 LIMIT ?2",
                VERIFICATION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![account_id, limit], verification_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn append_history_record(&self, record: &HistoryRecord) -> StoreResult<i64> {
        let r = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO history_records (account_id, subscription_id, event_type,
                     previous_tier, new_tier, purchase_token, product_id, order_id, amount_paid,
                     currency, previous_expires_at, new_expires_at, metadata, error_message,
                     source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    r.account_id,
                    r.subscription_id,
                    r.event_type.as_str(),
                    r.previous_tier.map(|t| t.as_str()),
                    r.new_tier.map(|t| t.as_str()),
                    r.purchase_token,
                    r.product_id,
                    r.order_id,
                    r.amount_paid,
                    r.currency,
                    opt_millis(r.previous_expires_at),
                    opt_millis(r.new_expires_at),
                    r.metadata,
                    r.error_message,
                    r.source.as_str(),
                    r.created_at.timestamp_millis(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn page_history(
        &self,
        account_id: AccountId,
        page_size: u32,
        page_number: u32,
    ) -> StoreResult<Page<HistoryRecord>> {
        let page_number = page_number.max(1);
        self.with_conn(move |conn| {
            let total_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM history_records WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT {} FROM history_records
                 WHERE account_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2 OFFSET ?3",
                HISTORY_COLUMNS
            );
            let offset = i64::from(page_number - 1) * i64::from(page_size);
            let mut stmt = conn.prepare(&sql)?;
            let items = stmt
                .query_map(params![account_id, page_size, offset], history_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Page {
                items,
                total_count,
                page_number,
                page_size,
            })
        })
        .await
    }

    async fn count_actual_usage_items(&self, account_id: AccountId) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM usage_items WHERE account_id = ?1 AND deleted_at IS NULL",
                params![account_id],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn count_active_subscriptions(&self, now: DateTime<Utc>) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT COUNT(*) FROM subscriptions WHERE {}", LIVE_FILTER);
            Ok(conn.query_row(&sql, params![now.timestamp_millis()], |row| row.get(0))?)
        })
        .await
    }

    async fn count_history_events(
        &self,
        event_type: HistoryEventType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM history_records
                 WHERE event_type = ?1 AND created_at >= ?2 AND created_at < ?3",
                params![
                    event_type.as_str(),
                    start.timestamp_millis(),
                    end.timestamp_millis()
                ],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn sum_revenue(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(SUM(amount_paid), 0) FROM history_records
                 WHERE event_type IN (?1, ?2, ?3) AND amount_paid > 0
                   AND created_at >= ?4 AND created_at < ?5",
                params![
                    HistoryEventType::Purchase.as_str(),
                    HistoryEventType::Renewal.as_str(),
                    HistoryEventType::Upgrade.as_str(),
                    start.timestamp_millis(),
                    end.timestamp_millis()
                ],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn count_free_accounts(&self) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM subscriptions WHERE deleted_at IS NULL AND tier = ?1",
                params![SubscriptionTier::Free.as_str()],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn active_by_tier(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<(SubscriptionTier, i64)>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT tier, COUNT(*) FROM subscriptions WHERE {} GROUP BY tier",
                LIVE_FILTER
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![now.timestamp_millis()], |row| {
                Ok((enum_col::<SubscriptionTier>(row, 0)?, row.get::<_, i64>(1)?))
            })?;

            let mut counts = rows.collect::<Result<Vec<_>, _>>()?;
            counts.sort_by_key(|(tier, _)| *tier);
            Ok(counts)
        })
        .await
    }

    async fn count_accounts_at_limit(&self, limit: i64) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM subscriptions
                 WHERE deleted_at IS NULL AND tier = ?1 AND current_usage >= ?2",
                params![SubscriptionTier::Free.as_str(), limit],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn average_usage(&self, paid: bool) -> StoreResult<f64> {
        self.with_conn(move |conn| {
            let comparison = if paid { "<>" } else { "=" };
            let sql = format!(
                "SELECT AVG(current_usage) FROM subscriptions
                 WHERE deleted_at IS NULL AND tier {} ?1",
                comparison
            );
            let average: Option<f64> = conn.query_row(
                &sql,
                params![SubscriptionTier::Free.as_str()],
                |row| row.get(0),
            )?;
            Ok(average.unwrap_or(0.0))
        })
        .await
    }
}
