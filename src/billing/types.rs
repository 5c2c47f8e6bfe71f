//! Billing data types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::limits::QuotaPolicy;

/// Account identifier as issued by the surrounding user store
pub type AccountId = i64;

/// Value returned by `remaining` for tiers without an item quota
pub const UNLIMITED: i64 = -1;

/// Hours after which a verified snapshot must be re-checked with the provider
pub const VERIFICATION_INTERVAL_HOURS: i64 = 24;

/// Days before expiry at which a subscription counts as expiring soon
pub const EXPIRING_SOON_DAYS: i64 = 3;

/// Failed to parse a stored enum column
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Implements `as_str`, `Display` and `FromStr` for enums persisted as text columns
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.eq_ignore_ascii_case($text) {
                        return Ok(Self::$variant);
                    }
                )+
                Err(ParseEnumError {
                    kind: $kind,
                    value: s.to_string(),
                })
            }
        }
    };
}

/// Subscription tier, ordered from least to most entitlement
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SubscriptionTier {
    #[default]
    Free,
    Monthly,
    Yearly,
    Lifetime,
}

text_enum!(SubscriptionTier, "tier", {
    Free => "Free",
    Monthly => "Monthly",
    Yearly => "Yearly",
    Lifetime => "Lifetime",
});

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 4] = [
        SubscriptionTier::Free,
        SubscriptionTier::Monthly,
        SubscriptionTier::Yearly,
        SubscriptionTier::Lifetime,
    ];

    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

/// Outcome of a single check against the billing provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

text_enum!(VerificationStatus, "verification status", {
    Pending => "Pending",
    Success => "Success",
    Failed => "Failed",
});

/// Why a verification was performed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationType {
    #[default]
    Initial,
    Periodic,
    Manual,
    Renewal,
}

text_enum!(VerificationType, "verification type", {
    Initial => "Initial",
    Periodic => "Periodic",
    Manual => "Manual",
    Renewal => "Renewal",
});

/// Entitlement transition recorded in the history log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryEventType {
    /// Default free record created on first use
    Initial,
    Purchase,
    Upgrade,
    Downgrade,
    Renewal,
    Cancellation,
    Expiration,
    Verification,
}

text_enum!(HistoryEventType, "history event", {
    Initial => "Initial",
    Purchase => "Purchase",
    Upgrade => "Upgrade",
    Downgrade => "Downgrade",
    Renewal => "Renewal",
    Cancellation => "Cancellation",
    Expiration => "Expiration",
    Verification => "Verification",
});

/// Who triggered a history event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    #[default]
    App,
    Billing,
    Admin,
    System,
}

text_enum!(EventSource, "event source", {
    App => "App",
    Billing => "Billing",
    Admin => "Admin",
    System => "System",
});

/// Direction of a tier change, derived from the tier ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeDirection {
    Initial,
    Upgrade,
    Downgrade,
    NoChange,
    Change,
    Cancellation,
}

text_enum!(ChangeDirection, "change direction", {
    Initial => "Initial",
    Upgrade => "Upgrade",
    Downgrade => "Downgrade",
    NoChange => "No Change",
    Change => "Change",
    Cancellation => "Cancellation",
});

/// Converts provider epoch milliseconds, rejecting values chrono cannot represent
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

/// Entitlement record for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: i64,
    pub account_id: AccountId,
    pub tier: SubscriptionTier,
    pub is_active: bool,
    pub started_at: DateTime<Utc>,
    /// None means the entitlement never expires
    pub expires_at: Option<DateTime<Utc>>,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub purchase_token: Option<String>,
    pub product_id: Option<String>,
    pub order_id: Option<String>,
    pub current_usage: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Default record for an account that has never purchased anything
    pub fn new_free(account_id: AccountId, current_usage: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            account_id,
            tier: SubscriptionTier::Free,
            is_active: true,
            started_at: now,
            expires_at: None,
            last_verified_at: None,
            purchase_token: None,
            product_id: None,
            order_id: None,
            current_usage,
            version: 1,
            created_at: now,
            updated_at: None,
            deleted_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }

    pub fn expires_soon(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|expires| expires <= now + Duration::days(EXPIRING_SOON_DAYS))
    }

    /// True when never verified or last verified at least `interval` ago
    pub fn needs_verification(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        match self.last_verified_at {
            None => true,
            Some(verified) => verified <= now - interval,
        }
    }

    pub fn has_purchase_token(&self) -> bool {
        self.purchase_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Item limit for the tier under `policy`, `UNLIMITED` for paid tiers
    pub fn quota_limit(&self, policy: &QuotaPolicy) -> i64 {
        policy.limit_for(self.tier)
    }

    pub fn can_add(&self, policy: &QuotaPolicy) -> bool {
        policy.can_add(self)
    }

    pub fn remaining(&self, policy: &QuotaPolicy) -> i64 {
        policy.remaining(self)
    }
}

/// Audit row for one check against the billing provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRecord {
    pub id: i64,
    pub account_id: AccountId,
    pub subscription_id: Option<i64>,
    pub purchase_token: String,
    pub product_id: String,
    pub order_id: Option<String>,
    pub status: VerificationStatus,
    pub purchase_state: Option<String>,
    pub acknowledgement_state: Option<String>,
    pub purchase_time_millis: Option<i64>,
    pub start_time_millis: Option<i64>,
    pub expiry_time_millis: Option<i64>,
    pub auto_renewing: Option<bool>,
    pub price_amount_micros: Option<i64>,
    pub price_currency_code: Option<String>,
    pub country_code: Option<String>,
    pub raw_response: Option<String>,
    pub error_message: Option<String>,
    pub http_status: Option<u16>,
    pub duration_ms: Option<i64>,
    pub verification_type: VerificationType,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl VerificationRecord {
    /// Empty pending record for a token/product pair
    pub fn pending(
        account_id: AccountId,
        purchase_token: &str,
        product_id: &str,
        verification_type: VerificationType,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            account_id,
            subscription_id: None,
            purchase_token: purchase_token.to_string(),
            product_id: product_id.to_string(),
            order_id: None,
            status: VerificationStatus::Pending,
            purchase_state: None,
            acknowledgement_state: None,
            purchase_time_millis: None,
            start_time_millis: None,
            expiry_time_millis: None,
            auto_renewing: None,
            price_amount_micros: None,
            price_currency_code: None,
            country_code: None,
            raw_response: None,
            error_message: None,
            http_status: None,
            duration_ms: None,
            verification_type,
            started_at,
            completed_at: None,
            created_at: started_at,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == VerificationStatus::Success
            && self.error_message.as_deref().map_or(true, str::is_empty)
    }

    pub fn is_pending(&self) -> bool {
        self.status == VerificationStatus::Pending && self.completed_at.is_none()
    }

    pub fn is_purchase_active(&self, now: DateTime<Utc>) -> bool {
        self.purchase_state.as_deref() == Some("Purchased")
            && self
                .expiry_time_millis
                .map_or(true, |ms| ms > now.timestamp_millis())
    }

    /// Hours since the check completed
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        self.completed_at
            .map(|done| (now - done).num_seconds() as f64 / 3600.0)
            .unwrap_or(0.0)
    }

    /// Older than `interval`, so a fresh check is due
    pub fn is_stale(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        self.completed_at.is_some_and(|done| now - done > interval)
    }

    /// Price in currency units rather than micros
    pub fn price_amount(&self) -> Option<f64> {
        self.price_amount_micros.map(|m| m as f64 / 1_000_000.0)
    }

    pub fn expiry_time(&self) -> Option<DateTime<Utc>> {
        self.expiry_time_millis.and_then(from_millis)
    }
}

/// Audit row for one entitlement transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: i64,
    pub account_id: AccountId,
    pub subscription_id: Option<i64>,
    pub event_type: HistoryEventType,
    pub previous_tier: Option<SubscriptionTier>,
    pub new_tier: Option<SubscriptionTier>,
    pub purchase_token: Option<String>,
    pub product_id: Option<String>,
    pub order_id: Option<String>,
    /// Amount in cents
    pub amount_paid: Option<i64>,
    pub currency: Option<String>,
    pub previous_expires_at: Option<DateTime<Utc>>,
    pub new_expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<String>,
    pub error_message: Option<String>,
    pub source: EventSource,
    pub created_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn new(
        subscription: &Subscription,
        event_type: HistoryEventType,
        previous_tier: Option<SubscriptionTier>,
        new_tier: Option<SubscriptionTier>,
        source: EventSource,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            account_id: subscription.account_id,
            subscription_id: Some(subscription.id),
            event_type,
            previous_tier,
            new_tier,
            purchase_token: None,
            product_id: None,
            order_id: None,
            amount_paid: None,
            currency: None,
            previous_expires_at: None,
            new_expires_at: None,
            metadata: None,
            error_message: None,
            source,
            created_at: now,
        }
    }

    pub fn change_direction(&self) -> ChangeDirection {
        match (self.previous_tier, self.new_tier) {
            (None, Some(_)) => ChangeDirection::Initial,
            (Some(_), None) => ChangeDirection::Cancellation,
            (None, None) => ChangeDirection::Change,
            (Some(prev), Some(new)) if prev == new => ChangeDirection::NoChange,
            (Some(prev), Some(new)) if new > prev => ChangeDirection::Upgrade,
            (Some(_), Some(_)) => ChangeDirection::Downgrade,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.error_message.as_deref().map_or(true, str::is_empty)
    }

    pub fn is_payment_event(&self) -> bool {
        matches!(
            self.event_type,
            HistoryEventType::Purchase | HistoryEventType::Renewal | HistoryEventType::Upgrade
        ) && self.amount_paid.is_some_and(|amount| amount > 0)
    }
}

/// One page of an ordered scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: i64,
    pub page_number: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> i64 {
        if self.page_size == 0 {
            return 0;
        }
        let size = self.page_size as i64;
        (self.total_count + size - 1) / size
    }
}

/// Business-level failure returned to callers instead of an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum Rejection {
    #[serde(rename = "missingPurchaseToken")]
    MissingPurchaseToken,
    #[serde(rename = "missingProductId")]
    MissingProductId,
    #[serde(rename = "unknownProduct")]
    UnknownProduct { product_id: String },
    #[serde(rename = "verificationFailed")]
    VerificationFailed {
        message: String,
        http_status: Option<u16>,
    },
    #[serde(rename = "purchaseExpired")]
    PurchaseExpired { product_id: String },
    #[serde(rename = "alreadyFree")]
    AlreadyFree,
    #[serde(rename = "providerCancelFailed")]
    ProviderCancelFailed,
    #[serde(rename = "noPurchaseTokens")]
    NoPurchaseTokens,
    #[serde(rename = "nothingToRestore")]
    NothingToRestore,
    #[serde(rename = "concurrentUpdate")]
    ConcurrentUpdate,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingPurchaseToken => write!(f, "Purchase token is required"),
            Self::MissingProductId => write!(f, "Product id is required"),
            Self::UnknownProduct { product_id } => {
                write!(f, "Unknown product: {}", product_id)
            }
            Self::VerificationFailed { message, .. } => {
                write!(f, "Purchase verification failed: {}", message)
            }
            Self::PurchaseExpired { product_id } => {
                write!(f, "Purchase of {} has already expired", product_id)
            }
            Self::AlreadyFree => write!(f, "User is already on free tier"),
            Self::ProviderCancelFailed => {
                write!(f, "Billing provider refused to cancel the subscription")
            }
            Self::NoPurchaseTokens => write!(f, "No purchase tokens provided"),
            Self::NothingToRestore => write!(f, "No valid purchases found to restore"),
            Self::ConcurrentUpdate => {
                write!(f, "Subscription was modified concurrently, try again")
            }
        }
    }
}

/// Business result of an engine operation
pub type Outcome<T> = Result<T, Rejection>;

/// Success flag + message shape for rendering an `Outcome`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult<T> {
    pub successful: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> From<Outcome<T>> for OperationResult<T> {
    fn from(outcome: Outcome<T>) -> Self {
        match outcome {
            Ok(data) => Self {
                successful: true,
                data: Some(data),
                message: None,
            },
            Err(rejection) => Self {
                successful: false,
                data: None,
                message: Some(rejection.to_string()),
            },
        }
    }
}
