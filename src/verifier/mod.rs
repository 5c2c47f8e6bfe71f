//! Billing verifier
//!
//! The external billing authority is reached only through `BillingVerifier`.
//! Provider calls are bounded by a timeout and a caller-supplied abort signal.

mod acknowledger;
mod google_play;
mod http_client;
#[cfg(test)]
pub(crate) mod testing;

pub use acknowledger::{AcknowledgementJob, Acknowledger};
pub use google_play::{GooglePlayVerifier, ANDROID_PUBLISHER_URL};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

use crate::billing::{from_millis, ProductKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifierError {
    #[error("transport error: {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },
    #[error("billing provider timed out")]
    Timeout,
    #[error("verification aborted")]
    Aborted,
    #[error("billing provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("failed to decode provider response: {0}")]
    Decode(String),
    #[error("billing provider not configured")]
    NotConfigured,
}

impl VerifierError {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            Self::Rejected { status, .. } => Some(*status),
            Self::NotConfigured => Some(503),
            Self::Timeout | Self::Aborted | Self::Decode(_) => None,
        }
    }
}

/// Subscription facts reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPurchase {
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub start_time_millis: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub expiry_time_millis: Option<i64>,
    #[serde(default)]
    pub auto_renewing: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub price_amount_micros: Option<i64>,
    #[serde(default)]
    pub price_currency_code: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub payment_state: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub cancel_reason: Option<i64>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub acknowledgement_state: Option<i64>,
    /// Body as received, kept for the audit trail
    #[serde(skip)]
    pub raw_response: Option<String>,
}

impl SubscriptionPurchase {
    /// A subscription the provider returned is a real purchase
    pub fn is_valid(&self) -> bool {
        true
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expiry_time_millis.and_then(from_millis)
    }

    pub fn purchase_state_label(&self) -> &'static str {
        "Purchased"
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledgement_state == Some(1)
    }
}

/// One-time product facts reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductPurchase {
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub purchase_time_millis: Option<i64>,
    /// 0 purchased, 1 cancelled, 2 pending
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub purchase_state: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub acknowledgement_state: Option<i64>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub region_code: Option<String>,
    #[serde(skip)]
    pub raw_response: Option<String>,
}

impl ProductPurchase {
    pub fn is_valid(&self) -> bool {
        matches!(self.purchase_state, None | Some(0))
    }

    pub fn purchase_state_label(&self) -> &'static str {
        match self.purchase_state {
            None | Some(0) => "Purchased",
            Some(1) => "Cancelled",
            Some(2) => "Pending",
            Some(_) => "Unknown",
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledgement_state == Some(1)
    }
}

pub fn acknowledgement_label(state: Option<i64>) -> Option<&'static str> {
    match state? {
        0 => Some("Unacknowledged"),
        1 => Some("Acknowledged"),
        _ => Some("Unknown"),
    }
}

/// Provider-side view of a subscription at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    pub is_active: bool,
    pub is_expired: bool,
    pub is_cancelled: bool,
    pub will_auto_renew: bool,
    pub expiry_time: Option<DateTime<Utc>>,
    pub cancel_reason: Option<i64>,
    pub payment_state: Option<i64>,
}

pub fn subscription_status(purchase: &SubscriptionPurchase, now: DateTime<Utc>) -> SubscriptionStatus {
    let expiry_time = purchase.expires_at();
    let is_expired = expiry_time.is_some_and(|expiry| expiry <= now);
    let is_cancelled = purchase.cancel_reason.is_some();

    SubscriptionStatus {
        is_active: !is_expired && !is_cancelled,
        is_expired,
        is_cancelled,
        will_auto_renew: purchase.auto_renewing == Some(true),
        expiry_time,
        cancel_reason: purchase.cancel_reason,
        payment_state: purchase.payment_state,
    }
}

/// External billing authority
#[async_trait]
pub trait BillingVerifier: Send + Sync {
    async fn verify_subscription(
        &self,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<SubscriptionPurchase, VerifierError>;

    async fn verify_one_time_purchase(
        &self,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<ProductPurchase, VerifierError>;

    /// Confirm a new purchase so the provider does not refund it
    async fn acknowledge_purchase(
        &self,
        kind: ProductKind,
        product_id: &str,
        purchase_token: &str,
    ) -> bool;

    /// Stop auto-renewal for a subscription
    async fn cancel_subscription(&self, product_id: &str, purchase_token: &str) -> bool;
}

/// Cancellation signal for in-flight provider calls
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

/// Trigger side of an `AbortSignal`
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

impl AbortSignal {
    pub fn new() -> (AbortHandle, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (AbortHandle { tx }, AbortSignal { rx })
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_, signal) = Self::new();
        signal
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once aborted; pends forever if the handle is dropped first
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::never()
    }
}

/// Run a provider call under a timeout and an abort signal
pub async fn guarded<T, F>(
    call: F,
    timeout: Duration,
    abort: &AbortSignal,
) -> Result<T, VerifierError>
where
    F: Future<Output = Result<T, VerifierError>>,
{
    if abort.is_aborted() {
        return Err(VerifierError::Aborted);
    }

    tokio::select! {
        biased;
        _ = abort.aborted() => Err(VerifierError::Aborted),
        result = tokio::time::timeout(timeout, call) => {
            result.unwrap_or(Err(VerifierError::Timeout))
        }
    }
}

/// Short stable identifier for a purchase token, safe to log
pub fn token_fingerprint(purchase_token: &str) -> String {
    let digest = Sha256::digest(purchase_token.as_bytes());
    hex::encode(&digest[..6])
}

mod lenient {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(i64),
        Text(String),
    }

    /// Accepts `123`, `"123"` or null; the provider encodes int64 as strings
    pub fn opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<NumberOrText>::deserialize(deserializer)? {
            None => Ok(None),
            Some(NumberOrText::Number(n)) => Ok(Some(n)),
            Some(NumberOrText::Text(text)) if text.trim().is_empty() => Ok(None),
            Some(NumberOrText::Text(text)) => text
                .trim()
                .parse()
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
