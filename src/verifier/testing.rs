//! Scripted in-process verifier for tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{BillingVerifier, ProductPurchase, SubscriptionPurchase, VerifierError};
use crate::billing::ProductKind;

type Key = (String, String);

/// Answers from a fixed script; unscripted purchases are reported as not found
pub struct ScriptedVerifier {
    subscriptions: Mutex<HashMap<Key, Result<SubscriptionPurchase, VerifierError>>>,
    products: Mutex<HashMap<Key, Result<ProductPurchase, VerifierError>>>,
    delay: Mutex<Option<Duration>>,
    cancel_accepted: AtomicBool,
    calls: Mutex<Vec<String>>,
    acknowledged: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
}

fn key(product_id: &str, purchase_token: &str) -> Key {
    (product_id.to_string(), purchase_token.to_string())
}

fn not_found() -> VerifierError {
    VerifierError::Rejected {
        status: 404,
        message: "purchase not found".to_string(),
    }
}

/// Provider answer for an auto-renewing subscription
pub fn subscription_answer(expiry: Option<DateTime<Utc>>) -> SubscriptionPurchase {
    SubscriptionPurchase {
        start_time_millis: Some(1_700_000_000_000),
        expiry_time_millis: expiry.map(|t| t.timestamp_millis()),
        auto_renewing: Some(true),
        price_amount_micros: Some(4_990_000),
        price_currency_code: Some("USD".to_string()),
        country_code: Some("US".to_string()),
        payment_state: Some(1),
        cancel_reason: None,
        order_id: Some("GPA.0000-1111".to_string()),
        acknowledgement_state: Some(0),
        raw_response: Some("{}".to_string()),
    }
}

/// Provider answer for a purchased one-time product
pub fn product_answer() -> ProductPurchase {
    ProductPurchase {
        purchase_time_millis: Some(1_700_000_000_000),
        purchase_state: Some(0),
        acknowledgement_state: Some(0),
        order_id: Some("GPA.2222-3333".to_string()),
        region_code: Some("US".to_string()),
        raw_response: Some("{}".to_string()),
    }
}

impl ScriptedVerifier {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            products: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            cancel_accepted: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            acknowledged: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn with_subscription(
        self,
        product_id: &str,
        purchase_token: &str,
        answer: Result<SubscriptionPurchase, VerifierError>,
    ) -> Self {
        self.set_subscription(product_id, purchase_token, answer);
        self
    }

    pub fn with_product(
        self,
        product_id: &str,
        purchase_token: &str,
        answer: Result<ProductPurchase, VerifierError>,
    ) -> Self {
        self.products
            .lock()
            .unwrap()
            .insert(key(product_id, purchase_token), answer);
        self
    }

    /// Replace the answer for a subscription mid-test
    pub fn set_subscription(
        &self,
        product_id: &str,
        purchase_token: &str,
        answer: Result<SubscriptionPurchase, VerifierError>,
    ) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(key(product_id, purchase_token), answer);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn refuse_cancellation(&self) {
        self.cancel_accepted.store(false, Ordering::SeqCst);
    }

    /// Every verify call as `product:token`, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn acknowledged(&self) -> Vec<String> {
        self.acknowledged.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    async fn record_call(&self, product_id: &str, purchase_token: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:{}", product_id, purchase_token));

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl BillingVerifier for ScriptedVerifier {
    async fn verify_subscription(
        &self,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<SubscriptionPurchase, VerifierError> {
        self.record_call(product_id, purchase_token).await;
        self.subscriptions
            .lock()
            .unwrap()
            .get(&key(product_id, purchase_token))
            .cloned()
            .unwrap_or_else(|| Err(not_found()))
    }

    async fn verify_one_time_purchase(
        &self,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<ProductPurchase, VerifierError> {
        self.record_call(product_id, purchase_token).await;
        self.products
            .lock()
            .unwrap()
            .get(&key(product_id, purchase_token))
            .cloned()
            .unwrap_or_else(|| Err(not_found()))
    }

    async fn acknowledge_purchase(
        &self,
        _kind: ProductKind,
        _product_id: &str,
        purchase_token: &str,
    ) -> bool {
        self.acknowledged
            .lock()
            .unwrap()
            .push(purchase_token.to_string());
        true
    }

    async fn cancel_subscription(&self, _product_id: &str, purchase_token: &str) -> bool {
        if !self.cancel_accepted.load(Ordering::SeqCst) {
            return false;
        }
        self.cancelled
            .lock()
            .unwrap()
            .push(purchase_token.to_string());
        true
    }
}
