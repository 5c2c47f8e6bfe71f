//! Google Play Android Publisher client

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::http_client::billing_client;
use super::{token_fingerprint, BillingVerifier, ProductPurchase, SubscriptionPurchase, VerifierError};
use crate::billing::ProductKind;
use crate::config::EngineConfig;

pub const ANDROID_PUBLISHER_URL: &str =
    "https://androidpublisher.googleapis.com/androidpublisher/v3";

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// Verifies purchases against the Android Publisher v3 REST API
pub struct GooglePlayVerifier {
    client: Client,
    base_url: String,
    package_name: String,
    access_token: Option<String>,
}

impl GooglePlayVerifier {
    pub fn new(package_name: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            client: billing_client().clone(),
            base_url: ANDROID_PUBLISHER_URL.to_string(),
            package_name: package_name.into(),
            access_token,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.package_name.clone(),
            config.google_play_access_token.clone(),
        )
        .with_base_url(&config.google_play_base_url)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    /// `{base}/applications/{package}/purchases/{collection}/{product}/tokens/{token_segment}`
    fn endpoint(
        &self,
        collection: &str,
        product_id: &str,
        token_segment: &str,
    ) -> Result<Url, VerifierError> {
        let invalid = |message: String| VerifierError::Transport {
            status: None,
            message,
        };

        let mut url = Url::parse(&self.base_url)
            .map_err(|e| invalid(format!("invalid base url {:?}: {}", self.base_url, e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| invalid(format!("base url {:?} cannot hold a path", self.base_url)))?;
            segments.pop_if_empty().extend([
                "applications",
                self.package_name.as_str(),
                "purchases",
                collection,
                product_id,
                "tokens",
                token_segment,
            ]);
        }
        Ok(url)
    }

    fn bearer(&self) -> Result<&str, VerifierError> {
        self.access_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or(VerifierError::NotConfigured)
    }

    /// Send a request and return the body of a 2xx response
    async fn send(&self, request: RequestBuilder) -> Result<String, VerifierError> {
        let response = request
            .bearer_auth(self.bearer()?)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(classify(status, &body));
        }
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<(T, String), VerifierError> {
        let body = self.send(self.client.get(url)).await?;
        let parsed = serde_json::from_str(&body)
            .map_err(|e| VerifierError::Decode(e.to_string()))?;
        Ok((parsed, body))
    }

    async fn post_action(&self, url: Url) -> Result<(), VerifierError> {
        self.send(self.client.post(url).json(&serde_json::json!({})))
            .await
            .map(|_| ())
    }
}

fn transport_error(e: reqwest::Error) -> VerifierError {
    if e.is_timeout() {
        return VerifierError::Timeout;
    }
    VerifierError::Transport {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}

/// 4xx means the provider answered and refused; anything else is transport
fn classify(status: StatusCode, body: &str) -> VerifierError {
    let message = serde_json::from_str::<ApiError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().to_string());

    if status.is_client_error() {
        VerifierError::Rejected {
            status: status.as_u16(),
            message,
        }
    } else {
        VerifierError::Transport {
            status: Some(status.as_u16()),
            message,
        }
    }
}

fn collection_for(kind: ProductKind) -> &'static str {
    match kind {
        ProductKind::Subscription => "subscriptions",
        ProductKind::OneTime => "products",
    }
}

#[async_trait]
impl BillingVerifier for GooglePlayVerifier {
    async fn verify_subscription(
        &self,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<SubscriptionPurchase, VerifierError> {
        info!(
            product_id,
            token = %token_fingerprint(purchase_token),
            package = %self.package_name,
            "Verifying subscription"
        );

        let url = self.endpoint("subscriptions", product_id, purchase_token)?;
        let (mut purchase, body): (SubscriptionPurchase, String) = self.get_json(url).await?;
        purchase.raw_response = Some(body);
        Ok(purchase)
    }

    async fn verify_one_time_purchase(
        &self,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<ProductPurchase, VerifierError> {
        info!(
            product_id,
            token = %token_fingerprint(purchase_token),
            package = %self.package_name,
            "Verifying one-time purchase"
        );

        let url = self.endpoint("products", product_id, purchase_token)?;
        let (mut purchase, body): (ProductPurchase, String) = self.get_json(url).await?;
        purchase.raw_response = Some(body);
        Ok(purchase)
    }

    async fn acknowledge_purchase(
        &self,
        kind: ProductKind,
        product_id: &str,
        purchase_token: &str,
    ) -> bool {
        let token_segment = format!("{}:acknowledge", purchase_token);
        let result = match self.endpoint(collection_for(kind), product_id, &token_segment) {
            Ok(url) => self.post_action(url).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(product_id, token = %token_fingerprint(purchase_token), "Acknowledged purchase");
                true
            }
            Err(e) => {
                warn!(product_id, error = %e, "Failed to acknowledge purchase");
                false
            }
        }
    }

    async fn cancel_subscription(&self, product_id: &str, purchase_token: &str) -> bool {
        let token_segment = format!("{}:cancel", purchase_token);
        let result = match self.endpoint("subscriptions", product_id, &token_segment) {
            Ok(url) => self.post_action(url).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(product_id, token = %token_fingerprint(purchase_token), "Cancelled subscription with provider");
                true
            }
            Err(e) => {
                warn!(product_id, error = %e, "Provider refused subscription cancellation");
                false
            }
        }
    }
}
