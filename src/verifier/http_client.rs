//! Shared HTTP client for billing provider calls
//!
//! One lazily built client so TLS sessions and pooled connections are reused
//! across verifications.

use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

/// Global client for the billing provider API
///
/// The request timeout here is a backstop; the engine applies its own
/// shorter per-call timeout.
pub static BILLING_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Falling back to default billing HTTP client: {}", e);
            Client::new()
        })
});

#[inline]
pub fn billing_client() -> &'static Client {
    &BILLING_CLIENT
}
