pub mod billing;
pub mod clock;
pub mod config;
pub mod error;
pub mod store;
pub mod verifier;

pub use billing::{
    AccountId, HistoryRecord, OperationResult, Outcome, QuotaCheck, Rejection, Subscription,
    SubscriptionAnalytics, SubscriptionEngine, SubscriptionTier, VerificationRecord,
};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use verifier::{AbortHandle, AbortSignal};

use tracing_subscriber::EnvFilter;

/// Install a global subscriber reading `RUST_LOG`.
///
/// Default: warn for dependencies, info for the engine (purchases, expirations).
/// Use RUST_LOG=entitlement_engine=debug for per-call verification logs.
/// Calling it twice is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,entitlement_engine=info")),
        )
        .try_init();
}
