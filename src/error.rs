//! Infrastructure errors
//!
//! Business failures (invalid input, provider rejection, already-free
//! accounts) are not errors; they come back as `billing::Rejection`.
//! Only failures the engine cannot recover from locally live here.

use crate::billing::AccountId;
use crate::store::StoreError;

/// Invalid or missing configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
    #[error("could not determine config directory")]
    NoConfigDir,
}

impl ConfigError {
    pub fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Error surfaced to callers when the engine cannot complete an operation
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no active subscription for account {0}")]
    SubscriptionMissing(AccountId),
}

pub type EngineResult<T> = Result<T, EngineError>;
