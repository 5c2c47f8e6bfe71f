//! Engine configuration
//!
//! Defaults match production behavior; every value can be overridden through
//! `ENTITLEMENT_*` environment variables (a `.env` file is honored).

use chrono::Duration;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

use crate::billing::{ProductCatalog, CACHE_TTL_MINUTES, FREE_ITEM_LIMIT, VERIFICATION_INTERVAL_HOURS};
use crate::error::ConfigError;
use crate::verifier::ANDROID_PUBLISHER_URL;

pub const DEFAULT_PACKAGE_NAME: &str = "com.example.entitlements";
pub const DEFAULT_VERIFIER_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_ACK_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache_ttl: Duration,
    pub verification_interval: Duration,
    pub free_item_limit: i64,
    /// Upper bound on a single provider call
    pub verifier_timeout: std::time::Duration,
    pub package_name: String,
    pub google_play_base_url: String,
    pub google_play_access_token: Option<String>,
    pub ack_queue_capacity: usize,
    pub max_page_size: u32,
    pub catalog: ProductCatalog,
    /// None selects the per-user config directory
    pub database_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::minutes(CACHE_TTL_MINUTES),
            verification_interval: Duration::hours(VERIFICATION_INTERVAL_HOURS),
            free_item_limit: FREE_ITEM_LIMIT,
            verifier_timeout: std::time::Duration::from_secs(DEFAULT_VERIFIER_TIMEOUT_SECS),
            package_name: DEFAULT_PACKAGE_NAME.to_string(),
            google_play_base_url: ANDROID_PUBLISHER_URL.to_string(),
            google_play_access_token: None,
            ack_queue_capacity: DEFAULT_ACK_QUEUE_CAPACITY,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            catalog: ProductCatalog::default(),
            database_path: None,
        }
    }
}

/// `<config_dir>/entitlements/subscriptions.db`
pub fn default_database_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("entitlements").join("subscriptions.db"))
}

impl EngineConfig {
    /// Load `.env` if present, then read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file loaded: {}", e);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let cache_ttl_minutes: i64 =
            positive(&get, "ENTITLEMENT_CACHE_TTL_MINUTES", CACHE_TTL_MINUTES)?;
        let interval_hours: i64 = positive(
            &get,
            "ENTITLEMENT_VERIFICATION_INTERVAL_HOURS",
            VERIFICATION_INTERVAL_HOURS,
        )?;
        let timeout_secs: u64 =
            positive(&get, "ENTITLEMENT_VERIFIER_TIMEOUT_SECS", DEFAULT_VERIFIER_TIMEOUT_SECS)?;
        let ack_queue_capacity: usize =
            positive(&get, "ENTITLEMENT_ACK_QUEUE_CAPACITY", DEFAULT_ACK_QUEUE_CAPACITY)?;
        let max_page_size: u32 =
            positive(&get, "ENTITLEMENT_MAX_PAGE_SIZE", DEFAULT_MAX_PAGE_SIZE)?;

        let free_item_limit: i64 = parse(&get, "ENTITLEMENT_FREE_ITEM_LIMIT", FREE_ITEM_LIMIT)?;
        if free_item_limit < 0 {
            return Err(ConfigError::invalid(
                "ENTITLEMENT_FREE_ITEM_LIMIT",
                "must not be negative",
            ));
        }

        let catalog = match get("ENTITLEMENT_PRODUCTS") {
            Some(raw) => ProductCatalog::parse(&raw)?,
            None => defaults.catalog,
        };

        Ok(Self {
            cache_ttl: Duration::minutes(cache_ttl_minutes),
            verification_interval: Duration::hours(interval_hours),
            free_item_limit,
            verifier_timeout: std::time::Duration::from_secs(timeout_secs),
            package_name: get("ENTITLEMENT_PACKAGE_NAME").unwrap_or(defaults.package_name),
            google_play_base_url: get("ENTITLEMENT_GOOGLE_PLAY_URL")
                .unwrap_or(defaults.google_play_base_url),
            google_play_access_token: get("ENTITLEMENT_GOOGLE_PLAY_TOKEN"),
            ack_queue_capacity,
            max_page_size,
            catalog,
            database_path: get("ENTITLEMENT_DATABASE_PATH").map(PathBuf::from),
        })
    }

    /// Configured database path, falling back to the config directory
    pub fn resolve_database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => default_database_path().ok_or(ConfigError::NoConfigDir),
        }
    }
}

fn parse<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, format!("{:?}: {}", raw, e))),
        None => Ok(default),
    }
}

fn positive<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parse(get, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}
