//! Verification scheduling
//!
//! Decides whether a snapshot must be re-checked with the billing provider.
//! Accounts without a purchase token never trigger external calls, which
//! bounds provider traffic to one call per account per interval.

use chrono::{DateTime, Duration, Utc};

use super::types::{Subscription, VerificationType, VERIFICATION_INTERVAL_HOURS};

/// Why a verification is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationTrigger {
    Forced,
    NeverVerified,
    Stale,
}

impl VerificationTrigger {
    pub fn verification_type(&self) -> VerificationType {
        match self {
            Self::Forced => VerificationType::Manual,
            Self::NeverVerified | Self::Stale => VerificationType::Periodic,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VerificationScheduler {
    interval: Duration,
}

impl VerificationScheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Returns the trigger when a provider check is due, None otherwise
    pub fn due(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
        force: bool,
    ) -> Option<VerificationTrigger> {
        if !subscription.has_purchase_token() {
            return None;
        }
        if force {
            return Some(VerificationTrigger::Forced);
        }
        if !subscription.needs_verification(now, self.interval) {
            return None;
        }
        match subscription.last_verified_at {
            None => Some(VerificationTrigger::NeverVerified),
            Some(_) => Some(VerificationTrigger::Stale),
        }
    }
}

impl Default for VerificationScheduler {
    fn default() -> Self {
        Self::new(Duration::hours(VERIFICATION_INTERVAL_HOURS))
    }
}
