//! Entitlement cache
//!
//! Keeps the last-known subscription snapshot per account for a fixed TTL so
//! hot read paths skip the store. The cache is advisory: every write path
//! invalidates the account and a miss always falls through to the store.
//! Uses DashMap so different accounts never contend on one lock.
//!
//! Readers take a ticket before going to the store and hand it back with the
//! snapshot. An invalidation issued after the ticket makes `put` drop the
//! snapshot, so a slow reader cannot republish state a writer already replaced.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::types::{AccountId, Subscription};
use crate::clock::{Clock, SystemClock};

/// Default snapshot lifetime (30 minutes)
pub const CACHE_TTL_MINUTES: i64 = 30;

/// Puts between sweeps of stale entries
pub const SWEEP_INTERVAL: u64 = 256;

/// Invalidation epoch observed before a store read
pub type CacheTicket = u64;

/// Injectable cache seam owned by the engine
pub trait EntitlementCache: Send + Sync {
    /// Take before reading the store; pass the same ticket to `put`
    fn ticket(&self) -> CacheTicket;

    /// Fresh snapshot for the account, None when absent or older than the TTL
    fn get(&self, account_id: AccountId) -> Option<Subscription>;

    /// Store a snapshot read under `ticket`.
    ///
    /// Returns false, storing nothing, when the account was invalidated after
    /// the ticket was taken.
    fn put(&self, account_id: AccountId, subscription: Subscription, ticket: CacheTicket) -> bool;

    fn invalidate(&self, account_id: AccountId);
}

struct CachedSubscription {
    subscription: Subscription,
    cached_at: DateTime<Utc>,
}

#[derive(Default)]
struct Slot {
    cached: Option<CachedSubscription>,
    /// Epoch of the last invalidation, 0 when never invalidated
    invalidated_at: u64,
}

/// TTL cache keyed on account id
pub struct TtlCache {
    slots: DashMap<AccountId, Slot>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    epoch: AtomicU64,
    /// Invalidations up to this epoch may have been swept away
    swept_through: AtomicU64,
    puts: AtomicU64,
}

impl TtlCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
            clock,
            epoch: AtomicU64::new(0),
            swept_through: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    /// Number of accounts tracked, including stale entries not yet swept
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop stale snapshots and the invalidation marks no reader can still race.
    ///
    /// Runs every `SWEEP_INTERVAL` puts.
    pub fn cleanup(&self) {
        let now = self.clock.now();
        let ttl = self.ttl;
        let through = self.epoch.load(Ordering::SeqCst);
        self.swept_through.fetch_max(through, Ordering::SeqCst);

        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            if slot
                .cached
                .as_ref()
                .is_some_and(|entry| now - entry.cached_at >= ttl)
            {
                slot.cached = None;
            }
            slot.cached.is_some() || slot.invalidated_at > through
        });
        debug!(removed = before.saturating_sub(self.slots.len()), "Swept subscription cache");
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new(Duration::minutes(CACHE_TTL_MINUTES), Arc::new(SystemClock))
    }
}

impl EntitlementCache for TtlCache {
    fn ticket(&self) -> CacheTicket {
        self.epoch.load(Ordering::SeqCst)
    }

    fn get(&self, account_id: AccountId) -> Option<Subscription> {
        let now = self.clock.now();
        let ttl = self.ttl;

        // The shard guard must be released before clearing a stale entry
        let lookup = self.slots.get(&account_id).and_then(|slot| {
            slot.cached
                .as_ref()
                .map(|entry| (now - entry.cached_at < ttl).then(|| entry.subscription.clone()))
        });

        match lookup {
            Some(Some(subscription)) => Some(subscription),
            Some(None) => {
                if let Some(mut slot) = self.slots.get_mut(&account_id) {
                    if slot
                        .cached
                        .as_ref()
                        .is_some_and(|entry| now - entry.cached_at >= ttl)
                    {
                        slot.cached = None;
                    }
                }
                debug!(account_id, "Cached subscription expired");
                None
            }
            None => None,
        }
    }

    fn put(
        &self,
        account_id: AccountId,
        subscription: Subscription,
        ticket: CacheTicket,
    ) -> bool {
        let entry = CachedSubscription {
            cached_at: self.clock.now(),
            subscription,
        };
        let tier = entry.subscription.tier;
        let version = entry.subscription.version;

        let stored = match self.slots.entry(account_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().invalidated_at > ticket {
                    false
                } else {
                    occupied.get_mut().cached = Some(entry);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                // An invalidation mark for this account may have been swept
                if ticket < self.swept_through.load(Ordering::SeqCst) {
                    false
                } else {
                    vacant.insert(Slot {
                        cached: Some(entry),
                        invalidated_at: 0,
                    });
                    true
                }
            }
        };

        if stored {
            debug!(account_id, tier = ?tier, version, "Caching subscription");
        } else {
            debug!(account_id, version, "Dropped snapshot read before an invalidation");
        }

        if (self.puts.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_INTERVAL == 0 {
            self.cleanup();
        }
        stored
    }

    fn invalidate(&self, account_id: AccountId) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let mut slot = self.slots.entry(account_id).or_default();
        slot.cached = None;
        slot.invalidated_at = epoch;
        debug!(account_id, epoch, "Invalidated subscription cache");
    }
}

/// Cache that never holds anything; every read goes to the store
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl EntitlementCache for NoopCache {
    fn ticket(&self) -> CacheTicket {
        0
    }

    fn get(&self, _account_id: AccountId) -> Option<Subscription> {
        None
    }

    fn put(
        &self,
        _account_id: AccountId,
        _subscription: Subscription,
        _ticket: CacheTicket,
    ) -> bool {
        false
    }

    fn invalidate(&self, _account_id: AccountId) {}
}
