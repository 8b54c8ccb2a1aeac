//! # delay-store
//!
//! `delay-store` holds the "next allowed" timestamps an external rate governor
//! pushes to an admission filter, keyed by `(domain, identifier)`.
//!
//! ## Core Philosophy
//!
//! The governor does the thinking; the filter only has to answer "when may this
//! identifier come back?" in a handful of nanoseconds. Every operation is a
//! short critical section over a hash lookup, and updates are merged with a
//! monotonic `max` so that duplicated or re-ordered control messages can never
//! move a deadline backwards.
//!
//! ## Key Concepts
//!
//! * **Monotonic merge**: `apply_update` keeps the highest timestamp seen for a key.
//! * **Bounded memory**: [`ArenaDelayStore`] carves a fixed byte budget into
//!   entries; running out is a recoverable [`StoreError`], never a crash.
//! * **Incremental eviction**: `evict_expired` removes at most `max_batch`
//!   entries per call to bound the time spent under lock.
//! * **Store Trait**: [`DelayStore`] is the only seam, so the backing can be
//!   swapped (arena in production, [`LocalDelayStore`] in tests).
//!
//! ## Example
//!
//! ```rust
//! use delay_store::ArenaDelayStore;
//! use delay_store::DelayStore;
//!
//! let store = ArenaDelayStore::new();
//!
//! store.apply_update("api", "1.2.3.4", 20_000);
//! store.apply_update("api", "1.2.3.4", 15_000); // ignored, lower
//!
//! assert_eq!(store.lookup("api", "1.2.3.4"), 20_000);
//! assert_eq!(store.lookup("api", "5.6.7.8"), 0);
//! ```

use std::fmt::Debug;

mod arena;
mod clock;
mod error;
mod key;
mod local;

pub use arena::ArenaDelayStore;
pub use arena::DEFAULT_ARENA_SIZE;
pub use arena::NODE_SIZE;
pub use clock::Clock;
pub use clock::MonotonicClock;
pub use error::StoreError;
pub use key::DelayKey;
pub use key::KEY_SEPARATOR;
pub use key::KeyError;
pub use key::MAX_KEY_LEN;

pub use local::LocalDelayStore;

/// Effect of an update on the stored timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// A new entry was created.
    Inserted,
    /// An existing entry was moved forward from `previous`.
    Raised { previous: u64 },
    /// The candidate was not newer than `current`; nothing changed.
    Unchanged { current: u64 },
}

/// The core trait for next-allowed timestamp stores.
///
/// Implementations must be `Send` and `Sync`: the request path reads while a
/// single control-plane listener writes and a sweeper evicts.
pub trait DelayStore: Debug + Send + Sync {
    /// Returns the next allowed timestamp for `key`, if any.
    fn get(&self, key: &DelayKey) -> Option<u64>;

    /// Inserts `ts` or raises the existing timestamp to `ts`, whichever applies.
    ///
    /// Never lowers a stored value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a new entry cannot be allocated. The store is
    /// left exactly as it was before the call.
    fn upsert_max(&self, key: &DelayKey, ts: u64) -> Result<Merge, StoreError>;

    /// Removes up to `max_batch` entries whose timestamp is strictly before `now`.
    ///
    /// Returns the number of entries removed.
    fn evict_expired(&self, now: u64, max_batch: usize) -> usize;

    /// Number of live entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next allowed timestamp for `(domain, identifier)`, or `0` when there is
    /// no restriction.
    ///
    /// A key that cannot be built is treated as unrestricted: identifiers
    /// come from clients and must not be able to fail requests or flood the
    /// log, so it is only logged at `debug`.
    fn lookup(&self, domain: &str, identifier: &str) -> u64 {
        match DelayKey::new(domain, identifier) {
            Ok(key) => self.get(&key).unwrap_or(0),
            Err(err) => {
                tracing::debug!(domain, %err, "unusable delay key; not restricting request");
                0
            }
        }
    }

    /// Merges `ts` into the entry for `(domain, identifier)`.
    ///
    /// Invalid keys and allocation failures are logged and dropped; `None` is
    /// returned in both cases.
    fn apply_update(&self, domain: &str, identifier: &str, ts: u64) -> Option<Merge> {
        let key = match DelayKey::new(domain, identifier) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(domain, %err, "unusable delay key; dropping update");
                return None;
            }
        };
        match self.upsert_max(&key, ts) {
            Ok(merge) => Some(merge),
            Err(err) => {
                tracing::error!(domain, identifier, %err, "dropping delay update");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn stores() -> Vec<Arc<dyn DelayStore>> {
        vec![
            Arc::new(ArenaDelayStore::new()),
            Arc::new(LocalDelayStore::new()),
        ]
    }

    #[test]
    fn test_lookup_is_max_of_updates() {
        for store in stores() {
            for ts in [5_000, 12_000, 9_000, 12_000, 11_999] {
                store.apply_update("api", "1.2.3.4", ts);
            }
            assert_eq!(store.lookup("api", "1.2.3.4"), 12_000, "{store:?}");
        }
    }

    #[test]
    fn test_unknown_keys_are_unrestricted() {
        for store in stores() {
            store.apply_update("api", "1.2.3.4", 5_000);
            assert_eq!(store.lookup("api", "4.3.2.1"), 0);
            assert_eq!(store.lookup("web", "1.2.3.4"), 0);
        }
    }

    #[test]
    fn test_duplicate_update_is_idempotent() {
        for store in stores() {
            assert_eq!(
                store.apply_update("api", "k", 7_000),
                Some(Merge::Inserted)
            );
            assert_eq!(
                store.apply_update("api", "k", 7_000),
                Some(Merge::Unchanged { current: 7_000 })
            );
            assert_eq!(store.len(), 1);
            assert_eq!(store.lookup("api", "k"), 7_000);
        }
    }

    #[test]
    fn test_oversized_key_is_a_no_op() {
        let identifier = "x".repeat(MAX_KEY_LEN);
        for store in stores() {
            assert_eq!(store.apply_update("api", &identifier, 9_999), None);
            assert_eq!(store.lookup("api", &identifier), 0);
            assert!(store.is_empty());
        }
    }

    #[test]
    fn test_eviction_never_touches_live_entries() {
        for store in stores() {
            for i in 0..50u64 {
                store.apply_update("api", &format!("id-{i}"), i * 10);
            }
            let removed = store.evict_expired(250, 100);
            assert_eq!(removed, 25);
            for i in 25..50u64 {
                assert_eq!(store.lookup("api", &format!("id-{i}")), i * 10);
            }
        }
    }
}
