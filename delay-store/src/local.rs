use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::DelayKey;
use crate::DelayStore;
use crate::Merge;
use crate::StoreError;

/// Unbounded in-process [`DelayStore`] backed by a [`DashMap`].
///
/// Useful when every worker lives in one process and memory is not a
/// concern, and as a reference implementation in tests.
#[derive(Debug, Default)]
pub struct LocalDelayStore {
    map: DashMap<DelayKey, u64>,
}

impl LocalDelayStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DelayStore for LocalDelayStore {
    fn get(&self, key: &DelayKey) -> Option<u64> {
        self.map.get(key).map(|entry| *entry)
    }

    fn upsert_max(&self, key: &DelayKey, ts: u64) -> Result<Merge, StoreError> {
        match self.map.entry(*key) {
            Entry::Occupied(mut entry) => {
                let previous = *entry.get();
                if ts > previous {
                    entry.insert(ts);
                    Ok(Merge::Raised { previous })
                } else {
                    Ok(Merge::Unchanged { current: previous })
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(ts);
                Ok(Merge::Inserted)
            }
        }
    }

    fn evict_expired(&self, now: u64, max_batch: usize) -> usize {
        let candidates: Vec<DelayKey> = self
            .map
            .iter()
            .filter(|entry| *entry.value() < now)
            .take(max_batch)
            .map(|entry| *entry.key())
            .collect();

        // An update may have raised a candidate since it was collected.
        candidates
            .iter()
            .filter(|key| self.map.remove_if(*key, |_, ts| *ts < now).is_some())
            .count()
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}
