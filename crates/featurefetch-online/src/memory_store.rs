//! In-process store client
//!
//! Holds raw store values in a concurrent map. Useful for embedding the
//! fetcher next to a stream processor that owns the state, and as the
//! deterministic store in tests.

use async_trait::async_trait;
use dashmap::DashMap;
use featurefetch_core::{LookupOutcome, PhysicalLookupKey, RawEvent, RawStoreValue, Snapshot, StoreClient};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    values: DashMap<PhysicalLookupKey, RawStoreValue>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value for `key`
    pub fn put(&self, key: PhysicalLookupKey, value: RawStoreValue) {
        self.values.insert(key, value);
    }

    /// Appends a raw event to the tail for `key`
    pub fn append_event(&self, key: PhysicalLookupKey, event: RawEvent) {
        self.values.entry(key).or_default().events.push(event);
    }

    /// Installs a new checkpoint and drops tail events it covers
    ///
    /// With `keep_history` false only the new snapshot is retained.
    pub fn checkpoint(&self, key: PhysicalLookupKey, snapshot: Snapshot, keep_history: bool) {
        let mut value = self.values.entry(key).or_default();
        let checkpoint = snapshot.checkpoint_millis;
        if !keep_history {
            value.snapshots.clear();
        }
        value.snapshots.push(snapshot);
        value.snapshots.sort_by_key(|s| s.checkpoint_millis);
        value.events.retain(|e| e.ts_millis > checkpoint);
    }

    pub fn remove(&self, key: &PhysicalLookupKey) -> Option<RawStoreValue> {
        self.values.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl StoreClient for InMemoryStore {
    async fn multi_get(
        &self,
        keys: &[PhysicalLookupKey],
        _timeout: Duration,
    ) -> Vec<(PhysicalLookupKey, LookupOutcome)> {
        keys.iter()
            .map(|key| {
                let outcome = match self.values.get(key) {
                    Some(value) => LookupOutcome::Found(value.clone()),
                    None => LookupOutcome::NotFound,
                };
                (key.clone(), outcome)
            })
            .collect()
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
