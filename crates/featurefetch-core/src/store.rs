//! Store client trait for point-in-time feature lookups
//!
//! The backing key-value store holds, per physical key, zero or more
//! checkpointed snapshots of partial aggregates plus the raw event tail
//! written since the latest checkpoint:
//!
//! ```text
//! ┌──────────────────────── RawStoreValue ─────────────────────────┐
//! │ snapshots: [cp=T-2d] [cp=T-1d] [cp=T0]   events: e(T0+1) e(T0+5) │
//! │            (history, optional)  latest   (raw tail after T0)     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The store is an external collaborator: connection pooling, retry policy
//! and value encoding belong to the implementation. The fetcher only relies
//! on the [`StoreClient::multi_get`] contract.

use crate::codec::PhysicalLookupKey;
use crate::{FeatureValue, FetchError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One raw event newer than the latest checkpoint
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawEvent {
    pub ts_millis: i64,
    pub fields: HashMap<String, FeatureValue>,
}

impl RawEvent {
    pub fn new(ts_millis: i64) -> Self {
        Self {
            ts_millis,
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Partial-aggregate state valid through `checkpoint_millis`
///
/// `state` is opaque to the store; the aggregation engine decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub checkpoint_millis: i64,
    pub state: Vec<u8>,
}

/// Everything the store holds for one physical key
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawStoreValue {
    /// Retained snapshots; a store without history keeps only the latest
    pub snapshots: Vec<Snapshot>,
    /// Raw events newer than the latest snapshot's checkpoint
    pub events: Vec<RawEvent>,
}

impl RawStoreValue {
    /// State of an entity the store has never seen
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshots.push(snapshot);
        self.snapshots.sort_by_key(|s| s.checkpoint_millis);
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = RawEvent>) -> Self {
        self.events.extend(events);
        self
    }

    pub fn latest_checkpoint(&self) -> Option<i64> {
        self.snapshots.iter().map(|s| s.checkpoint_millis).max()
    }
}

/// Result of looking up a single physical key
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Found(RawStoreValue),
    NotFound,
    /// `Timeout` or `StoreUnavailable`
    Failed(FetchError),
}

impl LookupOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, LookupOutcome::Failed(_))
    }
}

/// Batched point lookups against the backing store
///
/// ## Contract
///
/// - one `(key, outcome)` per input key, in input order
/// - completes within `timeout`, reporting `FetchError::Timeout` for keys
///   still outstanding rather than blocking on them
/// - safe for concurrent invocation from many batches (Send + Sync)
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn multi_get(
        &self,
        keys: &[PhysicalLookupKey],
        timeout: Duration,
    ) -> Vec<(PhysicalLookupKey, LookupOutcome)>;

    /// Check if the store is reachable
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Name of this store type (for logging/metrics)
    fn store_type(&self) -> &'static str;
}
