//! Shared fixtures: scripted store, slow metadata source, definitions
#![allow(dead_code)]

use async_trait::async_trait;
use featurefetch_core::plan::DEFAULT_TILE_MILLIS;
use featurefetch_core::{
    encode, AggregationDef, Definition, FeatureValue, FetchError, GroupByDef,
    InMemoryMetadataSource, JoinDef, JoinPartDef, KeyField, LookupOutcome, MetadataSource,
    Operation, PhysicalLookupKey, RawStoreValue, Result, StoreClient, ValueType, Window,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const T0: i64 = 1_700_000_000_000;
pub const DAY: i64 = 24 * 60 * 60 * 1000;

/// What the scripted store does for one key
#[derive(Clone)]
pub enum Script {
    Value(RawStoreValue),
    Slow(Duration, RawStoreValue),
    Fail(FetchError),
}

/// Store whose per-key behaviour is set by the test
///
/// Keys are answered concurrently; a key slower than the call's timeout
/// gets `Timeout` while its siblings are answered normally. Unscripted keys
/// are `NotFound`.
#[derive(Default)]
pub struct ScriptedStore {
    scripts: Mutex<HashMap<PhysicalLookupKey, Script>>,
    calls: Mutex<Vec<Vec<PhysicalLookupKey>>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, key: PhysicalLookupKey, script: Script) {
        self.scripts.lock().unwrap().insert(key, script);
    }

    /// Keys of every multi_get call, in call order
    pub fn calls(&self) -> Vec<Vec<PhysicalLookupKey>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn keys_requested(&self) -> usize {
        self.calls().iter().map(Vec::len).sum()
    }

    /// Most multi_get calls observed running at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreClient for ScriptedStore {
    async fn multi_get(
        &self,
        keys: &[PhysicalLookupKey],
        timeout: Duration,
    ) -> Vec<(PhysicalLookupKey, LookupOutcome)> {
        self.calls.lock().unwrap().push(keys.to_vec());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        let scripts: Vec<Option<Script>> = {
            let guard = self.scripts.lock().unwrap();
            keys.iter().map(|k| guard.get(k).cloned()).collect()
        };

        let lookups = keys.iter().cloned().zip(scripts).map(|(key, script)| async move {
            let outcome = match script {
                None => LookupOutcome::NotFound,
                Some(Script::Value(value)) => LookupOutcome::Found(value),
                Some(Script::Fail(e)) => LookupOutcome::Failed(e),
                Some(Script::Slow(delay, value)) => {
                    match tokio::time::timeout(timeout, tokio::time::sleep(delay)).await {
                        Ok(()) => LookupOutcome::Found(value),
                        Err(_) => LookupOutcome::Failed(FetchError::timeout("scripted slow key")),
                    }
                }
            };
            (key, outcome)
        });
        let results = futures::future::join_all(lookups).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        results
    }

    fn store_type(&self) -> &'static str {
        "scripted"
    }
}

/// Metadata source that sleeps before answering and counts calls
pub struct SlowSource {
    pub inner: InMemoryMetadataSource,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl SlowSource {
    pub fn new(definitions: impl IntoIterator<Item = Definition>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryMetadataSource::with_definitions(definitions),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataSource for SlowSource {
    async fn fetch_definition(&self, name: &str) -> Result<Option<Definition>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.fetch_definition(name).await
    }
}

pub fn user_key_schema() -> Vec<KeyField> {
    vec![KeyField::new("user_id", ValueType::Int)]
}

/// GroupBy `name` over `dataset`, counting and summing `amount`
pub fn group_by(name: &str, dataset: &str) -> GroupByDef {
    GroupByDef {
        name: name.to_string(),
        dataset: dataset.to_string(),
        keys: user_key_schema(),
        aggregations: vec![
            AggregationDef::new("amount", Operation::Count),
            AggregationDef::new("amount", Operation::Sum).windowed(Window::days(7)),
        ],
        tile_millis: DEFAULT_TILE_MILLIS,
    }
}

pub fn join(name: &str, parts: Vec<JoinPartDef>) -> Definition {
    Definition::Join(JoinDef {
        name: name.to_string(),
        parts,
    })
}

pub fn user(id: i64) -> HashMap<String, FeatureValue> {
    HashMap::from([("user_id".to_string(), FeatureValue::Int(id))])
}

pub fn user_key(dataset: &str, id: i64) -> PhysicalLookupKey {
    encode(&user(id), &user_key_schema(), dataset).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
