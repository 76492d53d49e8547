//! Batch dispatcher: the fetch path
//!
//! ```text
//!  Received ──► PlansResolved ──► KeysEncoded ──► FetchInFlight ──► Aggregated ──► Assembled
//!     │              │                 │                │                │              │
//!   batch      one resolve per   Joins expand to   unique keys,     compute per    one response
//!   in         distinct name     GroupBy leaves    chunked, bounded  leaf as of    per request,
//!                                 (remap, encode)   by a semaphore    at_millis     input order
//! ```
//!
//! Stages only move forward. A request that fails at any stage carries its
//! error to the end and is answered like every other request; nothing a
//! single request does can fail the batch.
//!
//! ## Coalescing
//!
//! Leaves (plain GroupBy requests and the GroupBy parts of Joins) that encode
//! to the same [`PhysicalLookupKey`] share one store lookup, and the fetched
//! value fans back out to each of them.
//!
//! ## Time Limits
//!
//! Each `multi_get` gets `lookup_timeout`. A batch deadline, when set, caps
//! the whole fetch stage: keys still outstanding when it passes become
//! `Timeout` results, while lookups that already completed are kept.

use crate::assembler::{assemble, RequestOutcome};
use crate::config::FetcherConfig;
use crate::observability::{
    increment_coalesced, increment_lookup_failures, increment_lookups, record_response,
    record_store_call, time_batch,
};
use crate::resolver::MetadataResolver;
use chrono::Utc;
use featurefetch_core::{
    compute, encode, remap_keys, FeatureRow, FetchError, GroupByPlan, LookupOutcome,
    MetadataSource, PhysicalLookupKey, RawStoreValue, Request, Response, Result, ServingPlan,
    StoreClient,
};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Slack past the per-call timeout before a store call is abandoned
const STORE_GRACE: Duration = Duration::from_millis(10);

/// Stages a batch moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStage {
    Received,
    PlansResolved,
    KeysEncoded,
    FetchInFlight,
    Aggregated,
    Assembled,
}

/// Online feature fetcher
///
/// Cheap to clone; clones share the plan cache, the store client and the
/// in-flight limit.
///
/// # Example
///
/// ```rust,ignore
/// let fetcher = Fetcher::from_source(source, Arc::new(store), FetcherConfig::default());
/// let responses = fetcher
///     .fetch(vec![Request::new("user_purchases", keys)])
///     .await;
/// assert_eq!(responses.len(), 1);
/// ```
#[derive(Clone)]
pub struct Fetcher {
    inner: Arc<FetcherInner>,
}

struct FetcherInner {
    resolver: MetadataResolver,
    store: Arc<dyn StoreClient>,
    config: FetcherConfig,
    /// Store calls in flight across all batches
    permits: Arc<Semaphore>,
}

/// One GroupBy computation a request needs
struct Leaf {
    group_by: Arc<GroupByPlan>,
    at_millis: i64,
    key: Result<PhysicalLookupKey>,
}

/// How a request's leaves fold back into its outcome
enum Shape {
    Failed(FetchError),
    GroupBy(usize),
    Join {
        at_millis: i64,
        parts: Vec<(String, usize)>,
    },
}

impl Fetcher {
    pub fn new(resolver: MetadataResolver, store: Arc<dyn StoreClient>, config: FetcherConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            inner: Arc::new(FetcherInner {
                resolver,
                store,
                config,
                permits,
            }),
        }
    }

    /// Builds a fetcher with its own plan cache over `source`
    pub fn from_source(
        source: Arc<dyn MetadataSource>,
        store: Arc<dyn StoreClient>,
        config: FetcherConfig,
    ) -> Self {
        let resolver = MetadataResolver::new(source, config.metadata.ttl());
        Self::new(resolver, store, config)
    }

    pub fn resolver(&self) -> &MetadataResolver {
        &self.inner.resolver
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.inner.config
    }

    /// Starts the plan cache refresh timer at the configured interval
    pub fn spawn_refresh_loop(&self) -> JoinHandle<()> {
        self.inner
            .resolver
            .spawn_refresh_loop(self.inner.config.metadata.refresh_interval())
    }

    pub async fn health_check(&self) -> Result<()> {
        self.inner.store.health_check().await
    }

    /// Serves a batch: exactly one response per request, in input order
    pub async fn fetch(&self, batch: Vec<Request>) -> Vec<Response> {
        let _timer = time_batch();
        let deadline = self.inner.config.batch_deadline().map(|d| Instant::now() + d);
        let now_millis = Utc::now().timestamp_millis();
        debug!(stage = ?BatchStage::Received, requests = batch.len(), "Fetching batch");

        let (shapes, leaves) = {
            let plans = self.resolve_plans(&batch, deadline).await;
            debug!(stage = ?BatchStage::PlansResolved, names = plans.len());
            expand(&batch, &plans, now_millis)
        };
        let keys = unique_keys(&leaves);
        debug!(stage = ?BatchStage::KeysEncoded, leaves = leaves.len(), keys = keys.len());

        debug!(stage = ?BatchStage::FetchInFlight, keys = keys.len());
        let fetched = self.fetch_keys(keys, deadline).await;

        let mut results: Vec<Option<Result<FeatureRow>>> =
            leaves.iter().map(|leaf| Some(aggregate(leaf, &fetched))).collect();
        debug!(stage = ?BatchStage::Aggregated, leaves = results.len());

        let outcomes = shapes
            .into_iter()
            .map(|shape| into_outcome(shape, &mut results))
            .collect();
        let responses = assemble(batch, outcomes);
        for response in &responses {
            record_response(response.status());
        }
        debug!(stage = ?BatchStage::Assembled, responses = responses.len());

        responses
    }

    /// Resolves each distinct request name once
    async fn resolve_plans<'a>(
        &self,
        batch: &'a [Request],
        deadline: Option<Instant>,
    ) -> HashMap<&'a str, Result<Arc<ServingPlan>>> {
        let mut names: Vec<&str> = Vec::new();
        let mut seen = HashSet::new();
        for request in batch {
            if seen.insert(request.name.as_str()) {
                names.push(request.name.as_str());
            }
        }

        let resolved = join_all(names.iter().map(|&name| async move {
            let resolve = self.inner.resolver.resolve(name);
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, resolve)
                    .await
                    .unwrap_or_else(|_| {
                        Err(FetchError::timeout(format!(
                            "resolving '{}' exceeded the batch deadline",
                            name
                        )))
                    }),
                None => resolve.await,
            }
        }))
        .await;

        names.into_iter().zip(resolved).collect()
    }

    /// Issues all lookups concurrently; every key gets an outcome
    async fn fetch_keys(
        &self,
        keys: Vec<PhysicalLookupKey>,
        deadline: Option<Instant>,
    ) -> HashMap<PhysicalLookupKey, LookupOutcome> {
        let mut fetched = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return fetched;
        }

        let timeout = self.inner.config.lookup_timeout();
        let mut tasks = JoinSet::new();
        for chunk in keys.chunks(self.inner.config.max_keys_per_call.max(1)) {
            let chunk = chunk.to_vec();
            let store = Arc::clone(&self.inner.store);
            let permits = Arc::clone(&self.inner.permits);
            tasks.spawn(lookup_chunk(store, permits, chunk, timeout));
        }

        let mut deadline_hit = false;
        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        deadline_hit = true;
                        break;
                    }
                },
                None => tasks.join_next().await,
            };
            match next {
                Some(Ok(results)) => fetched.extend(results),
                Some(Err(e)) => warn!(error = %e, "Store lookup task failed"),
                None => break,
            }
        }

        if deadline_hit {
            warn!(
                pending_calls = tasks.len(),
                "Batch deadline reached with store lookups outstanding"
            );
            tasks.abort_all();
        }

        for key in keys {
            fetched.entry(key).or_insert_with(|| {
                LookupOutcome::Failed(if deadline_hit {
                    FetchError::timeout("batch deadline exceeded")
                } else {
                    FetchError::store_unavailable("store lookup task failed")
                })
            });
        }

        for outcome in fetched.values() {
            if let LookupOutcome::Failed(e) = outcome {
                increment_lookup_failures(e.kind());
            }
        }

        fetched
    }
}

/// Turns requests into leaves, encoding keys along the way
fn expand(
    batch: &[Request],
    plans: &HashMap<&str, Result<Arc<ServingPlan>>>,
    now_millis: i64,
) -> (Vec<Shape>, Vec<Leaf>) {
    let mut shapes = Vec::with_capacity(batch.len());
    let mut leaves = Vec::new();

    for request in batch {
        let at_millis = request.at_millis.unwrap_or(now_millis);
        let plan = match plans.get(request.name.as_str()) {
            Some(Ok(plan)) => plan,
            Some(Err(e)) => {
                shapes.push(Shape::Failed(e.clone()));
                continue;
            }
            None => {
                shapes.push(Shape::Failed(FetchError::unknown_name(request.name.clone())));
                continue;
            }
        };

        match &**plan {
            ServingPlan::GroupBy(group_by) => {
                shapes.push(Shape::GroupBy(leaves.len()));
                leaves.push(Leaf {
                    group_by: Arc::clone(group_by),
                    at_millis,
                    key: encode(&request.keys, &group_by.keys, &group_by.dataset),
                });
            }
            ServingPlan::Join(join) => {
                let mut parts = Vec::with_capacity(join.parts.len());
                for part in &join.parts {
                    let keys = remap_keys(&request.keys, &part.key_mappings);
                    parts.push((part.namespace.clone(), leaves.len()));
                    leaves.push(Leaf {
                        group_by: Arc::clone(&part.group_by),
                        at_millis,
                        key: encode(&keys, &part.group_by.keys, &part.group_by.dataset),
                    });
                }
                shapes.push(Shape::Join { at_millis, parts });
            }
        }
    }

    (shapes, leaves)
}

/// Distinct keys in first-seen order
fn unique_keys(leaves: &[Leaf]) -> Vec<PhysicalLookupKey> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    let mut wanted = 0;
    for key in leaves.iter().filter_map(|leaf| leaf.key.as_ref().ok()) {
        wanted += 1;
        if seen.insert(key) {
            keys.push(key.clone());
        }
    }

    increment_lookups(keys.len());
    increment_coalesced(wanted - keys.len());
    keys
}

async fn lookup_chunk(
    store: Arc<dyn StoreClient>,
    permits: Arc<Semaphore>,
    keys: Vec<PhysicalLookupKey>,
    timeout: Duration,
) -> Vec<(PhysicalLookupKey, LookupOutcome)> {
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return fail_all(keys, FetchError::store_unavailable("lookup pool closed")),
    };

    let started = std::time::Instant::now();
    let results = tokio::time::timeout(timeout + STORE_GRACE, store.multi_get(&keys, timeout)).await;
    record_store_call(store.store_type(), started.elapsed());

    match results {
        Ok(results) => fill_missing(keys, results),
        Err(_) => {
            warn!(
                keys = keys.len(),
                store = store.store_type(),
                "Store call overran its timeout"
            );
            fail_all(
                keys,
                FetchError::timeout(format!("store call exceeded {:?}", timeout)),
            )
        }
    }
}

fn fail_all(
    keys: Vec<PhysicalLookupKey>,
    error: FetchError,
) -> Vec<(PhysicalLookupKey, LookupOutcome)> {
    keys.into_iter()
        .map(|key| (key, LookupOutcome::Failed(error.clone())))
        .collect()
}

/// Gives keys the store left out of its answer a failure outcome
fn fill_missing(
    keys: Vec<PhysicalLookupKey>,
    mut results: Vec<(PhysicalLookupKey, LookupOutcome)>,
) -> Vec<(PhysicalLookupKey, LookupOutcome)> {
    if results.len() == keys.len() {
        return results;
    }
    let returned: HashSet<PhysicalLookupKey> = results.iter().map(|(k, _)| k.clone()).collect();
    for key in keys {
        if !returned.contains(&key) {
            results.push((
                key,
                LookupOutcome::Failed(FetchError::store_unavailable("store returned no result for key")),
            ));
        }
    }
    results
}

fn aggregate(leaf: &Leaf, fetched: &HashMap<PhysicalLookupKey, LookupOutcome>) -> Result<FeatureRow> {
    let key = leaf.key.as_ref().map_err(|e| e.clone())?;
    let result = match fetched.get(key) {
        Some(LookupOutcome::Found(raw)) => compute(&leaf.group_by, raw, leaf.at_millis),
        Some(LookupOutcome::NotFound) => {
            compute(&leaf.group_by, &RawStoreValue::empty(), leaf.at_millis)
        }
        Some(LookupOutcome::Failed(e)) => Err(e.clone()),
        None => Err(FetchError::store_unavailable(format!("no lookup result for {}", key))),
    };

    if let Err(e) = &result {
        debug!(group_by = %leaf.group_by.name, key = %key, error = %e, "Leaf failed");
    }
    result
}

fn into_outcome(shape: Shape, results: &mut [Option<Result<FeatureRow>>]) -> RequestOutcome {
    let mut take = |leaf: usize| {
        results
            .get_mut(leaf)
            .and_then(Option::take)
            .unwrap_or_else(|| Err(FetchError::aggregation("leaf result already consumed")))
    };

    match shape {
        Shape::Failed(e) => RequestOutcome::Failed(e),
        Shape::GroupBy(leaf) => RequestOutcome::GroupBy(take(leaf)),
        Shape::Join { at_millis, parts } => RequestOutcome::Join {
            at_millis,
            parts: parts
                .into_iter()
                .map(|(namespace, leaf)| (namespace, take(leaf)))
                .collect(),
        },
    }
}
