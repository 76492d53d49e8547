//! Plan cache: request name → compiled serving plan
//!
//! ## Lifecycle
//!
//! ```text
//!   resolve(name)
//!        │
//!        ├─ cached & fresh ──────────────► plan                 (hit)
//!        ├─ cached & expired ─┬──────────► stale plan           (stale)
//!        │                    └─ spawn refresh (one per name)
//!        └─ not cached ──► build from source, insert ─► plan   (miss)
//! ```
//!
//! Entries are replaced wholesale, never mutated: readers holding an
//! `Arc<ServingPlan>` keep a consistent plan while a refresh swaps in a new
//! one. A failed refresh is logged and the stale plan stays in service.

use crate::observability::{increment_refresh_failures, record_plan_cache, set_plan_cache_size};
use dashmap::{DashMap, DashSet};
use featurefetch_core::{build_plan, MetadataSource, Result, ServingPlan};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Shared, cheaply cloneable plan cache
#[derive(Clone)]
pub struct MetadataResolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    source: Arc<dyn MetadataSource>,
    ttl: Duration,
    entries: DashMap<String, Arc<PlanEntry>>,
    /// Names with a refresh in flight
    refreshing: DashSet<String>,
}

struct PlanEntry {
    plan: Arc<ServingPlan>,
    fresh_until: Instant,
}

impl MetadataResolver {
    pub fn new(source: Arc<dyn MetadataSource>, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                source,
                ttl,
                entries: DashMap::new(),
                refreshing: DashSet::new(),
            }),
        }
    }

    /// Returns the plan for `name`
    ///
    /// Only a cold miss waits on the metadata source. Fails with
    /// `UnknownName` or `CyclicDefinition` from the build on a cold miss.
    pub async fn resolve(&self, name: &str) -> Result<Arc<ServingPlan>> {
        let cached = self.inner.entries.get(name).map(|e| Arc::clone(e.value()));

        if let Some(entry) = cached {
            if Instant::now() < entry.fresh_until {
                record_plan_cache("hit");
            } else {
                record_plan_cache("stale");
                self.trigger_refresh(name);
            }
            return Ok(Arc::clone(&entry.plan));
        }

        record_plan_cache("miss");
        debug!(name, "Plan cache miss");
        self.refresh(name).await
    }

    /// Rebuilds `name` from the source and replaces the cached entry
    ///
    /// On failure the existing entry, if any, is left untouched.
    pub async fn refresh(&self, name: &str) -> Result<Arc<ServingPlan>> {
        let plan = Arc::new(build_plan(self.inner.source.as_ref(), name).await?);
        let entry = Arc::new(PlanEntry {
            plan: Arc::clone(&plan),
            fresh_until: Instant::now() + self.inner.ttl,
        });
        let replaced = self.inner.entries.insert(name.to_string(), entry).is_some();
        set_plan_cache_size(self.inner.entries.len());

        info!(name, replaced, join = plan.is_join(), "Cached serving plan");
        Ok(plan)
    }

    /// Marks `name` expired so the next resolve refreshes it in the background
    pub fn invalidate(&self, name: &str) {
        if let Some(mut entry) = self.inner.entries.get_mut(name) {
            let plan = Arc::clone(&entry.plan);
            *entry = Arc::new(PlanEntry {
                plan,
                fresh_until: Instant::now(),
            });
            debug!(name, "Invalidated serving plan");
        }
    }

    /// Drops `name` from the cache; the next resolve is a cold miss
    pub fn evict(&self, name: &str) -> bool {
        let removed = self.inner.entries.remove(name).is_some();
        set_plan_cache_size(self.inner.entries.len());
        removed
    }

    /// Currently cached plan for `name`, fresh or not
    pub fn cached(&self, name: &str) -> Option<Arc<ServingPlan>> {
        self.inner.entries.get(name).map(|e| Arc::clone(&e.plan))
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Starts a background refresh for `name` unless one is already running
    fn trigger_refresh(&self, name: &str) {
        if !self.inner.refreshing.insert(name.to_string()) {
            return;
        }

        let resolver = self.clone();
        let guard = RefreshGuard {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
        };
        tokio::spawn(async move {
            if let Err(e) = resolver.refresh(&guard.name).await {
                increment_refresh_failures();
                warn!(name = %guard.name, error = %e, "Plan refresh failed, serving stale plan");
            }
        });
    }

    /// Periodically refreshes every expired entry
    ///
    /// The loop holds only a weak reference and exits once every resolver
    /// handle has been dropped.
    pub fn spawn_refresh_loop(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<ResolverInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let resolver = MetadataResolver { inner };

                let now = Instant::now();
                let expired: Vec<String> = resolver
                    .inner
                    .entries
                    .iter()
                    .filter(|e| e.fresh_until <= now)
                    .map(|e| e.key().clone())
                    .collect();

                if !expired.is_empty() {
                    debug!(count = expired.len(), "Refreshing expired plans");
                }
                for name in expired {
                    resolver.trigger_refresh(&name);
                }
            }
        })
    }
}

/// Clears a name's in-flight refresh marker however the refresh task ends
struct RefreshGuard {
    inner: Arc<ResolverInner>,
    name: String,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.inner.refreshing.remove(&self.name);
    }
}
