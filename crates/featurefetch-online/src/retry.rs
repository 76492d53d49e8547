//! Retrying store client decorator
//!
//! Wraps any [`StoreClient`] and re-issues lookups that failed with a
//! transport error (`StoreUnavailable`), using exponential backoff with
//! jitter. Timeouts are never retried, and all attempts share the caller's
//! timeout budget, so the decorated client still honours the `multi_get`
//! contract.
//!
//! # Example
//!
//! ```rust,ignore
//! use featurefetch_online::retry::{RetryPolicy, RetryingStoreClient};
//!
//! let store = RetryingStoreClient::new(redis_store, RetryPolicy::default());
//! let fetcher = Fetcher::new(resolver, Arc::new(store), config);
//! ```

use async_trait::async_trait;
use featurefetch_core::{LookupOutcome, PhysicalLookupKey, Result, StoreClient};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backoff schedule for re-issuing failed lookups inside one `multi_get`
///
/// Store calls run under a budget of tens of milliseconds, so delays are
/// short and a retry only happens if its backoff still fits in what is
/// left of the caller's timeout.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Re-issues after the first attempt
    pub max_retries: usize,
    /// Wait before the first re-issue
    pub base_delay: Duration,
    /// Upper bound on any single wait
    pub max_delay: Duration,
    /// Growth factor per re-issue
    pub multiplier: f64,
    /// Each wait is scaled by a random factor in `1 ± jitter`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before re-issue number `attempt` (zero-based)
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let grown = (self.base_delay.as_nanos() as f64 * self.multiplier.powi(attempt as i32))
            .min(self.max_delay.as_nanos() as f64);
        let scale = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        Duration::from_nanos((grown * scale).max(0.0).round() as u64)
    }

    /// Wait before re-issue `attempt`, or `None` once retries or the
    /// remaining budget are used up
    pub fn next_delay(&self, attempt: usize, remaining: Duration) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let delay = self.backoff_delay(attempt);
        (delay < remaining).then_some(delay)
    }
}

/// Store client that retries transport failures
pub struct RetryingStoreClient<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: StoreClient> RetryingStoreClient<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

fn is_retryable(outcome: &LookupOutcome) -> bool {
    matches!(outcome, LookupOutcome::Failed(e) if e.is_transient())
}

#[async_trait]
impl<S: StoreClient> StoreClient for RetryingStoreClient<S> {
    async fn multi_get(
        &self,
        keys: &[PhysicalLookupKey],
        timeout: Duration,
    ) -> Vec<(PhysicalLookupKey, LookupOutcome)> {
        let start = Instant::now();
        let mut results = self.inner.multi_get(keys, timeout).await;

        for attempt in 0.. {
            let retry_at: Vec<usize> = results
                .iter()
                .enumerate()
                .filter(|(_, (_, outcome))| is_retryable(outcome))
                .map(|(i, _)| i)
                .collect();
            if retry_at.is_empty() {
                break;
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            let Some(delay) = self.policy.next_delay(attempt, remaining) else {
                warn!(
                    failed = retry_at.len(),
                    attempts = attempt + 1,
                    "Giving up on store retries"
                );
                break;
            };
            tokio::time::sleep(delay).await;

            let retry_keys: Vec<PhysicalLookupKey> =
                retry_at.iter().map(|&i| results[i].0.clone()).collect();
            let remaining = timeout.saturating_sub(start.elapsed());
            debug!(
                keys = retry_keys.len(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Retrying store lookups"
            );

            let retried = self.inner.multi_get(&retry_keys, remaining).await;
            for (slot, (key, outcome)) in retry_at.into_iter().zip(retried) {
                if results[slot].0 == key {
                    results[slot].1 = outcome;
                }
            }
        }

        results
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }

    fn store_type(&self) -> &'static str {
        self.inner.store_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use featurefetch_core::{FetchError, RawStoreValue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every key with `error` for the first `failures` calls
    struct FlakyStore {
        failures: usize,
        error: FetchError,
        calls: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize, error: FetchError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StoreClient for FlakyStore {
        async fn multi_get(
            &self,
            keys: &[PhysicalLookupKey],
            _timeout: Duration,
        ) -> Vec<(PhysicalLookupKey, LookupOutcome)> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            keys.iter()
                .map(|k| {
                    let outcome = if call < self.failures {
                        LookupOutcome::Failed(self.error.clone())
                    } else {
                        LookupOutcome::Found(RawStoreValue::empty())
                    };
                    (k.clone(), outcome)
                })
                .collect()
        }

        fn store_type(&self) -> &'static str {
            "flaky"
        }
    }

    fn keys() -> Vec<PhysicalLookupKey> {
        (0..3)
            .map(|i| PhysicalLookupKey {
                dataset: "ds".to_string(),
                key_bytes: vec![i],
            })
            .collect()
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(5));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(50));
    }

    #[test]
    fn test_next_delay_respects_retries_and_budget() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        let budget = Duration::from_millis(100);
        assert_eq!(policy.next_delay(0, budget), Some(Duration::from_millis(5)));
        assert_eq!(policy.next_delay(2, budget), None);
        assert_eq!(policy.next_delay(0, Duration::from_millis(5)), None);
        assert_eq!(RetryPolicy::none().next_delay(0, budget), None);
    }

    #[tokio::test]
    async fn test_retries_transport_failures() {
        let store = RetryingStoreClient::new(
            FlakyStore::new(1, FetchError::store_unavailable("connection reset")),
            RetryPolicy::default(),
        );

        let results = store.multi_get(&keys(), Duration::from_secs(1)).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, o)| matches!(o, LookupOutcome::Found(_))));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_never_retries_timeouts() {
        let store = RetryingStoreClient::new(
            FlakyStore::new(1, FetchError::timeout("slow")),
            RetryPolicy::default(),
        );

        let results = store.multi_get(&keys(), Duration::from_secs(1)).await;
        assert!(results.iter().all(|(_, o)| o.is_failed()));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let store = RetryingStoreClient::new(
            FlakyStore::new(usize::MAX, FetchError::store_unavailable("down")),
            RetryPolicy::default(),
        );

        let results = store.multi_get(&keys(), Duration::from_secs(1)).await;
        assert!(results.iter().all(|(_, o)| o.is_failed()));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_respects_time_budget() {
        let store = RetryingStoreClient::new(
            FlakyStore::new(usize::MAX, FetchError::store_unavailable("down")),
            RetryPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(100),
                ..RetryPolicy::default()
            },
        );

        let results = store.multi_get(&keys(), Duration::from_millis(20)).await;
        assert!(results.iter().all(|(_, o)| o.is_failed()));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 1);
    }
}
