//! Redis store client
//!
//! ## Layout
//!
//! One Redis string per physical key: the key is
//! `{prefix}{dataset}:{key_bytes}` and the value is the MessagePack
//! encoding of a [`RawStoreValue`] (snapshots plus event tail).
//!
//! ## Performance
//!
//! 1. **Single round-trip**: a `multi_get` is one `MGET` for all its keys
//! 2. **Connection pooling**: multiplexed connection manager (one TCP
//!    connection, concurrent requests from every batch)
//! 3. **Binary values**: MessagePack, no text encoding overhead

use async_trait::async_trait;
use featurefetch_core::{
    FetchError, LookupOutcome, PhysicalLookupKey, RawStoreValue, Result, StoreClient,
};
use redis::aio::ConnectionManager;
use redis::{Client, Pipeline};
use std::time::Duration;

/// Redis store configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Prepended to every physical key
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "ff:".to_string(),
        }
    }
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Store client over a multiplexed Redis connection
pub struct RedisStore {
    conn: ConnectionManager,
    config: RedisConfig,
}

impl RedisStore {
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.clone())
            .map_err(|e| FetchError::store_unavailable(format!("Redis connection error: {}", e)))?;

        let conn = ConnectionManager::new(client).await.map_err(|e| {
            FetchError::store_unavailable(format!("Redis connection manager error: {}", e))
        })?;

        Ok(Self { conn, config })
    }

    fn redis_key(&self, key: &PhysicalLookupKey) -> Vec<u8> {
        let mut out = self.config.key_prefix.as_bytes().to_vec();
        out.extend_from_slice(&key.to_store_key());
        out
    }

    fn encode_value(value: &RawStoreValue) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(FetchError::serialization)
    }

    fn decode_value(data: &[u8]) -> Result<RawStoreValue> {
        rmp_serde::from_slice(data)
            .map_err(|e| FetchError::aggregation(format!("malformed store value: {}", e)))
    }

    /// Writes values in one pipelined round-trip
    pub async fn put_many(
        &self,
        values: &[(PhysicalLookupKey, RawStoreValue)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let mut pipe = Pipeline::new();
        for (key, value) in values {
            let redis_key = self.redis_key(key);
            let data = Self::encode_value(value)?;
            match ttl {
                Some(ttl) => pipe.set_ex(redis_key, data, ttl.as_secs()),
                None => pipe.set(redis_key, data),
            };
        }

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| FetchError::store_unavailable(format!("Redis pipeline error: {}", e)))?;

        tracing::debug!(keys = values.len(), "Redis write complete");
        Ok(())
    }

    async fn mget(&self, keys: &[PhysicalLookupKey]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut conn = self.conn.clone();
        let redis_keys: Vec<Vec<u8>> = keys.iter().map(|k| self.redis_key(k)).collect();

        // explicit MGET: the client's mget helper switches to GET for one key
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&redis_keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| FetchError::store_unavailable(format!("Redis MGET error: {}", e)))?;

        Ok(values)
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    async fn multi_get(
        &self,
        keys: &[PhysicalLookupKey],
        timeout: Duration,
    ) -> Vec<(PhysicalLookupKey, LookupOutcome)> {
        if keys.is_empty() {
            return Vec::new();
        }

        let fetched = match tokio::time::timeout(timeout, self.mget(keys)).await {
            Ok(Ok(values)) if values.len() == keys.len() => values,
            Ok(Ok(values)) => {
                let err = FetchError::store_unavailable(format!(
                    "Redis MGET returned {} values for {} keys",
                    values.len(),
                    keys.len()
                ));
                return fail_all(keys, err);
            }
            Ok(Err(e)) => {
                tracing::warn!(keys = keys.len(), error = %e, "Redis lookup failed");
                return fail_all(keys, e);
            }
            Err(_) => {
                return fail_all(
                    keys,
                    FetchError::timeout(format!("Redis MGET exceeded {:?}", timeout)),
                )
            }
        };

        keys.iter()
            .cloned()
            .zip(fetched)
            .map(|(key, value)| {
                let outcome = match value {
                    Some(data) => match Self::decode_value(&data) {
                        Ok(raw) => LookupOutcome::Found(raw),
                        Err(e) => LookupOutcome::Failed(e),
                    },
                    None => LookupOutcome::NotFound,
                };
                (key, outcome)
            })
            .collect()
    }

    /// Health check using PING
    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| FetchError::store_unavailable(format!("Redis PING failed: {}", e)))?;

        if pong != "PONG" {
            return Err(FetchError::store_unavailable(format!(
                "Redis health check failed: expected PONG, got {}",
                pong
            )));
        }

        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}

fn fail_all(keys: &[PhysicalLookupKey], error: FetchError) -> Vec<(PhysicalLookupKey, LookupOutcome)> {
    keys.iter()
        .map(|k| (k.clone(), LookupOutcome::Failed(error.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use featurefetch_core::{FeatureValue, RawEvent, Snapshot};

    #[test]
    fn test_redis_config_default() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.key_prefix, "ff:");
    }

    #[test]
    fn test_value_encoding() {
        let value = RawStoreValue::empty()
            .with_snapshot(Snapshot {
                checkpoint_millis: 10,
                state: vec![1, 2, 3],
            })
            .with_events(vec![RawEvent::new(11).with_field("amount", FeatureValue::Float(2.5))]);

        let data = RedisStore::encode_value(&value).unwrap();
        assert_eq!(RedisStore::decode_value(&data).unwrap(), value);
        assert!(matches!(
            RedisStore::decode_value(&[0xc1]),
            Err(FetchError::Aggregation(_))
        ));
    }

    #[tokio::test]
    #[ignore = "Requires Redis to be running"]
    async fn test_redis_round_trip() {
        let store = RedisStore::new(RedisConfig::default()).await.unwrap();
        store.health_check().await.unwrap();

        let present = PhysicalLookupKey {
            dataset: "test_purchases".to_string(),
            key_bytes: vec![1],
        };
        let absent = PhysicalLookupKey {
            dataset: "test_purchases".to_string(),
            key_bytes: vec![2],
        };
        let value = RawStoreValue::empty().with_events(vec![RawEvent::new(5)]);
        store
            .put_many(&[(present.clone(), value.clone())], Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let results = store
            .multi_get(&[present.clone(), absent.clone()], Duration::from_secs(1))
            .await;
        assert_eq!(results[0], (present, LookupOutcome::Found(value)));
        assert_eq!(results[1], (absent, LookupOutcome::NotFound));
    }
}
