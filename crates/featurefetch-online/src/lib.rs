//! FeatureFetch Online - point-in-time feature serving
//!
//! This crate turns batches of named feature requests into feature values,
//! using precomputed partial aggregates from a key-value store plus the raw
//! events written since their checkpoint.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Fetcher                                 │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  batch ──► MetadataResolver ──► KeyCodec ──► StoreClient          │
//! │            (plan cache,         (encode,     (coalesced,          │
//! │             bg refresh)          remap)       bounded multi_get)  │
//! │                                                    │              │
//! │  responses ◄── ResponseAssembler ◄── AggregationEngine            │
//! │               (order, Join merge,   (snapshot ⊕ tail as of T)     │
//! │                partial status)                                    │
//! │                                                                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use featurefetch_online::{config, Fetcher, InMemoryStore};
//!
//! let config = config::load("featurefetch.yaml")?;
//! let fetcher = Fetcher::from_source(metadata_source, Arc::new(InMemoryStore::new()), config);
//! let _refresh = fetcher.spawn_refresh_loop();
//!
//! let responses = fetcher
//!     .fetch(vec![Request::new("checkout", keys)])
//!     .await;
//! for response in &responses {
//!     println!("{}: {:?}", response.status(), response.row());
//! }
//! ```
//!
//! ### Redis
//!
//! Enable the `redis` feature for [`RedisStore`]; wrap it in a
//! [`RetryingStoreClient`] to retry transport failures within the call's
//! time budget.

pub mod assembler;
pub mod config;
pub mod dispatcher;
pub mod memory_store;
pub mod observability;
pub mod resolver;
pub mod retry;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use assembler::{assemble, RequestOutcome};
pub use config::{FetcherConfig, MetadataConfig};
pub use dispatcher::{BatchStage, Fetcher};
pub use memory_store::InMemoryStore;
pub use resolver::MetadataResolver;
pub use retry::{RetryPolicy, RetryingStoreClient};

#[cfg(feature = "redis")]
pub use redis_store::{RedisConfig, RedisStore};

// Re-export core types for convenience
pub use featurefetch_core::{
    FeatureRow, FeatureValue, FetchError, FetchResult, PartFailure, Request, Response,
};
