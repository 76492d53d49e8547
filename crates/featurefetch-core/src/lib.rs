//! # FeatureFetch Core Library
//!
//! Core types and pure logic for serving point-in-time correct feature
//! values: no runtime, no I/O beyond the two collaborator traits.
//!
//! ## Key Components
//!
//! - **codec**: entity keys → deterministic physical lookup keys
//! - **plan**: GroupBy / Join definitions and their flattened serving plans
//! - **aggregation**: snapshot + event-tail merge as of a timestamp
//! - **MetadataSource** / **StoreClient**: the traits external systems implement
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use featurefetch_core::prelude::*;
//!
//! let plan = build_plan(&source, "user_purchases").await?;
//! if let ServingPlan::GroupBy(gb) = plan {
//!     let row = compute(&gb, &raw_value, at_millis)?;
//!     println!("{:?}", row.get_feature("amount_sum_7d"));
//! }
//! ```

pub use aggregation::{compute, Ir, PartialAggregates};
pub use codec::{encode, remap_keys, KeyField, PhysicalLookupKey};
pub use error::{FetchError, Result};
pub use metadata::{InMemoryMetadataSource, MetadataSource};
pub use plan::{
    build_plan, compile_plan, AggregationDef, Definition, GroupByDef, GroupByPlan, JoinDef,
    JoinPartDef, JoinPartPlan, JoinPlan, Operation, ServingPlan,
};
pub use store::{LookupOutcome, RawEvent, RawStoreValue, Snapshot, StoreClient};
pub use time_window::Window;
pub use types::{
    FeatureRow, FeatureValue, FetchResult, PartFailure, Request, Response, ValueType,
};

pub mod aggregation;
pub mod codec;
mod error;
pub mod metadata;
pub mod plan;
pub mod store;
pub mod time_window;
mod types;

pub mod prelude {
    pub use crate::aggregation::compute;
    pub use crate::codec::{encode, PhysicalLookupKey};
    pub use crate::error::{FetchError, Result};
    pub use crate::metadata::MetadataSource;
    pub use crate::plan::{build_plan, Definition, GroupByPlan, ServingPlan};
    pub use crate::store::{LookupOutcome, RawStoreValue, StoreClient};
    pub use crate::types::{FeatureRow, FeatureValue, FetchResult, Request, Response};
}
