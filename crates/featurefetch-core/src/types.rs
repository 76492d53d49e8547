//! Core data types for featurefetch
//!
//! Requests come in with arbitrary key mappings and leave with arbitrary
//! feature names, so every dynamic value is a [`FeatureValue`] tagged union
//! rather than an open-ended dynamic type.

use crate::FetchError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Type tag of a [`FeatureValue`], used by key schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Float,
    String,
    Bytes,
    List,
}

/// A single typed value: entity key, event field or computed feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    /// Null/missing value
    Null,

    Bool(bool),

    /// Integer value (e.g., click counts, user ids)
    Int(i64),

    /// Floating point value (e.g., amounts, scores)
    Float(f64),

    String(String),

    /// Raw bytes (e.g., hashed identifiers)
    Bytes(Vec<u8>),

    /// Ordered list, used for last-k style features
    List(Vec<FeatureValue>),
}

impl FeatureValue {
    /// Type tag of this value, `None` for `Null`
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(ValueType::Bool),
            Self::Int(_) => Some(ValueType::Int),
            Self::Float(_) => Some(ValueType::Float),
            Self::String(_) => Some(ValueType::String),
            Self::Bytes(_) => Some(ValueType::Bytes),
            Self::List(_) => Some(ValueType::List),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the value (ints widen to floats)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric addition, keeping integers as integers
    ///
    /// Mixing an Int with a Float yields a Float. Non-numeric operands and
    /// integer overflow are aggregation errors.
    pub fn checked_add(&self, other: &FeatureValue) -> Result<FeatureValue, FetchError> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.checked_add(*b).map(Self::Int).ok_or_else(|| {
                FetchError::aggregation(format!("integer sum overflow adding {} and {}", a, b))
            }),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => Ok(Self::Float(x + y)),
                _ => Err(FetchError::aggregation(format!(
                    "cannot add {:?} and {:?}",
                    a.value_type(),
                    b.value_type()
                ))),
            },
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 2,
            Self::String(_) => 3,
            Self::Bytes(_) => 4,
            Self::List(_) => 5,
        }
    }

    /// Deterministic total order over all values
    ///
    /// Numbers compare numerically across Int/Float; other types order by
    /// variant. Used for min/max and as the tie-breaker for events sharing a
    /// timestamp, so results never depend on arrival order.
    pub fn total_cmp(&self, other: &FeatureValue) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.total_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.type_rank().cmp(&b.type_rank()),
            },
        }
    }
}

impl From<i64> for FeatureValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for FeatureValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for FeatureValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<String> for FeatureValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<Vec<u8>> for FeatureValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// A named feature lookup
///
/// `name` identifies a GroupBy or a Join. `at_millis` pins the lookup to a
/// historical point in time; `None` means "latest".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub name: String,
    pub keys: HashMap<String, FeatureValue>,
    #[serde(default)]
    pub at_millis: Option<i64>,
}

impl Request {
    /// Latest-value request
    pub fn new(name: impl Into<String>, keys: HashMap<String, FeatureValue>) -> Self {
        Self {
            name: name.into(),
            keys,
            at_millis: None,
        }
    }

    /// Request pinned to an as-of timestamp (epoch millis)
    pub fn at(name: impl Into<String>, keys: HashMap<String, FeatureValue>, at_millis: i64) -> Self {
        Self {
            name: name.into(),
            keys,
            at_millis: Some(at_millis),
        }
    }

    /// Convenience builder for a single key
    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        self.keys.insert(name.into(), value.into());
        self
    }
}

/// Feature name → value mapping computed for one request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureRow {
    pub features: HashMap<String, FeatureValue>,

    /// The as-of timestamp these values are correct for
    pub at_millis: i64,
}

impl FeatureRow {
    pub fn new(at_millis: i64) -> Self {
        Self {
            features: HashMap::new(),
            at_millis,
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: FeatureValue) -> Self {
        self.features.insert(name.into(), value);
        self
    }

    pub fn get_feature(&self, name: &str) -> Option<&FeatureValue> {
        self.features.get(name)
    }
}

/// A Join constituent that could not be computed
#[derive(Debug, Clone, PartialEq)]
pub struct PartFailure {
    /// Namespace of the failed part (the GroupBy name, possibly prefixed)
    pub part: String,
    pub error: FetchError,
}

/// Outcome of one request
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    /// Every feature was computed
    Complete(FeatureRow),

    /// A Join where some constituents failed; `row` holds the ones that
    /// succeeded
    Partial {
        row: FeatureRow,
        failed: Vec<PartFailure>,
    },

    /// Nothing could be computed for this request
    Failed(FetchError),
}

/// One response per request, in input order
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub request: Request,
    pub result: FetchResult,
}

impl Response {
    /// Feature values, if any were computed
    pub fn row(&self) -> Option<&FeatureRow> {
        match &self.result {
            FetchResult::Complete(row) | FetchResult::Partial { row, .. } => Some(row),
            FetchResult::Failed(_) => None,
        }
    }

    /// The request-level error, if the request failed entirely
    pub fn error(&self) -> Option<&FetchError> {
        match &self.result {
            FetchResult::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.result, FetchResult::Complete(_))
    }

    /// Names of failed Join constituents (empty unless partial)
    pub fn failed_parts(&self) -> Vec<&str> {
        match &self.result {
            FetchResult::Partial { failed, .. } => failed.iter().map(|f| f.part.as_str()).collect(),
            _ => Vec::new(),
        }
    }

    /// Stable status label, used for metrics
    pub fn status(&self) -> &'static str {
        match &self.result {
            FetchResult::Complete(_) => "complete",
            FetchResult::Partial { .. } => "partial",
            FetchResult::Failed(_) => "failed",
        }
    }
}
