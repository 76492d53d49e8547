//! Serving plans: how to answer a request for a given name
//!
//! The metadata source hands out [`Definition`]s. A GroupBy definition
//! compiles into a [`GroupByPlan`]; a Join definition is flattened into its
//! leaf GroupBys, each carrying the key renames and the feature namespace it
//! was reached through. Joins may nest other Joins, so flattening walks the
//! dependency graph with an explicit stack and rejects cycles.
//!
//! ```text
//! Join "checkout"                       JoinPlan "checkout"
//! ├─ GroupBy "user_purchases"    ──►    ├─ user_purchases.*       (user_id)
//! └─ Join "item_signals"                ├─ item_views.*           (item_id)
//!    ├─ GroupBy "item_views"            └─ risk_item_returns.*    (item_id)
//!    └─ GroupBy "item_returns" (prefix "risk")
//! ```

use crate::codec::KeyField;
use crate::metadata::MetadataSource;
use crate::time_window::Window;
use crate::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Default tile size for stored partial aggregates (one hour)
pub const DEFAULT_TILE_MILLIS: i64 = 60 * 60 * 1000;

/// Aggregation operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Number of events with a non-null input
    Count,
    Sum,
    Min,
    Max,
    Average,
    /// Value of the earliest event (by event time)
    First,
    /// Value of the latest event (by event time)
    Last,
    /// Values of the latest `k` events, newest first
    LastK(usize),
}

impl Operation {
    pub fn name(&self) -> String {
        match self {
            Operation::Count => "count".to_string(),
            Operation::Sum => "sum".to_string(),
            Operation::Min => "min".to_string(),
            Operation::Max => "max".to_string(),
            Operation::Average => "average".to_string(),
            Operation::First => "first".to_string(),
            Operation::Last => "last".to_string(),
            Operation::LastK(k) => format!("last{}", k),
        }
    }
}

/// One aggregation of a GroupBy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationDef {
    /// Event field the operator reads
    pub input_column: String,
    pub operation: Operation,
    /// Trailing window; `None` aggregates over all history
    #[serde(default)]
    pub window: Option<Window>,
}

impl AggregationDef {
    pub fn new(input_column: impl Into<String>, operation: Operation) -> Self {
        Self {
            input_column: input_column.into(),
            operation,
            window: None,
        }
    }

    pub fn windowed(mut self, window: Window) -> Self {
        self.window = Some(window);
        self
    }

    /// Output feature name: `{input}_{op}` or `{input}_{op}_{window}`
    pub fn output_name(&self) -> String {
        match &self.window {
            Some(window) => format!(
                "{}_{}_{}",
                self.input_column,
                self.operation.name(),
                window.name()
            ),
            None => format!("{}_{}", self.input_column, self.operation.name()),
        }
    }
}

/// A named aggregation over an entity's event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupByDef {
    pub name: String,
    /// Store dataset holding this GroupBy's snapshots and events
    pub dataset: String,
    pub keys: Vec<KeyField>,
    pub aggregations: Vec<AggregationDef>,
    /// Granularity of stored partial-aggregate tiles
    #[serde(default = "default_tile_millis")]
    pub tile_millis: i64,
}

fn default_tile_millis() -> i64 {
    DEFAULT_TILE_MILLIS
}

/// Reference from a Join to a GroupBy or a nested Join
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JoinPartDef {
    pub name: String,
    /// Request key name → key name of the referenced definition
    #[serde(default)]
    pub key_mapping: HashMap<String, String>,
    /// Prepended to the namespace of every feature reached through this part
    #[serde(default)]
    pub prefix: Option<String>,
}

impl JoinPartDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.key_mapping.insert(from.into(), to.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

/// A named composite of GroupBys sharing entity keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinDef {
    pub name: String,
    pub parts: Vec<JoinPartDef>,
}

/// Definition as stored by the metadata source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Definition {
    GroupBy(GroupByDef),
    Join(JoinDef),
}

impl Definition {
    pub fn name(&self) -> &str {
        match self {
            Definition::GroupBy(def) => &def.name,
            Definition::Join(def) => &def.name,
        }
    }
}

/// Validated GroupBy, ready to serve
#[derive(Debug, Clone, PartialEq)]
pub struct GroupByPlan {
    pub name: String,
    pub dataset: String,
    pub keys: Vec<KeyField>,
    pub aggregations: Vec<AggregationDef>,
    pub tile_millis: i64,
}

impl GroupByPlan {
    /// Validates a definition
    ///
    /// Rejects empty aggregation lists, non-positive tile sizes and window
    /// lengths, duplicate key names and duplicate output feature names.
    pub fn compile(def: GroupByDef) -> Result<Self> {
        if def.aggregations.is_empty() {
            return Err(FetchError::config(format!(
                "GroupBy '{}' has no aggregations",
                def.name
            )));
        }
        if def.tile_millis <= 0 {
            return Err(FetchError::config(format!(
                "GroupBy '{}' has non-positive tile size {}",
                def.name, def.tile_millis
            )));
        }

        let mut key_names = HashSet::new();
        for key in &def.keys {
            if !key_names.insert(key.name.as_str()) {
                return Err(FetchError::config(format!(
                    "GroupBy '{}' declares key '{}' twice",
                    def.name, key.name
                )));
            }
        }

        let mut outputs = HashSet::new();
        for agg in &def.aggregations {
            if let Operation::LastK(0) = agg.operation {
                return Err(FetchError::config(format!(
                    "GroupBy '{}': last_k needs k > 0",
                    def.name
                )));
            }
            if let Some(window) = agg.window.filter(|w| w.length_millis <= 0) {
                return Err(FetchError::config(format!(
                    "GroupBy '{}': window of {}ms on '{}' must be positive",
                    def.name, window.length_millis, agg.input_column
                )));
            }
            if !outputs.insert(agg.output_name()) {
                return Err(FetchError::config(format!(
                    "GroupBy '{}' produces '{}' twice",
                    def.name,
                    agg.output_name()
                )));
            }
        }

        Ok(Self {
            name: def.name,
            dataset: def.dataset,
            keys: def.keys,
            aggregations: def.aggregations,
            tile_millis: def.tile_millis,
        })
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.aggregations.iter().map(|a| a.output_name()).collect()
    }
}

/// A leaf GroupBy reached from a Join
#[derive(Debug, Clone, PartialEq)]
pub struct JoinPartPlan {
    /// Feature namespace: the GroupBy name, prefixed when a part declared one
    pub namespace: String,
    /// Key renames to apply, outermost Join first
    pub key_mappings: Vec<HashMap<String, String>>,
    pub group_by: Arc<GroupByPlan>,
}

/// Flattened Join
#[derive(Debug, Clone, PartialEq)]
pub struct JoinPlan {
    pub name: String,
    pub parts: Vec<JoinPartPlan>,
}

/// Resolved, immutable description of how to answer a request
#[derive(Debug, Clone, PartialEq)]
pub enum ServingPlan {
    GroupBy(Arc<GroupByPlan>),
    Join(JoinPlan),
}

impl ServingPlan {
    pub fn name(&self) -> &str {
        match self {
            ServingPlan::GroupBy(plan) => &plan.name,
            ServingPlan::Join(plan) => &plan.name,
        }
    }

    pub fn is_join(&self) -> bool {
        matches!(self, ServingPlan::Join(_))
    }
}

/// Resolves `name` against a metadata source into a serving plan
///
/// Fetches every definition reachable from `name` first, then flattens the
/// graph synchronously. Fails with `UnknownName` if any referenced name is
/// undefined and with `CyclicDefinition` if a Join reaches itself.
pub async fn build_plan(source: &dyn MetadataSource, name: &str) -> Result<ServingPlan> {
    let definitions = fetch_reachable(source, name).await?;
    debug!(name, definitions = definitions.len(), "Compiling serving plan");
    compile_plan(&definitions, name)
}

async fn fetch_reachable(
    source: &dyn MetadataSource,
    name: &str,
) -> Result<HashMap<String, Definition>> {
    let mut definitions: HashMap<String, Definition> = HashMap::new();
    let mut pending = vec![name.to_string()];

    while let Some(next) = pending.pop() {
        if definitions.contains_key(&next) {
            continue;
        }
        let def = source
            .fetch_definition(&next)
            .await?
            .ok_or_else(|| FetchError::unknown_name(next.clone()))?;
        if let Definition::Join(join) = &def {
            pending.extend(join.parts.iter().map(|p| p.name.clone()));
        }
        definitions.insert(next, def);
    }

    Ok(definitions)
}

struct Frame {
    name: String,
    prefix: Option<String>,
    key_mappings: Vec<HashMap<String, String>>,
    /// Join names from the root down to this frame's parent
    path: Vec<String>,
}

/// Compiles `name` from an already-fetched set of definitions
pub fn compile_plan(definitions: &HashMap<String, Definition>, name: &str) -> Result<ServingPlan> {
    let root = definitions
        .get(name)
        .ok_or_else(|| FetchError::unknown_name(name))?;

    let join = match root {
        Definition::GroupBy(def) => {
            return Ok(ServingPlan::GroupBy(Arc::new(GroupByPlan::compile(
                def.clone(),
            )?)))
        }
        Definition::Join(join) => join,
    };

    let mut compiled: HashMap<String, Arc<GroupByPlan>> = HashMap::new();
    let mut parts = Vec::new();
    let mut namespaces = HashSet::new();

    let mut stack: Vec<Frame> = Vec::new();
    push_parts(&mut stack, join, None, &[], &[name.to_string()]);

    while let Some(frame) = stack.pop() {
        if frame.path.contains(&frame.name) {
            let mut cycle = frame.path.clone();
            cycle.push(frame.name);
            return Err(FetchError::CyclicDefinition(cycle));
        }

        let def = definitions
            .get(&frame.name)
            .ok_or_else(|| FetchError::unknown_name(frame.name.clone()))?;

        match def {
            Definition::GroupBy(gb) => {
                let plan = match compiled.get(&gb.name) {
                    Some(plan) => Arc::clone(plan),
                    None => {
                        let plan = Arc::new(GroupByPlan::compile(gb.clone())?);
                        compiled.insert(gb.name.clone(), Arc::clone(&plan));
                        plan
                    }
                };
                let namespace = match &frame.prefix {
                    Some(prefix) => format!("{}_{}", prefix, gb.name),
                    None => gb.name.clone(),
                };
                if !namespaces.insert(namespace.clone()) {
                    return Err(FetchError::config(format!(
                        "Join '{}' reaches namespace '{}' twice; add a prefix to one part",
                        name, namespace
                    )));
                }
                parts.push(JoinPartPlan {
                    namespace,
                    key_mappings: frame.key_mappings,
                    group_by: plan,
                });
            }
            Definition::Join(inner) => {
                let mut path = frame.path;
                path.push(frame.name);
                push_parts(&mut stack, inner, frame.prefix, &frame.key_mappings, &path);
            }
        }
    }

    Ok(ServingPlan::Join(JoinPlan {
        name: join.name.clone(),
        parts,
    }))
}

fn push_parts(
    stack: &mut Vec<Frame>,
    join: &JoinDef,
    prefix: Option<String>,
    key_mappings: &[HashMap<String, String>],
    path: &[String],
) {
    // reversed so parts pop in declaration order
    for part in join.parts.iter().rev() {
        let part_prefix = match (&prefix, &part.prefix) {
            (Some(outer), Some(own)) => Some(format!("{}_{}", outer, own)),
            (Some(outer), None) => Some(outer.clone()),
            (None, own) => own.clone(),
        };
        let mut mappings = key_mappings.to_vec();
        mappings.push(part.key_mapping.clone());
        stack.push(Frame {
            name: part.name.clone(),
            prefix: part_prefix,
            key_mappings: mappings,
            path: path.to_vec(),
        });
    }
}
