//! Point-in-time aggregation over checkpointed state plus a raw event tail
//!
//! ## How a value is computed as of `T`
//!
//! ```text
//!   snapshots:  [cp1]        [cp2]            [cp3 = latest]
//!   events:                                         e e e e
//!   ───────────────────────────────┼────────────────┼───────► time
//!                                  T                T'
//!
//!   as of T  (cp2 ≤ T < cp3): state(cp2)                       (needs history)
//!   as of T' (T' ≥ cp3):      state(cp3) ⊕ events in (cp3, T']
//! ```
//!
//! The base is always the newest snapshot at or before `T`. Events in
//! `(base checkpoint, T]` are merged on top. With no snapshot old enough the
//! request is stale; with no snapshot at all, the event tail is the whole
//! history.
//!
//! ## State Layout
//!
//! A snapshot's state is a MessagePack-encoded [`PartialAggregates`]: per
//! output feature, intermediate representations (IRs) bucketed into tiles
//! of the GroupBy's `tile_millis`. Unwindowed features keep a single
//! all-time tile.
//!
//! Windowed features are evaluated relative to `T`. Tiles entirely inside
//! `(T - L, T]` are merged whole. The one tile straddling `T - L` is refolded
//! from its per-event inputs, which the snapshot keeps per input column, so
//! a windowed value does not depend on where the checkpoint fell:
//!
//! ```text
//!          T - L                                         T
//!   ─────────┼─────────────────────────────────────────────┼──►
//!   |  tile ●|●  |   tile   |   tile   |   tile   |  ...  |
//!    skipped  refold  merged     merged     merged
//! ```
//!
//! ## Merge Order
//!
//! Every IR merge is commutative and associative. Order-sensitive operators
//! (first, last, last-k) compare event timestamps, breaking ties with the
//! value order, so neither arrival order nor merge order changes a result.

use crate::plan::{AggregationDef, GroupByPlan, Operation};
use crate::store::{RawEvent, RawStoreValue, Snapshot};
use crate::{FeatureRow, FeatureValue, FetchError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Tile key used by aggregations without a window
pub const ALL_TIME_TILE: i64 = i64::MIN;

/// A value together with its event time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped {
    pub ts_millis: i64,
    pub value: FeatureValue,
}

impl Stamped {
    fn event_order(&self, other: &Stamped) -> Ordering {
        self.ts_millis
            .cmp(&other.ts_millis)
            .then_with(|| self.value.total_cmp(&other.value))
    }
}

/// Intermediate representation of one aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Ir {
    Count(i64),
    /// `Null` until the first input
    Sum(FeatureValue),
    Min(FeatureValue),
    Max(FeatureValue),
    Average { sum: f64, count: i64 },
    First(Option<Stamped>),
    Last(Option<Stamped>),
    /// Newest first, at most `k` items
    LastK { k: usize, items: Vec<Stamped> },
}

impl Ir {
    pub fn empty(operation: Operation) -> Self {
        match operation {
            Operation::Count => Ir::Count(0),
            Operation::Sum => Ir::Sum(FeatureValue::Null),
            Operation::Min => Ir::Min(FeatureValue::Null),
            Operation::Max => Ir::Max(FeatureValue::Null),
            Operation::Average => Ir::Average { sum: 0.0, count: 0 },
            Operation::First => Ir::First(None),
            Operation::Last => Ir::Last(None),
            Operation::LastK(k) => Ir::LastK {
                k,
                items: Vec::new(),
            },
        }
    }

    /// Folds one non-null input observed at `ts_millis`
    pub fn update(&mut self, ts_millis: i64, value: &FeatureValue) -> Result<()> {
        match self {
            Ir::Count(count) => *count = add_counts(*count, 1)?,
            Ir::Sum(sum) => {
                if value.as_f64().is_none() {
                    return Err(FetchError::aggregation(format!(
                        "sum over non-numeric input {:?}",
                        value.value_type()
                    )));
                }
                *sum = if sum.is_null() {
                    value.clone()
                } else {
                    sum.checked_add(value)?
                };
            }
            Ir::Min(current) => {
                if current.is_null() || value.total_cmp(current) == Ordering::Less {
                    *current = value.clone();
                }
            }
            Ir::Max(current) => {
                if current.is_null() || value.total_cmp(current) == Ordering::Greater {
                    *current = value.clone();
                }
            }
            Ir::Average { sum, count } => {
                let v = value.as_f64().ok_or_else(|| {
                    FetchError::aggregation(format!(
                        "average over non-numeric input {:?}",
                        value.value_type()
                    ))
                })?;
                *sum += v;
                *count = add_counts(*count, 1)?;
            }
            Ir::First(_) | Ir::Last(_) | Ir::LastK { .. } => {
                let item = Stamped {
                    ts_millis,
                    value: value.clone(),
                };
                self.absorb_stamped(item);
            }
        }
        Ok(())
    }

    fn absorb_stamped(&mut self, item: Stamped) {
        match self {
            Ir::First(current) => {
                let replace = match current {
                    Some(existing) => item.event_order(existing) == Ordering::Less,
                    None => true,
                };
                if replace {
                    *current = Some(item);
                }
            }
            Ir::Last(current) => {
                let replace = match current {
                    Some(existing) => item.event_order(existing) == Ordering::Greater,
                    None => true,
                };
                if replace {
                    *current = Some(item);
                }
            }
            Ir::LastK { k, items } => {
                items.push(item);
                items.sort_by(|a, b| b.event_order(a));
                items.truncate(*k);
            }
            _ => {}
        }
    }

    /// Merges another IR of the same operator into this one
    pub fn merge(&mut self, other: &Ir) -> Result<()> {
        match (self, other) {
            (Ir::Count(a), Ir::Count(b)) => *a = add_counts(*a, *b)?,
            (Ir::Sum(a), Ir::Sum(b)) => {
                if !b.is_null() {
                    *a = if a.is_null() { b.clone() } else { a.checked_add(b)? };
                }
            }
            (Ir::Min(a), Ir::Min(b)) => {
                if a.is_null() || (!b.is_null() && b.total_cmp(a) == Ordering::Less) {
                    *a = b.clone();
                }
            }
            (Ir::Max(a), Ir::Max(b)) => {
                if a.is_null() || (!b.is_null() && b.total_cmp(a) == Ordering::Greater) {
                    *a = b.clone();
                }
            }
            (
                Ir::Average { sum, count },
                Ir::Average {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *sum += other_sum;
                *count = add_counts(*count, *other_count)?;
            }
            (this @ Ir::First(_), Ir::First(Some(item)))
            | (this @ Ir::Last(_), Ir::Last(Some(item))) => this.absorb_stamped(item.clone()),
            (Ir::First(_), Ir::First(None)) | (Ir::Last(_), Ir::Last(None)) => {}
            (this @ Ir::LastK { .. }, Ir::LastK { items, .. }) => {
                for item in items {
                    this.absorb_stamped(item.clone());
                }
            }
            (this, other) => {
                return Err(FetchError::aggregation(format!(
                    "cannot merge {} state into {} state",
                    other.label(),
                    this.label()
                )))
            }
        }
        Ok(())
    }

    /// Final feature value
    pub fn finalize(&self) -> FeatureValue {
        match self {
            Ir::Count(count) => FeatureValue::Int(*count),
            Ir::Sum(v) | Ir::Min(v) | Ir::Max(v) => v.clone(),
            Ir::Average { sum, count } => {
                if *count > 0 {
                    FeatureValue::Float(sum / *count as f64)
                } else {
                    FeatureValue::Null
                }
            }
            Ir::First(item) | Ir::Last(item) => item
                .as_ref()
                .map(|s| s.value.clone())
                .unwrap_or(FeatureValue::Null),
            Ir::LastK { items, .. } => {
                FeatureValue::List(items.iter().map(|s| s.value.clone()).collect())
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Ir::Count(_) => "count",
            Ir::Sum(_) => "sum",
            Ir::Min(_) => "min",
            Ir::Max(_) => "max",
            Ir::Average { .. } => "average",
            Ir::First(_) => "first",
            Ir::Last(_) => "last",
            Ir::LastK { .. } => "last_k",
        }
    }
}

fn add_counts(a: i64, b: i64) -> Result<i64> {
    a.checked_add(b)
        .ok_or_else(|| FetchError::aggregation(format!("count overflow adding {} and {}", a, b)))
}

/// Tiled IRs for every aggregation of a GroupBy
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PartialAggregates {
    /// Output feature name → tile start → IR
    pub tiles: HashMap<String, BTreeMap<i64, Ir>>,

    /// Input column → tile start → non-null inputs of windowed aggregations
    #[serde(default)]
    pub inputs: HashMap<String, BTreeMap<i64, Vec<Stamped>>>,
}

impl PartialAggregates {
    /// Folds events at or before `checkpoint_millis` into tiled state
    ///
    /// This is what a batch job writes as a snapshot; it is used by store
    /// writers and by tests.
    pub fn from_events(
        plan: &GroupByPlan,
        events: &[RawEvent],
        checkpoint_millis: i64,
    ) -> Result<Self> {
        let mut state = Self::default();
        for event in events.iter().filter(|e| e.ts_millis <= checkpoint_millis) {
            state.apply_event(plan, event)?;
        }
        Ok(state)
    }

    /// Folds a single event into the matching tile of every aggregation
    pub fn apply_event(&mut self, plan: &GroupByPlan, event: &RawEvent) -> Result<()> {
        let mut recorded: Vec<&str> = Vec::new();
        for agg in &plan.aggregations {
            let Some(value) = event.fields.get(&agg.input_column) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let tile = match agg.window {
                Some(_) => tile_start(event.ts_millis, plan.tile_millis),
                None => ALL_TIME_TILE,
            };
            if agg.window.is_some() && !recorded.contains(&agg.input_column.as_str()) {
                recorded.push(&agg.input_column);
                self.inputs
                    .entry(agg.input_column.clone())
                    .or_default()
                    .entry(tile)
                    .or_default()
                    .push(Stamped {
                        ts_millis: event.ts_millis,
                        value: value.clone(),
                    });
            }
            self.tiles
                .entry(agg.output_name())
                .or_default()
                .entry(tile)
                .or_insert_with(|| Ir::empty(agg.operation))
                .update(event.ts_millis, value)?;
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(FetchError::serialization)
    }

    /// Decodes snapshot state; malformed bytes are an aggregation error
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| {
            FetchError::aggregation(format!("malformed partial-aggregate state: {}", e))
        })
    }

    /// Builds a snapshot of `events` checkpointed at `checkpoint_millis`
    pub fn snapshot(
        plan: &GroupByPlan,
        events: &[RawEvent],
        checkpoint_millis: i64,
    ) -> Result<Snapshot> {
        let state = Self::from_events(plan, events, checkpoint_millis)?;
        Ok(Snapshot {
            checkpoint_millis,
            state: state.encode()?,
        })
    }
}

/// Computes a GroupBy's features as of `at_millis`
///
/// Fails with `StaleRequest` when every retained snapshot postdates
/// `at_millis`, and with `Aggregation` on undecodable or mismatched state.
pub fn compute(plan: &GroupByPlan, raw: &RawStoreValue, at_millis: i64) -> Result<FeatureRow> {
    let (base_checkpoint, base_state) = select_base(raw, at_millis)?;

    let mut row = FeatureRow::new(at_millis);
    for agg in &plan.aggregations {
        let value = compute_one(
            agg,
            plan.tile_millis,
            base_state.as_ref(),
            base_checkpoint,
            &raw.events,
            at_millis,
        )?;
        row.features.insert(agg.output_name(), value);
    }
    Ok(row)
}

fn select_base(raw: &RawStoreValue, at_millis: i64) -> Result<(i64, Option<PartialAggregates>)> {
    if raw.snapshots.is_empty() {
        return Ok((i64::MIN, None));
    }

    let base = raw
        .snapshots
        .iter()
        .filter(|s| s.checkpoint_millis <= at_millis)
        .max_by_key(|s| s.checkpoint_millis);

    match base {
        Some(snapshot) => Ok((
            snapshot.checkpoint_millis,
            Some(PartialAggregates::decode(&snapshot.state)?),
        )),
        None => {
            let earliest_checkpoint = raw
                .snapshots
                .iter()
                .map(|s| s.checkpoint_millis)
                .min()
                .unwrap_or(i64::MIN);
            Err(FetchError::StaleRequest {
                at_millis,
                earliest_checkpoint,
            })
        }
    }
}

fn tile_start(ts_millis: i64, tile_millis: i64) -> i64 {
    ts_millis.div_euclid(tile_millis) * tile_millis
}

fn compute_one(
    agg: &AggregationDef,
    tile_millis: i64,
    base: Option<&PartialAggregates>,
    base_checkpoint: i64,
    events: &[RawEvent],
    at_millis: i64,
) -> Result<FeatureValue> {
    let mut ir = Ir::empty(agg.operation);

    if let Some(state) = base {
        if let Some(tiles) = state.tiles.get(&agg.output_name()) {
            match &agg.window {
                None => {
                    for tile in tiles.values() {
                        ir.merge(tile)?;
                    }
                }
                Some(window) => {
                    let start = window.start(at_millis);
                    for (&first_ts, tile) in tiles {
                        let last_ts = first_ts.saturating_add(tile_millis - 1);
                        if first_ts > start {
                            ir.merge(tile)?;
                        } else if last_ts > start {
                            refold_boundary_tile(&mut ir, state, agg, first_ts, at_millis)?;
                        }
                    }
                }
            }
        }
    }

    for event in events {
        if event.ts_millis <= base_checkpoint || event.ts_millis > at_millis {
            continue;
        }
        if let Some(window) = &agg.window {
            if !window.contains(event.ts_millis, at_millis) {
                continue;
            }
        }
        match event.fields.get(&agg.input_column) {
            Some(value) if !value.is_null() => ir.update(event.ts_millis, value)?,
            _ => {}
        }
    }

    Ok(ir.finalize())
}

/// Folds the in-window inputs of the tile straddling the window start
fn refold_boundary_tile(
    ir: &mut Ir,
    state: &PartialAggregates,
    agg: &AggregationDef,
    tile: i64,
    at_millis: i64,
) -> Result<()> {
    let (Some(window), Some(inputs)) = (
        agg.window.as_ref(),
        state.inputs.get(&agg.input_column).and_then(|tiles| tiles.get(&tile)),
    ) else {
        return Err(FetchError::aggregation(format!(
            "snapshot has no inputs for boundary tile {} of {}",
            tile,
            agg.output_name()
        )));
    };

    for input in inputs {
        if window.contains(input.ts_millis, at_millis) {
            ir.update(input.ts_millis, &input.value)?;
        }
    }
    Ok(())
}
