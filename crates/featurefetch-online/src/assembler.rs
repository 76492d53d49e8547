//! Response assembly
//!
//! Turns per-request results into the response batch: one response per
//! request, in input order. Join results are merged under namespaced
//! feature names (`{namespace}.{feature}`); failed constituents are listed
//! on a partial response rather than failing the whole Join.

use featurefetch_core::{FeatureRow, FetchError, FetchResult, PartFailure, Request, Response, Result};

/// Everything the dispatcher learned about one request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// The request failed before any part could be computed
    Failed(FetchError),

    GroupBy(Result<FeatureRow>),

    /// Per-part results, `(namespace, result)` in plan order
    Join {
        at_millis: i64,
        parts: Vec<(String, Result<FeatureRow>)>,
    },
}

/// Builds the response batch
///
/// Cardinality and order follow `batch`. A missing outcome (a dispatcher
/// bug, not an expected state) becomes a failed response for that request.
pub fn assemble(batch: Vec<Request>, outcomes: Vec<RequestOutcome>) -> Vec<Response> {
    let mut outcomes = outcomes.into_iter();
    batch
        .into_iter()
        .map(|request| {
            let outcome = outcomes.next().unwrap_or_else(|| {
                RequestOutcome::Failed(FetchError::aggregation("no result produced for request"))
            });
            Response {
                request,
                result: to_result(outcome),
            }
        })
        .collect()
}

fn to_result(outcome: RequestOutcome) -> FetchResult {
    match outcome {
        RequestOutcome::Failed(err) => FetchResult::Failed(err),
        RequestOutcome::GroupBy(Ok(row)) => FetchResult::Complete(row),
        RequestOutcome::GroupBy(Err(err)) => FetchResult::Failed(err),
        RequestOutcome::Join { at_millis, parts } => merge_join(at_millis, parts),
    }
}

/// Merges Join parts; any failed part makes the result partial
fn merge_join(at_millis: i64, parts: Vec<(String, Result<FeatureRow>)>) -> FetchResult {
    let mut row = FeatureRow::new(at_millis);
    let mut failed = Vec::new();

    for (namespace, result) in parts {
        match result {
            Ok(part_row) => {
                for (feature, value) in part_row.features {
                    row.features.insert(format!("{}.{}", namespace, feature), value);
                }
            }
            Err(error) => failed.push(PartFailure {
                part: namespace,
                error,
            }),
        }
    }

    if failed.is_empty() {
        FetchResult::Complete(row)
    } else {
        FetchResult::Partial { row, failed }
    }
}
