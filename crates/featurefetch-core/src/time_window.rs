//! Trailing time windows for aggregations
//!
//! A window is always evaluated relative to the request's as-of timestamp,
//! never relative to wall-clock now. A window of length `L` requested at `T`
//! covers the half-open interval `(T - L, T]`.
//!
//! ## Example
//!
//! ```rust
//! use featurefetch_core::time_window::Window;
//!
//! let week = Window::days(7);
//! assert_eq!(week.name(), "7d");
//! assert!(week.contains(1_000_000_000 - 86_400_000, 1_000_000_000));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Trailing window of fixed length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub length_millis: i64,
}

impl Window {
    pub fn from_millis(length_millis: i64) -> Self {
        Self { length_millis }
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self::from_millis(duration.as_millis() as i64)
    }

    pub fn minutes(n: i64) -> Self {
        Self::from_millis(n * MINUTE_MS)
    }

    pub fn hours(n: i64) -> Self {
        Self::from_millis(n * HOUR_MS)
    }

    pub fn days(n: i64) -> Self {
        Self::from_millis(n * DAY_MS)
    }

    /// Human-readable name (e.g., "7d", "6h", "30m"); whole days win over hours
    pub fn name(&self) -> String {
        let ms = self.length_millis;
        if ms >= DAY_MS && ms % DAY_MS == 0 {
            format!("{}d", ms / DAY_MS)
        } else if ms >= HOUR_MS && ms % HOUR_MS == 0 {
            format!("{}h", ms / HOUR_MS)
        } else if ms >= MINUTE_MS && ms % MINUTE_MS == 0 {
            format!("{}m", ms / MINUTE_MS)
        } else if ms % 1000 == 0 {
            format!("{}s", ms / 1000)
        } else {
            format!("{}ms", ms)
        }
    }

    /// Exclusive lower bound of the window as of `at_millis`
    pub fn start(&self, at_millis: i64) -> i64 {
        at_millis.saturating_sub(self.length_millis)
    }

    /// Whether an event at `ts_millis` falls inside the window as of `at_millis`
    pub fn contains(&self, ts_millis: i64, at_millis: i64) -> bool {
        ts_millis > self.start(at_millis) && ts_millis <= at_millis
    }
}
