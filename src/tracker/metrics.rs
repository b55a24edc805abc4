//! Metrics aggregation over a run's task and phase records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregated per-run metrics, computed on demand from tracker state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub tasks_total: u64,
    /// Task counts keyed by state name.
    pub tasks_by_state: BTreeMap<String, u64>,
    /// Phase counts keyed by state name.
    pub phases_by_state: BTreeMap<String, u64>,
    /// Completed tasks over terminal tasks; 1.0 when nothing terminal yet.
    pub success_rate: f64,
    pub retries_total: u64,
    pub errors_total: u64,
    pub dead_letter_total: u64,
    /// Task duration percentiles in milliseconds, over terminal tasks.
    pub duration_ms_p50: u64,
    pub duration_ms_p90: u64,
    pub duration_ms_p99: u64,
    /// Message bus counter snapshot, attached at collection time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<crate::bus::BusCountersSnapshot>,
}

/// Nearest-rank percentile over an ascending-sorted slice.
///
/// Returns 0 for an empty slice. `pct` is in (0, 100].
pub fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
