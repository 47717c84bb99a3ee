//! Expansion of sparse, irregularly-resolved source periods onto the
//! canonical fixed-step time grid.
//!
//! The grid is half-open: `[window_start, window_end)` produces exactly
//! `(window_end - window_start) / step` rows. Keys are never missing; only
//! values are, and a value is missing only before the first observation
//! (later gaps are forward-filled).

pub mod resolution;

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::error::{IngestError, IngestResult};

pub use resolution::Resolution;

/// Canonical grid step in minutes.
pub const GRID_STEP_MINUTES: i64 = 15;

/// Returns the canonical grid step.
pub fn grid_step() -> Duration {
    Duration::minutes(GRID_STEP_MINUTES)
}

/// A point inside a source period. `position` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub position: u32,
    pub value: Option<f64>,
}

/// One source reporting window.
#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub resolution: Resolution,
    pub points: Vec<Point>,
}

impl Period {
    /// Absolute timestamp of a 1-based position within this period.
    pub fn timestamp_at(&self, position: u32) -> IngestResult<DateTime<Utc>> {
        if position == 0 {
            return Err(IngestError::parse("period", "point position must be >= 1"));
        }
        let offset = self.resolution.duration() * (position as i32 - 1);
        Ok(self.start + offset)
    }
}

/// Observed values keyed by absolute timestamp.
pub type SparseSeries = BTreeMap<DateTime<Utc>, f64>;

/// One row of the dense output grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridRow {
    pub ts: DateTime<Utc>,
    pub value: Option<f64>,
}

/// Whether `ts` sits exactly on the canonical grid.
pub fn is_grid_aligned(ts: DateTime<Utc>) -> bool {
    i64::from(ts.minute()) % GRID_STEP_MINUTES == 0 && ts.second() == 0 && ts.nanosecond() == 0
}

/// Floors `ts` to the grid step containing it.
pub fn floor_to_grid(ts: DateTime<Utc>) -> DateTime<Utc> {
    let step_secs = GRID_STEP_MINUTES * 60;
    let secs = ts.timestamp().div_euclid(step_secs) * step_secs;
    DateTime::from_timestamp(secs, 0).unwrap_or(ts)
}

/// Flattens periods into a sparse series. Absent values are skipped; a later
/// period overwrites an earlier one on the same timestamp.
pub fn flatten_periods(periods: &[Period]) -> IngestResult<SparseSeries> {
    let mut series = SparseSeries::new();
    for period in periods {
        for point in &period.points {
            let Some(value) = point.value else {
                continue;
            };
            series.insert(period.timestamp_at(point.position)?, value);
        }
    }
    Ok(series)
}

/// Produces the dense grid for `[window_start, window_end)` from one fetch's
/// periods.
///
/// Fails with `NoDataAvailable` when no period carries a single value, so a
/// partial grid is never handed to the store.
pub fn expand(
    what: &'static str,
    periods: &[Period],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> IngestResult<Vec<GridRow>> {
    let steps = grid_steps(window_start, window_end)?;
    let series = flatten_periods(periods)?;
    if series.is_empty() {
        return Err(IngestError::NoDataAvailable { what });
    }
    Ok(forward_fill(&series, window_start, steps))
}

/// Number of grid steps in the window, validating alignment and length.
fn grid_steps(window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> IngestResult<i64> {
    if !is_grid_aligned(window_start) {
        return Err(IngestError::parse(
            "grid window",
            format!("window start {window_start} is not aligned to the grid"),
        ));
    }
    if window_end <= window_start {
        return Err(IngestError::parse(
            "grid window",
            format!("window end {window_end} must be after start {window_start}"),
        ));
    }
    let span = (window_end - window_start).num_seconds();
    let step = grid_step().num_seconds();
    if span % step != 0 {
        return Err(IngestError::parse(
            "grid window",
            format!("window length {span}s is not a multiple of the {step}s grid step"),
        ));
    }
    Ok(span / step)
}

/// Walks the grid with an explicit carried value.
fn forward_fill(series: &SparseSeries, window_start: DateTime<Utc>, steps: i64) -> Vec<GridRow> {
    let step = grid_step();
    let (rows, _carry) = (0..steps).fold(
        (Vec::with_capacity(steps as usize), None::<f64>),
        |(mut rows, carry), i| {
            let ts = window_start + step * (i as i32);
            let value = series.get(&ts).copied().or(carry);
            rows.push(GridRow { ts, value });
            (rows, value)
        },
    );
    rows
}
