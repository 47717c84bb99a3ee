pub mod prices;
pub mod telemetry;
pub mod xml;

use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Value;

use crate::error::IngestResult;
use crate::grid::Period;
use crate::store::ValueColumn;

/// One averaged reading, typed after its target column.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Number(f64),
    Integer(i64),
    Structured(serde_json::Value),
    Text(String),
}

impl From<Reading> for Value {
    fn from(reading: Reading) -> Self {
        match reading {
            Reading::Number(v) => Value::from(v),
            Reading::Integer(v) => Value::from(v),
            Reading::Structured(v) => Value::from(v),
            Reading::Text(v) => Value::from(v),
        }
    }
}

/// Averaged telemetry for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct Averages {
    /// One value per requested column, in request order.
    pub values: Vec<Option<Reading>>,
    /// Number of raw rows the source averaged over.
    pub rows_used: u64,
}

impl Averages {
    /// Whether the source averaged any rows into at least one value.
    pub fn has_data(&self) -> bool {
        self.rows_used > 0 && self.values.iter().any(Option::is_some)
    }
}

/// Day-ahead price source.
pub trait PriceSource: Send + Sync {
    /// Fetch all reporting periods overlapping `[start, end)`.
    fn fetch_periods(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl std::future::Future<Output = IngestResult<Vec<Period>>> + Send;
}

/// Averaged on-site telemetry source.
pub trait TelemetrySource: Send + Sync {
    /// Fetch averages over the trailing `window` for the given columns.
    fn fetch_averages(
        &self,
        window: Duration,
        columns: &[&'static ValueColumn],
    ) -> impl std::future::Future<Output = IngestResult<Averages>> + Send;
}
