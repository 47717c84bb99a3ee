use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::TelemetryConfig;
use crate::error::{IngestError, IngestResult};
use crate::store::{ColumnKind, ValueColumn};

use super::{Averages, Reading, TelemetrySource};

/// HTTP client for the on-site averaged-telemetry endpoint.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    window_param: String,
    columns_param: String,
}

impl Client {
    /// Create a new telemetry client.
    pub fn new(cfg: &TelemetryConfig, timeout: Duration) -> IngestResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::fetch("telemetry", e))?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            window_param: cfg.window_param.clone(),
            columns_param: cfg.columns_param.clone(),
        })
    }

    /// Query parameters: window in seconds and the comma-separated columns.
    fn request_params(&self, window: Duration, columns: &[&ValueColumn]) -> [(&str, String); 2] {
        let names: Vec<&str> = columns.iter().map(|c| c.name).collect();
        [
            (self.window_param.as_str(), window.as_secs().to_string()),
            (self.columns_param.as_str(), names.join(",")),
        ]
    }
}

// --- JSON response structures ---

#[derive(Deserialize)]
struct AveragesApiResponse {
    data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    rows_used: u64,
}

impl TelemetrySource for Client {
    async fn fetch_averages(
        &self,
        window: Duration,
        columns: &[&'static ValueColumn],
    ) -> IngestResult<Averages> {
        debug!(window_secs = window.as_secs(), columns = columns.len(), "fetching telemetry averages");

        let response = self
            .http
            .get(&self.endpoint)
            .header("Accept", "application/json")
            .query(&self.request_params(window, columns))
            .send()
            .await
            .map_err(|e| IngestError::fetch("telemetry", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IngestError::fetch("telemetry", e))?;

        if !status.is_success() {
            let preview: String = body.chars().take(200).collect();
            return Err(IngestError::fetch(
                "telemetry",
                anyhow::anyhow!("unexpected status {status}: {preview}"),
            ));
        }

        parse_averages(&body, columns)
    }
}

/// Decodes an averages response, returning one reading per requested column
/// in request order. Entries for columns that were not requested are ignored
/// whatever their type; missing and null entries are absent.
pub fn parse_averages(body: &str, columns: &[&ValueColumn]) -> IngestResult<Averages> {
    let resp: AveragesApiResponse = serde_json::from_str(body)
        .map_err(|e| IngestError::parse("telemetry response", e.to_string()))?;

    let values = columns
        .iter()
        .map(|column| match resp.data.get(column.name) {
            Some(raw) => to_reading(column, raw),
            None => Ok(None),
        })
        .collect::<IngestResult<Vec<_>>>()?;

    Ok(Averages {
        values,
        rows_used: resp.rows_used,
    })
}

fn to_reading(column: &ValueColumn, raw: &serde_json::Value) -> IngestResult<Option<Reading>> {
    use serde_json::Value as Json;

    if raw.is_null() {
        return Ok(None);
    }
    let not_a = |what: &str| {
        IngestError::parse(
            "telemetry response",
            format!("column {} is not {what}: {raw}", column.name),
        )
    };

    let reading = match column.kind {
        ColumnKind::Double => Reading::Number(raw.as_f64().ok_or_else(|| not_a("a number"))?),
        // Averages of integer readings arrive fractional; the column keeps
        // the nearest whole value.
        ColumnKind::Integer => match raw.as_i64() {
            Some(v) => Reading::Integer(v),
            None => {
                let v = raw
                    .as_f64()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| not_a("a number"))?;
                Reading::Integer(v.round() as i64)
            }
        },
        ColumnKind::Json => match raw {
            Json::String(s) if s.is_empty() => return Ok(None),
            Json::Object(map) if map.is_empty() => return Ok(None),
            Json::Array(items) if items.is_empty() => return Ok(None),
            // Some producers ship the payload as encoded JSON text.
            Json::String(s) => serde_json::from_str(s)
                .map(Reading::Structured)
                .unwrap_or_else(|_| Reading::Structured(raw.clone())),
            other => Reading::Structured(other.clone()),
        },
        ColumnKind::Text => Reading::Text(match raw {
            Json::String(s) => s.clone(),
            other => other.to_string(),
        }),
    };
    Ok(Some(reading))
}
