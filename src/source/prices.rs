use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

use crate::config::PricesConfig;
use crate::error::{IngestError, IngestResult};
use crate::grid::{Period, Point, Resolution};

use super::xml::{descendants_named, text_at};
use super::PriceSource;

/// Packed UTC timestamp format used by the transparency API.
const PACKED_FORMAT: &str = "%Y%m%d%H%M";

/// HTTP client for day-ahead price documents.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    security_token: String,
    in_domain: String,
    out_domain: String,
    document_type: String,
    market_agreement_type: String,
}

impl Client {
    /// Create a new price client.
    pub fn new(cfg: &PricesConfig, timeout: Duration) -> IngestResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::fetch("prices", e))?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            security_token: cfg.security_token.clone(),
            in_domain: cfg.domain.clone(),
            out_domain: cfg.out_domain().to_string(),
            document_type: cfg.document_type.clone(),
            market_agreement_type: cfg.market_agreement_type.clone(),
        })
    }

    /// Query parameters for the window `[start, end)`.
    fn request_params(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(&'static str, String)> {
        vec![
            ("securityToken", self.security_token.clone()),
            ("documentType", self.document_type.clone()),
            ("in_Domain", self.in_domain.clone()),
            ("out_Domain", self.out_domain.clone()),
            (
                "contract_MarketAgreement.type",
                self.market_agreement_type.clone(),
            ),
            ("periodStart", pack_timestamp(start)),
            ("periodEnd", pack_timestamp(end)),
        ]
    }
}

impl PriceSource for Client {
    async fn fetch_periods(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> IngestResult<Vec<Period>> {
        debug!(
            %start,
            %end,
            in_domain = %self.in_domain,
            out_domain = %self.out_domain,
            "fetching day-ahead prices"
        );

        let response = self
            .http
            .get(&self.endpoint)
            .query(&self.request_params(start, end))
            .send()
            .await
            .map_err(|e| IngestError::fetch("prices", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IngestError::fetch("prices", e))?;

        if !status.is_success() {
            let preview: String = body.chars().take(200).collect();
            return Err(IngestError::fetch(
                "prices",
                anyhow::anyhow!("unexpected status {status}: {preview}"),
            ));
        }

        let periods = parse_price_document(&body)?;
        debug!(periods = periods.len(), "parsed price document");
        Ok(periods)
    }
}

/// Formats a timestamp as `YYYYMMDDHHMM` in UTC.
pub fn pack_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(PACKED_FORMAT).to_string()
}

/// Extracts all periods from a market document.
///
/// A document without any `TimeSeries` (e.g. an acknowledgement reporting
/// that no data matched) yields no periods; the caller decides whether that
/// is fatal.
pub fn parse_price_document(xml: &str) -> IngestResult<Vec<Period>> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| IngestError::parse("price document", e.to_string()))?;

    let mut periods = Vec::new();
    for series in descendants_named(doc.root_element(), "TimeSeries") {
        for period in descendants_named(series, "Period") {
            // Incomplete periods and points are skipped; malformed ones fail.
            let (Some(start_text), Some(resolution_text)) = (
                text_at(period, &["timeInterval", "start"]),
                text_at(period, &["resolution"]),
            ) else {
                warn!("skipping period without timeInterval/start or resolution");
                continue;
            };
            let start = parse_interval_start(start_text)?;
            let resolution = Resolution::decode(resolution_text)?;

            let mut points = Vec::new();
            for point in descendants_named(period, "Point") {
                let Some(position_text) = text_at(point, &["position"]) else {
                    debug!(%start, "skipping point without position");
                    continue;
                };
                let position: u32 = position_text.parse().map_err(|_| {
                    IngestError::parse(
                        "price document",
                        format!("invalid point position {position_text:?}"),
                    )
                })?;

                let value = match text_at(point, &["price.amount"]) {
                    Some(text) => Some(text.parse::<f64>().map_err(|_| {
                        IngestError::parse("price document", format!("invalid price {text:?}"))
                    })?),
                    None => None,
                };

                points.push(Point { position, value });
            }

            periods.push(Period {
                start,
                resolution,
                points,
            });
        }
    }

    Ok(periods)
}

/// Parses interval boundaries, which are published both with and without
/// seconds (`2024-06-01T22:00Z`).
fn parse_interval_start(text: &str) -> IngestResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%MZ")
        .map(|naive| naive.and_utc())
        .map_err(|_| IngestError::parse("price document", format!("invalid interval start {text:?}")))
}
