//! Read API handlers.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{aggregate::aggregate_uptime, AppState};
use crate::duration::parse_duration;
use crate::storage::{ServiceStatus, StorageError, TlsSample, UptimeSample};

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub interval: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UptimeRow {
    time: String,
    label: String,
    status: ServiceStatus,
    http_status: Option<u16>,
    elapsed_ms: i64,
    latency_ms: i64,
    host: Option<String>,
    tls_version: Option<u16>,
}

impl From<UptimeSample> for UptimeRow {
    fn from(sample: UptimeSample) -> Self {
        Self {
            time: sample.time.to_rfc3339(),
            label: sample.label,
            status: sample.status,
            http_status: sample.http_status,
            elapsed_ms: sample.elapsed.as_millis() as i64,
            latency_ms: sample.latency_ms,
            host: sample.host,
            tls_version: sample.tls_version,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TlsRow {
    time: String,
    label: String,
    security: String,
    secure: bool,
    cert_subject: Option<String>,
    cert_issuer: Option<String>,
    cert_expires: Option<String>,
    cert_fingerprint: Option<String>,
}

impl From<TlsSample> for TlsRow {
    fn from(sample: TlsSample) -> Self {
        Self {
            time: sample.time.to_rfc3339(),
            label: sample.label,
            security: sample.security,
            secure: sample.secure,
            cert_subject: sample.cert_subject,
            cert_issuer: sample.cert_issuer,
            cert_expires: sample.cert_expires.map(|t| t.to_rfc3339()),
            cert_fingerprint: sample.cert_fingerprint,
        }
    }
}

/// `GET /uptime?from=&to=&interval=` — defaults to the last six hours;
/// a present `interval` switches on aggregation.
pub async fn handle_uptime(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let (from, to) = match parse_range(&query, chrono::Duration::hours(6)) {
        Ok(range) => range,
        Err(err) => return invalid_input(err),
    };

    let interval = match &query.interval {
        Some(raw) => match parse_duration(raw) {
            Ok(interval) => Some(interval),
            Err(err) => return invalid_input(format!("invalid 'interval' parameter: {err}")),
        },
        None => None,
    };

    let mut samples = match state.storage.query_uptime_range(from, to).await {
        Ok(samples) => samples,
        Err(err) => return storage_failure(err),
    };

    if let Some(interval) = interval {
        if !interval.is_zero() {
            samples = aggregate_uptime(samples, interval);
        }
    }

    let rows: Vec<UptimeRow> = samples.into_iter().map(Into::into).collect();
    Json(rows).into_response()
}

/// `GET /tlscert?from=&to=` — defaults to the last hour, never
/// aggregated.
pub async fn handle_tlscert(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let (from, to) = match parse_range(&query, chrono::Duration::hours(1)) {
        Ok(range) => range,
        Err(err) => return invalid_input(err),
    };

    let samples = match state.storage.query_tls_range(from, to).await {
        Ok(samples) => samples,
        Err(err) => return storage_failure(err),
    };

    let rows: Vec<TlsRow> = samples.into_iter().map(Into::into).collect();
    Json(rows).into_response()
}

fn parse_range(
    query: &RangeQuery,
    default_window: chrono::Duration,
) -> Result<(DateTime<Utc>, DateTime<Utc>), String> {
    let mut from = Utc::now() - default_window;
    let mut to = Utc::now();

    if let Some(raw) = &query.from {
        from = parse_time_param(raw).map_err(|e| format!("invalid 'from' parameter: {e}"))?;
    }

    if let Some(raw) = &query.to {
        to = parse_time_param(raw).map_err(|e| format!("invalid 'to' parameter: {e}"))?;
    }

    Ok((from, to))
}

fn parse_time_param(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc))
}

fn invalid_input(message: String) -> Response {
    (StatusCode::BAD_REQUEST, format!("invalid query input: {message}")).into_response()
}

fn storage_failure(err: StorageError) -> Response {
    tracing::error!(err = %err, "failed to query data for exporter");

    let status = match err {
        StorageError::Unsupported => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    status.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_param() {
        let t = parse_time_param("2025-06-01T12:00:00Z").unwrap();
        assert_eq!(t.to_rfc3339(), "2025-06-01T12:00:00+00:00");

        assert!(parse_time_param("yesterday").is_err());
        assert!(parse_time_param("2025-06-01").is_err());
    }

    #[test]
    fn test_parse_range_defaults() {
        let query = RangeQuery {
            from: None,
            to: None,
            interval: None,
        };
        let (from, to) = parse_range(&query, chrono::Duration::hours(6)).unwrap();
        let span = to - from;
        assert!(span >= chrono::Duration::hours(6) - chrono::Duration::seconds(1));
        assert!(span <= chrono::Duration::hours(6) + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_parse_range_rejects_bad_input() {
        let query = RangeQuery {
            from: Some("not-a-time".to_string()),
            to: None,
            interval: None,
        };
        assert!(parse_range(&query, chrono::Duration::hours(6)).is_err());
    }

    #[test]
    fn test_uptime_row_serialization() {
        let row = UptimeRow::from(UptimeSample {
            time: chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 6, 1, 12, 0, 0).unwrap(),
            label: "web1".to_string(),
            status: ServiceStatus::Up,
            http_status: Some(200),
            elapsed: std::time::Duration::from_millis(123),
            latency_ms: 123,
            host: Some("93.184.216.34".to_string()),
            tls_version: Some(130),
        });

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["time"], "2025-06-01T12:00:00+00:00");
        assert_eq!(json["status"], "up");
        assert_eq!(json["elapsed_ms"], 123);
        assert_eq!(json["host"], "93.184.216.34");
        assert_eq!(json["tls_version"], 130);
    }
}
