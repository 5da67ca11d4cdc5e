//! Storage writers for probe samples.
//!
//! Every backend satisfies the same capability set: append uptime and
//! TLS samples, answer range queries, and report its identity for log
//! output. Backend selection happens once at startup from environment
//! variables.

mod influx;
mod pushgateway;
mod sqlite;
mod stdout;
mod timescale;

pub use influx::InfluxStorage;
pub use pushgateway::PushgatewayStorage;
pub use sqlite::SqliteStorage;
pub use stdout::StdoutStorage;
pub use timescale::TimescaleStorage;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid connection url: {0}")]
    ConnectionUrl(String),
    #[error("{0}")]
    Backend(String),
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),
    #[error("range queries are not supported by this backend")]
    Unsupported,
}

/// Up/down verdict of a single uptime measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Up,
    Down,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Up => "up",
            ServiceStatus::Down => "down",
        }
    }

    /// Anything that is not literally "up" reads as down.
    pub fn parse(token: &str) -> Self {
        match token {
            "up" => ServiceStatus::Up,
            _ => ServiceStatus::Down,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One uptime measurement.
///
/// `latency_ms` is signed: -1 means the target was down or the latency
/// was not measured. `host` carries the IP the probed hostname
/// resolved to at sample time, when known. `tls_version` is the
/// negotiated protocol of a TLS-wrapped response as a numeric code
/// (300/100/110/120/130).
#[derive(Debug, Clone)]
pub struct UptimeSample {
    pub time: DateTime<Utc>,
    pub label: String,
    pub status: ServiceStatus,
    pub http_status: Option<u16>,
    pub elapsed: Duration,
    pub latency_ms: i64,
    pub host: Option<String>,
    pub tls_version: Option<u16>,
}

/// One TLS certificate inspection result.
#[derive(Debug, Clone)]
pub struct TlsSample {
    pub time: DateTime<Utc>,
    pub label: String,
    pub security: String,
    pub secure: bool,
    pub cert_subject: Option<String>,
    pub cert_issuer: Option<String>,
    pub cert_expires: Option<DateTime<Utc>>,
    pub cert_fingerprint: Option<String>,
}

/// Capability set every storage backend satisfies.
///
/// Writers are shared between all probes and the read API and must be
/// safe under concurrent callers. Write failures surface to the
/// caller; there is no retry inside the writer.
#[async_trait]
pub trait StorageWriter: Send + Sync {
    async fn push_uptime(&self, sample: UptimeSample) -> Result<(), StorageError>;

    /// All uptime samples with `from <= time <= to`, in no guaranteed
    /// order.
    async fn query_uptime_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UptimeSample>, StorageError>;

    async fn push_tls(&self, sample: TlsSample) -> Result<(), StorageError>;

    async fn query_tls_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TlsSample>, StorageError>;

    fn kind(&self) -> &'static str;

    fn version(&self) -> &'static str;

    async fn close(&self);
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Select a storage backend from the environment. First match wins:
/// `TIMESCALE_URL`, `PUSHGATEWAY_URL`, `INFLUXDB_URL`, `SQLITE_PATH`,
/// then the stdout sink.
pub async fn from_env() -> Result<Arc<dyn StorageWriter>, StorageError> {
    if let Some(url) = env_nonempty("TIMESCALE_URL") {
        tracing::info!("$TIMESCALE_URL is provided, using timescale storage");
        return Ok(Arc::new(TimescaleStorage::connect(&url).await?));
    }

    if let Some(url) = env_nonempty("PUSHGATEWAY_URL") {
        tracing::info!("$PUSHGATEWAY_URL is provided, using prometheus push gateway storage");
        return Ok(Arc::new(PushgatewayStorage::connect(&url).await?));
    }

    if let Some(url) = env_nonempty("INFLUXDB_URL") {
        tracing::info!("$INFLUXDB_URL is provided, using influxdb storage");
        return Ok(Arc::new(InfluxStorage::connect(&url).await?));
    }

    if let Some(path) = env_nonempty("SQLITE_PATH") {
        tracing::info!(path = %path, "$SQLITE_PATH is provided, using sqlite storage");
        return Ok(Arc::new(SqliteStorage::open(&path)?));
    }

    Ok(Arc::new(StdoutStorage))
}

#[cfg(test)]
pub(crate) mod mem {
    //! In-memory writer used by probe and scheduler tests.

    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemStorage {
        pub uptime: Mutex<Vec<UptimeSample>>,
        pub tls: Mutex<Vec<TlsSample>>,
    }

    #[async_trait]
    impl StorageWriter for MemStorage {
        async fn push_uptime(&self, sample: UptimeSample) -> Result<(), StorageError> {
            self.uptime.lock().unwrap().push(sample);
            Ok(())
        }

        async fn query_uptime_range(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<UptimeSample>, StorageError> {
            Ok(self
                .uptime
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.time >= from && s.time <= to)
                .cloned()
                .collect())
        }

        async fn push_tls(&self, sample: TlsSample) -> Result<(), StorageError> {
            self.tls.lock().unwrap().push(sample);
            Ok(())
        }

        async fn query_tls_range(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<TlsSample>, StorageError> {
            Ok(self
                .tls
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.time >= from && s.time <= to)
                .cloned()
                .collect())
        }

        fn kind(&self) -> &'static str {
            "mem"
        }

        fn version(&self) -> &'static str {
            "x"
        }

        async fn close(&self) {}
    }
}
