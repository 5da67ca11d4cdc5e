//! Logging sink: the terminal storage fallback.
//!
//! Writes every sample to the process log and stores nothing, so
//! writes never fail and range queries come back empty.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{StorageError, StorageWriter, TlsSample, UptimeSample};

pub struct StdoutStorage;

#[async_trait]
impl StorageWriter for StdoutStorage {
    async fn push_uptime(&self, sample: UptimeSample) -> Result<(), StorageError> {
        tracing::info!(
            label = %sample.label,
            status = %sample.status,
            http_status = sample.http_status,
            elapsed_ms = sample.elapsed.as_millis() as i64,
            latency_ms = sample.latency_ms,
            host = sample.host.as_deref().unwrap_or("<nil>"),
            tls_version = sample.tls_version,
            "stdout uptime",
        );
        Ok(())
    }

    async fn query_uptime_range(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<UptimeSample>, StorageError> {
        Ok(Vec::new())
    }

    async fn push_tls(&self, sample: TlsSample) -> Result<(), StorageError> {
        tracing::info!(
            label = %sample.label,
            security = %sample.security,
            secure = sample.secure,
            issuer = sample.cert_issuer.as_deref().unwrap_or("<nil>"),
            expires = sample.cert_expires.map(|t| t.to_rfc3339()).as_deref().unwrap_or("<nil>"),
            "stdout tlscert",
        );
        Ok(())
    }

    async fn query_tls_range(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<TlsSample>, StorageError> {
        Ok(Vec::new())
    }

    fn kind(&self) -> &'static str {
        "stdout"
    }

    fn version(&self) -> &'static str {
        "x"
    }

    async fn close(&self) {}
}
