//! Remote timescale/postgres storage.
//!
//! Opens a pooled connection and runs the embedded migration on first
//! open. Sample times are stored as `timestamptz`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{ServiceStatus, StorageError, StorageWriter, TlsSample, UptimeSample};

pub struct TimescaleStorage {
    pool: PgPool,
}

impl TimescaleStorage {
    pub async fn connect(db_url: &str) -> Result<Self, StorageError> {
        let conn_url = url::Url::parse(db_url)
            .map_err(|e| StorageError::ConnectionUrl(e.to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect(db_url)
            .await?;

        tracing::debug!(
            host = conn_url.host_str().unwrap_or_default(),
            name = conn_url.path().trim_start_matches('/'),
            "storage: timescale enabled",
        );

        sqlx::raw_sql(include_str!("../../migrations/timescale/000001_init.up.sql"))
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StorageWriter for TimescaleStorage {
    async fn push_uptime(&self, sample: UptimeSample) -> Result<(), StorageError> {
        sqlx::query(
            "insert into uptime (time, label, status, http_status, elapsed_ms, latency, host, tls_version)
             values ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(sample.time)
        .bind(&sample.label)
        .bind(sample.status.as_str())
        .bind(sample.http_status.map(|s| s as i16))
        .bind(sample.elapsed.as_millis() as i64)
        .bind(sample.latency_ms as i32)
        .bind(&sample.host)
        .bind(sample.tls_version.map(|v| v as i16))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_uptime_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UptimeSample>, StorageError> {
        let rows = sqlx::query(
            "select time, label, status, http_status, elapsed_ms, latency, host, tls_version
             from uptime where time >= $1 and time <= $2",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let http_status: Option<i16> = row.try_get("http_status")?;
            let elapsed_ms: i64 = row.try_get("elapsed_ms")?;
            let latency: i32 = row.try_get("latency")?;
            let tls_version: Option<i16> = row.try_get("tls_version")?;
            samples.push(UptimeSample {
                time: row.try_get("time")?,
                label: row.try_get("label")?,
                status: ServiceStatus::parse(&status),
                http_status: http_status.map(|s| s as u16),
                elapsed: Duration::from_millis(elapsed_ms.max(0) as u64),
                latency_ms: latency as i64,
                host: row.try_get("host")?,
                tls_version: tls_version.map(|v| v as u16),
            });
        }

        Ok(samples)
    }

    async fn push_tls(&self, sample: TlsSample) -> Result<(), StorageError> {
        sqlx::query(
            "insert into tlscert (time, label, security, cert_subject, cert_issuer, cert_expires, cert_fingerprint)
             values ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(sample.time)
        .bind(&sample.label)
        .bind(&sample.security)
        .bind(&sample.cert_subject)
        .bind(&sample.cert_issuer)
        .bind(sample.cert_expires)
        .bind(&sample.cert_fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_tls_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TlsSample>, StorageError> {
        let rows = sqlx::query(
            "select time, label, security, cert_subject, cert_issuer, cert_expires, cert_fingerprint
             from tlscert where time >= $1 and time <= $2",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            let security: String = row.try_get("security")?;
            samples.push(TlsSample {
                time: row.try_get("time")?,
                label: row.try_get("label")?,
                secure: security.to_lowercase().starts_with("tls"),
                security,
                cert_subject: row.try_get("cert_subject")?,
                cert_issuer: row.try_get("cert_issuer")?,
                cert_expires: row.try_get("cert_expires")?,
                cert_fingerprint: row.try_get("cert_fingerprint")?,
            });
        }

        Ok(samples)
    }

    fn kind(&self) -> &'static str {
        "timescale"
    }

    fn version(&self) -> &'static str {
        "pg"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
