//! Embedded sqlite storage.
//!
//! Single file on disk with WAL journaling. The schema is created by
//! the embedded migration on open. Sample times are stored as 64-bit
//! nanoseconds since the epoch.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};

use super::{ServiceStatus, StorageError, StorageWriter, TlsSample, UptimeSample};

/// Thread-safe embedded store.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database. `path` may name a `.db`/`.db3`
    /// file directly or a directory that will hold `storage.db3`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = Self::resolve_path(path.as_ref());

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| StorageError::Backend(format!("create data dir: {e}")))?;
            }
        }

        tracing::debug!(path = %path.display(), "storage: sqlite3 enabled");

        let conn = Connection::open(&path)?;

        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        conn.execute_batch(include_str!("../../migrations/sqlite/000001_init.up.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn resolve_path(path: &Path) -> PathBuf {
        match path.extension().and_then(|e| e.to_str()) {
            Some("db") | Some("db3") => path.to_path_buf(),
            _ => path.join("storage.db3"),
        }
    }
}

#[async_trait]
impl StorageWriter for SqliteStorage {
    async fn push_uptime(&self, sample: UptimeSample) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO uptime (time, label, status, http_status, elapsed, latency, host, tls_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                sample.time.timestamp_nanos_opt().unwrap_or_default(),
                sample.label,
                sample.status.as_str(),
                sample.http_status,
                sample.elapsed.as_nanos() as i64,
                sample.latency_ms,
                sample.host,
                sample.tls_version,
            ],
        )?;
        Ok(())
    }

    async fn query_uptime_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UptimeSample>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT time, label, status, http_status, elapsed, latency, host, tls_version
             FROM uptime WHERE time >= ?1 AND time <= ?2",
        )?;

        let samples = stmt
            .query_map(
                params![
                    from.timestamp_nanos_opt().unwrap_or_default(),
                    to.timestamp_nanos_opt().unwrap_or_default(),
                ],
                |row| {
                    let time_ns: i64 = row.get(0)?;
                    let status: String = row.get(2)?;
                    let elapsed_ns: i64 = row.get(4)?;
                    Ok(UptimeSample {
                        time: DateTime::from_timestamp_nanos(time_ns),
                        label: row.get(1)?,
                        status: ServiceStatus::parse(&status),
                        http_status: row.get(3)?,
                        elapsed: std::time::Duration::from_nanos(elapsed_ns.max(0) as u64),
                        latency_ms: row.get(5)?,
                        host: row.get(6)?,
                        tls_version: row.get(7)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    async fn push_tls(&self, sample: TlsSample) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tlscert (time, label, security, cert_subject, cert_issuer, cert_expires, cert_fingerprint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sample.time.timestamp_nanos_opt().unwrap_or_default(),
                sample.label,
                sample.security,
                sample.cert_subject,
                sample.cert_issuer,
                sample
                    .cert_expires
                    .map(|t| t.timestamp_nanos_opt().unwrap_or_default()),
                sample.cert_fingerprint,
            ],
        )?;
        Ok(())
    }

    async fn query_tls_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TlsSample>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT time, label, security, cert_subject, cert_issuer, cert_expires, cert_fingerprint
             FROM tlscert WHERE time >= ?1 AND time <= ?2",
        )?;

        let samples = stmt
            .query_map(
                params![
                    from.timestamp_nanos_opt().unwrap_or_default(),
                    to.timestamp_nanos_opt().unwrap_or_default(),
                ],
                |row| {
                    let time_ns: i64 = row.get(0)?;
                    let security: String = row.get(2)?;
                    let expires_ns: Option<i64> = row.get(5)?;
                    Ok(TlsSample {
                        time: DateTime::from_timestamp_nanos(time_ns),
                        label: row.get(1)?,
                        secure: security.to_lowercase().starts_with("tls"),
                        security,
                        cert_subject: row.get(3)?,
                        cert_issuer: row.get(4)?,
                        cert_expires: expires_ns.map(DateTime::from_timestamp_nanos),
                        cert_fingerprint: row.get(6)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    fn kind(&self) -> &'static str {
        "sqlite3"
    }

    fn version(&self) -> &'static str {
        "3"
    }

    async fn close(&self) {}
}
