//! Prometheus pushgateway storage.
//!
//! Write-only: each sample becomes a small batch of `key value` lines
//! POSTed under a job path that carries the probe labels. Range
//! queries are not supported.

use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use super::{ServiceStatus, StorageError, StorageWriter, TlsSample, UptimeSample};

pub struct PushgatewayStorage {
    host_url: Url,
    client: reqwest::Client,
}

impl PushgatewayStorage {
    pub async fn connect(host_url: &str) -> Result<Self, StorageError> {
        let parsed = Url::parse(host_url)
            .map_err(|e| StorageError::ConnectionUrl(e.to_string()))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(StorageError::ConnectionUrl(format!(
                    "unsupported protocol scheme '{other}'"
                )))
            }
        }

        if parsed.host_str().is_none() {
            return Err(StorageError::ConnectionUrl("missing url host".to_string()));
        }

        let mut host_url = parsed.clone();
        host_url.set_path("");
        host_url.set_query(None);

        let this = Self {
            host_url,
            client: reqwest::Client::new(),
        };

        this.ping().await.map_err(|e| {
            StorageError::Backend(format!("unable to connect: {e}"))
        })?;

        Ok(this)
    }

    /// Confirms the gateway answers its status endpoint.
    async fn ping(&self) -> Result<(), StorageError> {
        let mut ping_url = self.host_url.clone();
        ping_url.set_path("/api/v1/status");

        let resp = self.client.get(ping_url).send().await?;
        let status = resp.status().as_u16();
        let _ = resp.bytes().await;

        if status >= 300 {
            return Err(StorageError::UnexpectedStatus(status));
        }

        Ok(())
    }

    fn push_url(&self, segments: &[(&str, &str)]) -> Result<Url, StorageError> {
        let mut url = self.host_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| StorageError::ConnectionUrl("cannot-be-base url".to_string()))?;
            path.extend(["metrics", "job", "watchpost"]);
            for (key, val) in segments {
                path.push(key);
                path.push(val);
            }
        }
        Ok(url)
    }

    async fn push_body(&self, url: Url, body: String) -> Result<(), StorageError> {
        let resp = self.client.post(url).body(body).send().await?;
        let status = resp.status().as_u16();

        if status > 300 {
            if let Ok(body) = resp.text().await {
                tracing::debug!(status, body = %body, "pushgateway: request error");
            }
            return Err(StorageError::UnexpectedStatus(status));
        }

        let _ = resp.bytes().await;
        Ok(())
    }
}

/// `key value` line body for the gateway's text exposition format.
#[derive(Default)]
struct Liner {
    body: String,
}

impl Liner {
    fn write_int(&mut self, key: &str, val: i64) {
        let _ = writeln!(self.body, "{key} {val}");
    }

    fn write_bool(&mut self, key: &str, val: bool) {
        self.write_int(key, if val { 1 } else { 0 });
    }

    fn finish(self) -> String {
        self.body
    }
}

fn uptime_body(sample: &UptimeSample) -> String {
    let mut liner = Liner::default();

    liner.write_int("probe_elapsed", sample.elapsed.as_millis() as i64);
    liner.write_bool("up", sample.status == ServiceStatus::Up);

    if let Some(status) = sample.http_status {
        liner.write_int("http_status", status as i64);
    }

    if sample.latency_ms >= 0 {
        liner.write_int("latency", sample.latency_ms);
    }

    if let Some(version) = sample.tls_version {
        liner.write_int("tls_version", version as i64);
    }

    liner.finish()
}

fn tls_body(sample: &TlsSample) -> String {
    let mut liner = Liner::default();

    liner.write_bool("tls_secure", sample.secure);

    if let Some(expires) = sample.cert_expires {
        liner.write_int("tls_expires", expires.timestamp_millis());
    }

    liner.finish()
}

#[async_trait]
impl StorageWriter for PushgatewayStorage {
    async fn push_uptime(&self, sample: UptimeSample) -> Result<(), StorageError> {
        let mut segments = vec![("probe", sample.label.as_str()), ("probe_type", "uptime")];
        if let Some(host) = &sample.host {
            segments.push(("host", host.as_str()));
        }

        let url = self.push_url(&segments)?;
        self.push_body(url, uptime_body(&sample)).await
    }

    async fn query_uptime_range(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<UptimeSample>, StorageError> {
        Err(StorageError::Unsupported)
    }

    async fn push_tls(&self, sample: TlsSample) -> Result<(), StorageError> {
        let url = self.push_url(&[("probe", sample.label.as_str()), ("probe_type", "tls")])?;
        self.push_body(url, tls_body(&sample)).await
    }

    async fn query_tls_range(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<TlsSample>, StorageError> {
        Err(StorageError::Unsupported)
    }

    fn kind(&self) -> &'static str {
        "prometheus"
    }

    fn version(&self) -> &'static str {
        "v1"
    }

    async fn close(&self) {}
}
