//! InfluxDB v1 line-protocol push storage.
//!
//! Write-only: samples are serialized to line protocol and POSTed to
//! the `/write` endpoint. Range queries are not supported.

use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use super::{ServiceStatus, StorageError, StorageWriter, TlsSample, UptimeSample};

pub struct InfluxStorage {
    base_url: Url,
    db_name: String,
    token_auth: Option<String>,
    client: reqwest::Client,
}

impl InfluxStorage {
    pub async fn connect(influx_url: &str) -> Result<Self, StorageError> {
        let parsed = Url::parse(influx_url)
            .map_err(|e| StorageError::ConnectionUrl(e.to_string()))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(StorageError::ConnectionUrl(format!(
                    "unsupported protocol scheme '{other}'"
                )))
            }
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| StorageError::ConnectionUrl("missing url host".to_string()))?;

        let db_name = parsed.path().trim_start_matches('/');
        if db_name.is_empty() {
            return Err(StorageError::ConnectionUrl(
                "database name missing in connection url".to_string(),
            ));
        }
        if db_name.contains('/') {
            return Err(StorageError::ConnectionUrl(
                "a connection url should not contain path elements".to_string(),
            ));
        }

        let mut base_url = Url::parse(&format!("{}://{}", parsed.scheme(), host))
            .map_err(|e| StorageError::ConnectionUrl(e.to_string()))?;
        if let Some(port) = parsed.port() {
            let _ = base_url.set_port(Some(port));
        }

        // Basic auth does not work against the v1 write API, so any
        // password in the url is taken as a token instead.
        let token_auth = parsed.password().map(|p| p.to_string());

        let this = Self {
            base_url,
            db_name: db_name.to_string(),
            token_auth,
            client: reqwest::Client::new(),
        };

        this.ping().await.map_err(|e| {
            StorageError::Backend(format!("unable to connect: {e}"))
        })?;

        Ok(this)
    }

    /// Confirms the connection is usable by listing databases. This is
    /// not a health check of the remote service.
    async fn ping(&self) -> Result<(), StorageError> {
        let mut query_url = self.base_url.clone();
        query_url.set_path("/query");
        query_url.query_pairs_mut().append_pair("q", "SHOW DATABASES");

        let resp = self.fetch(self.client.get(query_url)).await?;
        let status = resp.status().as_u16();
        let _ = resp.bytes().await;

        if status >= 300 {
            return Err(status_error(status));
        }

        Ok(())
    }

    async fn fetch(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StorageError> {
        let req = match &self.token_auth {
            Some(token) => req.header("Authorization", format!("Token {token}")),
            None => req,
        };
        Ok(req.send().await?)
    }

    async fn write_lines(&self, body: String) -> Result<(), StorageError> {
        let mut push_url = self.base_url.clone();
        push_url.set_path("/write");
        push_url.query_pairs_mut().append_pair("db", &self.db_name);

        let resp = self.fetch(self.client.post(push_url).body(body)).await?;
        let status = resp.status().as_u16();

        if status > 300 {
            if let Ok(body) = resp.text().await {
                tracing::debug!(status, body = %body, "influx: request error");
            }
            return Err(status_error(status));
        }

        let _ = resp.bytes().await;
        Ok(())
    }
}

/// Builds line-protocol lines: one measurement per line, all labels
/// attached as tags, integer field values, durations in milliseconds.
struct Liner {
    labels: Vec<(String, String)>,
    body: String,
    timestamp_ns: i64,
}

impl Liner {
    fn new(timestamp_ns: i64) -> Self {
        Self {
            labels: Vec::new(),
            body: String::new(),
            timestamp_ns,
        }
    }

    fn label(&mut self, key: &str, val: &str) {
        self.labels.push((escape(key), escape(val)));
    }

    fn write_int(&mut self, key: &str, value: i64) {
        if !self.body.is_empty() {
            self.body.push('\n');
        }
        let _ = write!(self.body, "{}", escape(key));
        for (k, v) in &self.labels {
            let _ = write!(self.body, ",{k}={v}");
        }
        let _ = write!(self.body, " value={} {}", value, self.timestamp_ns);
    }

    fn write_bool(&mut self, key: &str, value: bool) {
        self.write_int(key, if value { 1 } else { 0 });
    }

    fn finish(self) -> String {
        self.body
    }
}

fn escape(val: &str) -> String {
    url::form_urlencoded::byte_serialize(val.as_bytes()).collect()
}

fn status_error(status: u16) -> StorageError {
    match status {
        400 => StorageError::Backend("protocol error".to_string()),
        401 => StorageError::Backend("unauthorized".to_string()),
        404 => StorageError::Backend("not an influx endpoint".to_string()),
        500 => StorageError::Backend("internal server error".to_string()),
        other => StorageError::UnexpectedStatus(other),
    }
}

fn uptime_lines(sample: &UptimeSample) -> String {
    let mut liner = Liner::new(sample.time.timestamp_nanos_opt().unwrap_or_default());

    liner.label("probe", &sample.label);
    if let Some(host) = &sample.host {
        liner.label("host", host);
    }

    liner.write_int("probe_elapsed", sample.elapsed.as_millis() as i64);
    liner.write_bool("up", sample.status == ServiceStatus::Up);
    liner.write_int("latency", sample.latency_ms.max(0));
    liner.write_int("http_status", sample.http_status.unwrap_or(0) as i64);
    liner.write_int("tls_version", sample.tls_version.unwrap_or(0) as i64);

    liner.finish()
}

fn tls_lines(sample: &TlsSample) -> String {
    let mut liner = Liner::new(sample.time.timestamp_nanos_opt().unwrap_or_default());

    liner.label("probe", &sample.label);
    liner.write_bool("tls_secure", sample.secure);
    liner.write_int(
        "tls_expires",
        sample
            .cert_expires
            .map(|t| t.timestamp_millis())
            .unwrap_or(0),
    );

    liner.finish()
}

#[async_trait]
impl StorageWriter for InfluxStorage {
    async fn push_uptime(&self, sample: UptimeSample) -> Result<(), StorageError> {
        self.write_lines(uptime_lines(&sample)).await
    }

    async fn query_uptime_range(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<UptimeSample>, StorageError> {
        Err(StorageError::Unsupported)
    }

    async fn push_tls(&self, sample: TlsSample) -> Result<(), StorageError> {
        self.write_lines(tls_lines(&sample)).await
    }

    async fn query_tls_range(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<TlsSample>, StorageError> {
        Err(StorageError::Unsupported)
    }

    fn kind(&self) -> &'static str {
        "influx"
    }

    fn version(&self) -> &'static str {
        "v1"
    }

    async fn close(&self) {}
}
