//! HTTP reachability probe.
//!
//! Issues one request per execution (plus retries within the same
//! timeout budget) and records an up/down sample. TLS certificate
//! verification is intentionally disabled: this probe measures
//! reachability, the TLS probe is the one that inspects certificates.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::tls::{insecure_client_config, tls_version_code};
use super::{resolve_host, Probe, ProbeError, ProbeKind, ProbeTimer, USER_AGENT};
use crate::config::{self, ConfigError, HttpMethod, HttpProbeConfig};
use crate::proxy::ProxyRegistry;
use crate::storage::{ServiceStatus, StorageWriter, UptimeSample};

/// Sentinel status for connection-level failures. Sits above the real
/// HTTP status range; the value is borrowed from the websocket close
/// codes (1012 / Service Restart).
pub const STATUS_CONNECT_FAILED: u16 = 1012;

/// Sentinel status for failures to reach the attached SOCKS proxy.
pub const STATUS_PROXY_FAILED: u16 = 1014;

pub struct HttpProbe {
    label: String,
    timer: ProbeTimer,
    timeout: Duration,
    retries: u32,
    method: reqwest::Method,
    url: reqwest::Url,
    headers: HeaderMap,
    host: String,
    client: reqwest::Client,
    /// Raw protocol version of the client's last TLS handshake, fed by
    /// the verifier; 0 until a handshake happens.
    negotiated: Arc<AtomicU16>,
}

enum Outcome {
    Response { status: u16 },
    ConnectFailed { code: u16 },
    Cancelled,
}

enum AttemptError {
    Proxy,
    Retryable,
}

impl HttpProbe {
    /// Build the probe from config. The target host must resolve at
    /// load time; an attached proxy must exist in the registry.
    pub async fn load(
        label: String,
        cfg: &HttpProbeConfig,
        proxies: &ProxyRegistry,
    ) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidProbe {
            label: label.clone(),
            reason,
        };

        let url = reqwest::Url::parse(&config::ensure_scheme(&cfg.url))
            .map_err(|e| invalid(format!("invalid http url '{}': {e}", cfg.url)))?;

        let host = url
            .host_str()
            .ok_or_else(|| invalid(format!("invalid http url '{}': host required", cfg.url)))?
            .to_string();

        resolve_host(&host)
            .await
            .map_err(|e| invalid(e.to_string()))?;

        let method = HttpMethod::parse(cfg.method.as_deref().unwrap_or("")).map_err(invalid)?;
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| invalid(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (key, val) in &cfg.headers {
            if key.eq_ignore_ascii_case("host") {
                tracing::info!(label = %label, to = %val, "overriding request host header");
            }
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| invalid(format!("invalid header '{key}': {e}")))?;
            let value = HeaderValue::from_str(val)
                .map_err(|e| invalid(format!("invalid header '{key}': {e}")))?;
            headers.insert(name, value);
        }

        // Certificate verification stays off in this config; the
        // verifier also reports the negotiated protocol version back
        // through `negotiated`.
        let negotiated = Arc::new(AtomicU16::new(0));
        let mut tls_config = insecure_client_config(Some(negotiated.clone()))
            .map_err(|e| invalid(format!("tls config: {e}")))?;
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .use_preconfigured_tls(tls_config);

        if let Some(proxy) = &cfg.proxy_url {
            builder = builder.proxy(proxies.get(proxy).map_err(|e| invalid(e.to_string()))?);
        }

        let client = builder
            .build()
            .map_err(|e| invalid(format!("failed to build http client: {e}")))?;

        Ok(Self {
            label,
            timer: ProbeTimer::new(config::effective_interval(cfg.interval)),
            timeout: config::effective_timeout(cfg.timeout),
            retries: cfg.retries,
            method,
            url,
            headers,
            host,
            client,
            negotiated,
        })
    }

    /// Numeric code of the client's negotiated TLS version, if any
    /// handshake has happened.
    fn negotiated_version(&self) -> Option<u16> {
        match self.negotiated.load(Ordering::Relaxed) {
            0 => None,
            raw => Some(tls_version_code(raw)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.timer.interval()
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        storage: &Arc<dyn StorageWriter>,
    ) -> Result<(), ProbeError> {
        let started = Utc::now();
        let begun = Instant::now();
        let deadline = begun + self.timeout;

        let outcome = self.fetch(ctx, deadline).await;
        let elapsed = begun.elapsed();

        let (status, http_status, latency_ms, tls_version) = match outcome {
            // Shutdown mid-flight: exit without a partial sample.
            Outcome::Cancelled => return Ok(()),
            Outcome::Response { status } if is_ok_status(status) => (
                ServiceStatus::Up,
                Some(status),
                elapsed.as_millis() as i64,
                self.negotiated_version(),
            ),
            Outcome::Response { status } => (
                ServiceStatus::Down,
                Some(status),
                -1,
                self.negotiated_version(),
            ),
            Outcome::ConnectFailed { code } => (ServiceStatus::Down, Some(code), -1, None),
        };

        let host = resolve_host(&self.host).await.ok().map(|ip| ip.to_string());

        tracing::debug!(
            label = %self.label,
            status = %status,
            http_status,
            tls_version,
            elapsed_ms = elapsed.as_millis() as i64,
            "upd http",
        );

        storage
            .push_uptime(UptimeSample {
                time: started,
                label: self.label.clone(),
                status,
                http_status,
                elapsed,
                latency_ms,
                host,
                tls_version,
            })
            .await?;

        Ok(())
    }

    async fn fetch(&self, ctx: &CancellationToken, deadline: Instant) -> Outcome {
        let mut retries_left = self.retries;

        loop {
            let result = tokio::select! {
                _ = ctx.cancelled() => return Outcome::Cancelled,
                res = self.attempt(deadline) => res,
            };

            match result {
                Ok(status) => return Outcome::Response { status },
                Err(AttemptError::Proxy) => {
                    return Outcome::ConnectFailed {
                        code: STATUS_PROXY_FAILED,
                    }
                }
                Err(AttemptError::Retryable) => {
                    if retries_left == 0 || Instant::now() >= deadline || ctx.is_cancelled() {
                        return Outcome::ConnectFailed {
                            code: STATUS_CONNECT_FAILED,
                        };
                    }
                    retries_left -= 1;
                }
            }
        }
    }

    async fn attempt(&self, deadline: Instant) -> Result<u16, AttemptError> {
        let request = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());

        let roundtrip = async {
            let resp = request.send().await?;
            let status = resp.status().as_u16();
            // Read and discard the body so the connection can be reused.
            let _ = resp.bytes().await;
            Ok::<u16, reqwest::Error>(status)
        };

        match tokio::time::timeout_at(deadline, roundtrip).await {
            Err(_) => Err(AttemptError::Retryable),
            Ok(Ok(status)) => Ok(status),
            Ok(Err(err)) if is_proxy_error(&err) => Err(AttemptError::Proxy),
            Ok(Err(_)) => Err(AttemptError::Retryable),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn ready(&self) -> bool {
        self.timer.ready()
    }

    async fn execute(
        &self,
        ctx: &CancellationToken,
        storage: &Arc<dyn StorageWriter>,
    ) -> Result<(), ProbeError> {
        self.timer.acquire()?;
        let result = self.run(ctx, storage).await;
        self.timer.release();
        result
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> ProbeKind {
        ProbeKind::Http
    }
}

/// Up requires a status in [200, 226].
fn is_ok_status(status: u16) -> bool {
    (200..=226).contains(&status)
}

/// A connect failure whose error chain reads `socks connect ...` means
/// the proxy itself was unreachable.
fn is_proxy_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(err) = current {
        if err.to_string().starts_with("socks connect") {
            return true;
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mem::MemStorage;

    fn probe_config(url: &str) -> HttpProbeConfig {
        HttpProbeConfig {
            interval: Some(Duration::from_secs(1)),
            timeout: Some(Duration::from_secs(2)),
            url: url.to_string(),
            method: None,
            headers: Default::default(),
            proxy_url: None,
            retries: 0,
        }
    }

    async fn stub_server(status: u16) -> std::net::SocketAddr {
        use axum::http::StatusCode;
        use axum::routing::any;

        let app = axum::Router::new().route(
            "/",
            any(move || async move {
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn test_ok_status_boundaries() {
        assert!(is_ok_status(200));
        assert!(is_ok_status(226));
        assert!(!is_ok_status(199));
        assert!(!is_ok_status(227));
        assert!(!is_ok_status(404));
    }

    #[test]
    fn test_proxy_error_classification() {
        let proxy = std::io::Error::new(
            std::io::ErrorKind::Other,
            "socks connect tcp 127.0.0.1:1080: connection refused",
        );
        assert!(is_proxy_error(&proxy));

        let plain = std::io::Error::new(std::io::ErrorKind::Other, "connection refused");
        assert!(!is_proxy_error(&plain));
    }

    #[tokio::test]
    async fn test_load_defaults_to_head() {
        let addr = stub_server(200).await;
        let probe = HttpProbe::load(
            "web1".to_string(),
            &probe_config(&format!("http://{addr}/")),
            &ProxyRegistry::default(),
        )
        .await
        .unwrap();
        assert_eq!(probe.method, reqwest::Method::HEAD);
    }

    #[tokio::test]
    async fn test_load_fails_on_unresolvable_host() {
        let result = HttpProbe::load(
            "bad".to_string(),
            &probe_config("http://no-such-host.invalid/"),
            &ProxyRegistry::default(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_happy_path_records_up_sample() {
        let addr = stub_server(200).await;
        let probe = HttpProbe::load(
            "web1".to_string(),
            &probe_config(&format!("http://{addr}/")),
            &ProxyRegistry::default(),
        )
        .await
        .unwrap();

        let storage: Arc<dyn StorageWriter> = Arc::new(MemStorage::default());
        let ctx = CancellationToken::new();
        probe.execute(&ctx, &storage).await.unwrap();

        let samples = storage
            .query_uptime_range(Utc::now() - chrono::Duration::minutes(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].status, ServiceStatus::Up);
        assert_eq!(samples[0].http_status, Some(200));
        assert!(samples[0].latency_ms >= 0);
        assert!(samples[0].elapsed <= Duration::from_secs(2));
        assert_eq!(samples[0].host.as_deref(), Some("127.0.0.1"));
        assert_eq!(samples[0].tls_version, None);
    }

    /// Minimal HTTP/1.1 responder behind a TLS listener, for checking
    /// the negotiated-version capture.
    async fn stub_https_server() -> u16 {
        use rustls::pki_types::PrivateKeyDer;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server_config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![cert.der().clone()],
                PrivateKeyDer::Pkcs8(key.serialize_der().into()),
            )
            .unwrap();

        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(stream).await else {
                        return;
                    };

                    let mut request = Vec::new();
                    let mut buf = [0u8; 2048];
                    loop {
                        match tls.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                request.extend_from_slice(&buf[..n]);
                                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                        }
                    }

                    let _ = tls
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 0\r\n\r\n",
                        )
                        .await;
                    let _ = tls.shutdown().await;
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn test_https_records_negotiated_tls_version() {
        let port = stub_https_server().await;
        let probe = HttpProbe::load(
            "web1".to_string(),
            &probe_config(&format!("https://localhost:{port}/")),
            &ProxyRegistry::default(),
        )
        .await
        .unwrap();

        let storage: Arc<dyn StorageWriter> = Arc::new(MemStorage::default());
        probe
            .execute(&CancellationToken::new(), &storage)
            .await
            .unwrap();

        let samples = storage
            .query_uptime_range(Utc::now() - chrono::Duration::minutes(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].status, ServiceStatus::Up);
        assert_eq!(samples[0].http_status, Some(200));
        // rustls on both ends negotiates TLS 1.3, code 130.
        assert_eq!(samples[0].tls_version, Some(130));
    }

    #[tokio::test]
    async fn test_error_status_recorded_as_down() {
        let addr = stub_server(404).await;
        let probe = HttpProbe::load(
            "web1".to_string(),
            &probe_config(&format!("http://{addr}/")),
            &ProxyRegistry::default(),
        )
        .await
        .unwrap();

        let storage: Arc<dyn StorageWriter> = Arc::new(MemStorage::default());
        probe
            .execute(&CancellationToken::new(), &storage)
            .await
            .unwrap();

        let samples = storage
            .query_uptime_range(Utc::now() - chrono::Duration::minutes(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(samples[0].status, ServiceStatus::Down);
        assert_eq!(samples[0].http_status, Some(404));
        assert_eq!(samples[0].latency_ms, -1);
    }

    #[tokio::test]
    async fn test_connect_failure_records_sentinel() {
        // Bind then drop a listener so the port is closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut cfg = probe_config(&format!("http://{addr}/"));
        cfg.retries = 2;

        let probe = HttpProbe::load("web1".to_string(), &cfg, &ProxyRegistry::default())
            .await
            .unwrap();

        let storage: Arc<dyn StorageWriter> = Arc::new(MemStorage::default());
        probe
            .execute(&CancellationToken::new(), &storage)
            .await
            .unwrap();

        let samples = storage
            .query_uptime_range(Utc::now() - chrono::Duration::minutes(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].status, ServiceStatus::Down);
        assert_eq!(samples[0].http_status, Some(STATUS_CONNECT_FAILED));
        assert!(samples[0].elapsed <= Duration::from_secs(2) + Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_cancellation_mid_flight_drops_sample() {
        use axum::http::StatusCode;
        use axum::routing::any;

        // Stub that never answers within the test window.
        let app = axum::Router::new().route(
            "/",
            any(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                StatusCode::OK
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut cfg = probe_config(&format!("http://{addr}/"));
        cfg.timeout = Some(Duration::from_secs(20));

        let probe = HttpProbe::load("web1".to_string(), &cfg, &ProxyRegistry::default())
            .await
            .unwrap();

        let storage: Arc<dyn StorageWriter> = Arc::new(MemStorage::default());
        let ctx = CancellationToken::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let begun = Instant::now();
        probe.execute(&ctx, &storage).await.unwrap();
        assert!(begun.elapsed() < Duration::from_secs(2));

        // Aborted executions leave no partial sample behind.
        let samples = storage
            .query_uptime_range(Utc::now() - chrono::Duration::minutes(1), Utc::now())
            .await
            .unwrap();
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_execution_is_rejected() {
        let addr = stub_server(200).await;
        let probe = HttpProbe::load(
            "web1".to_string(),
            &probe_config(&format!("http://{addr}/")),
            &ProxyRegistry::default(),
        )
        .await
        .unwrap();

        probe.timer.acquire().unwrap();

        let storage: Arc<dyn StorageWriter> = Arc::new(MemStorage::default());
        let result = probe.execute(&CancellationToken::new(), &storage).await;
        assert!(matches!(result, Err(ProbeError::Locked)));
    }
}
