//! TLS certificate inspection probe.
//!
//! Opens a TCP+TLS connection, picks the peer certificate whose DNS
//! SANs cover the configured hostname (falling back to the first) and
//! records its subject, issuer, expiry and a SHA-1 fingerprint of the
//! certificate signature. Chain validation is disabled: an invalid or
//! self-signed certificate is still a certificate worth reporting.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use x509_parser::prelude::*;

use super::{resolve_host, Probe, ProbeError, ProbeKind, ProbeTimer};
use crate::config::{self, ConfigError, TlsProbeConfig};
use crate::storage::{StorageWriter, TlsSample};

pub struct TlsProbe {
    label: String,
    timer: ProbeTimer,
    timeout: Duration,
    hostname: String,
    port: u16,
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

struct HandshakeInfo {
    certs: Vec<CertificateDer<'static>>,
    protocol: Option<u16>,
}

impl TlsProbe {
    /// Build the probe from config. The hostname must resolve at load
    /// time; the port defaults to 443.
    pub async fn load(label: String, cfg: &TlsProbeConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidProbe {
            label: label.clone(),
            reason,
        };

        let (hostname, port) = split_host_port(cfg.host.trim());
        let hostname = hostname.to_string();

        resolve_host(&hostname)
            .await
            .map_err(|e| invalid(e.to_string()))?;

        let server_name = ServerName::try_from(hostname.clone())
            .map_err(|e| invalid(format!("invalid tls host '{hostname}': {e}")))?;

        let tls_config =
            insecure_client_config(None).map_err(|e| invalid(format!("tls config: {e}")))?;

        Ok(Self {
            label,
            timer: ProbeTimer::new(config::effective_interval(cfg.interval)),
            timeout: config::effective_timeout(cfg.timeout),
            hostname,
            port,
            server_name,
            connector: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    pub fn interval(&self) -> Duration {
        self.timer.interval()
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        storage: &Arc<dyn StorageWriter>,
    ) -> Result<(), ProbeError> {
        let begun = Instant::now();
        let deadline = begun + self.timeout;

        let handshake = tokio::select! {
            // Shutdown mid-flight: exit without a partial sample.
            _ = ctx.cancelled() => return Ok(()),
            result = tokio::time::timeout_at(deadline, self.handshake()) => match result {
                Ok(Ok(info)) => Some(info),
                Ok(Err(err)) => {
                    tracing::debug!(label = %self.label, err = %err, "tls dial failed");
                    None
                }
                Err(_) => {
                    tracing::debug!(label = %self.label, "tls dial timed out");
                    None
                }
            },
        };

        let sample = match &handshake {
            Some(info) if !info.certs.is_empty() => {
                if let Some(proto) = info.protocol {
                    tracing::debug!(
                        label = %self.label,
                        tls_version = tls_version_code(proto),
                        "negotiated protocol",
                    );
                }
                self.inspect(info)
            }
            _ => self.insecure_sample(),
        };

        tracing::debug!(
            label = %self.label,
            security = %sample.security,
            issuer = sample.cert_issuer.as_deref().unwrap_or(""),
            elapsed_ms = begun.elapsed().as_millis() as i64,
            "upd tls",
        );

        storage.push_tls(sample).await?;

        Ok(())
    }

    async fn handshake(&self) -> std::io::Result<HandshakeInfo> {
        let tcp = TcpStream::connect((self.hostname.as_str(), self.port)).await?;
        let stream = self.connector.connect(self.server_name.clone(), tcp).await?;

        let (_, conn) = stream.get_ref();
        Ok(HandshakeInfo {
            certs: conn
                .peer_certificates()
                .map(|certs| certs.to_vec())
                .unwrap_or_default(),
            protocol: conn.protocol_version().map(u16::from),
        })
    }

    /// Compose the sample from the most relevant peer certificate.
    /// `security` reports the X.509 structure version, a long-standing
    /// observable of this probe's output format.
    fn inspect(&self, info: &HandshakeInfo) -> TlsSample {
        let der = &info.certs[select_cert_index(&info.certs, &self.hostname)];

        let cert = match X509Certificate::from_der(der) {
            Ok((_, cert)) => cert,
            Err(err) => {
                tracing::debug!(label = %self.label, err = %err, "failed to parse peer certificate");
                return self.insecure_sample();
            }
        };

        let fingerprint = {
            let mut hash = Sha1::new();
            hash.update(&cert.signature_value.data);
            hex::encode(hash.finalize())
        };

        TlsSample {
            time: Utc::now(),
            label: self.label.clone(),
            security: format!("tls 1.{}", cert.version().0 + 1),
            secure: true,
            cert_subject: Some(cert.subject().to_string()),
            cert_issuer: Some(cert.issuer().to_string()),
            cert_expires: DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0),
            cert_fingerprint: Some(fingerprint),
        }
    }

    fn insecure_sample(&self) -> TlsSample {
        TlsSample {
            time: Utc::now(),
            label: self.label.clone(),
            security: "none".to_string(),
            secure: false,
            cert_subject: None,
            cert_issuer: None,
            cert_expires: None,
            cert_fingerprint: None,
        }
    }
}

#[async_trait]
impl Probe for TlsProbe {
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
        ProbeKind::Tls
    }
}

/// Numeric code for a raw TLS protocol version. Unknown versions pass
/// through unchanged.
pub fn tls_version_code(version: u16) -> u16 {
    match version {
        0x0300 => 300, // SSL 3.0
        0x0301 => 100, // TLS 1.0
        0x0302 => 110, // TLS 1.1
        0x0303 => 120, // TLS 1.2
        0x0304 => 130, // TLS 1.3
        other => other,
    }
}

/// Index of the certificate whose DNS SANs contain `hostname`, or 0.
fn select_cert_index(certs: &[CertificateDer<'_>], hostname: &str) -> usize {
    for (idx, der) in certs.iter().enumerate() {
        let Ok((_, cert)) = X509Certificate::from_der(der) else {
            continue;
        };

        let Ok(Some(san)) = cert.subject_alternative_name() else {
            continue;
        };

        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                if *dns == hostname {
                    return idx;
                }
            }
        }
    }

    0
}

/// Split an optional `:port` suffix off a config host; the port
/// defaults to 443. Bare IPv6 addresses pass through untouched.
fn split_host_port(host: &str) -> (&str, u16) {
    if let Some((name, port)) = host.rsplit_once(':') {
        if !name.contains(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (name, port);
            }
        }
    }
    (host, 443)
}

/// Client config that trusts any peer, for measurement probes. When a
/// `negotiated` cell is supplied, the verifier records the raw
/// protocol version of each handshake into it.
pub(crate) fn insecure_client_config(
    negotiated: Option<Arc<AtomicU16>>,
) -> Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = InsecureVerifier {
        provider: provider.clone(),
        negotiated,
    };

    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

/// Accepts any certificate chain; signature checks still run so the
/// handshake itself stays honest. The per-version signature callbacks
/// double as the protocol-version observation point.
#[derive(Debug)]
struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
    negotiated: Option<Arc<AtomicU16>>,
}

impl InsecureVerifier {
    fn record(&self, raw_version: u16) {
        if let Some(cell) = &self.negotiated {
            cell.store(raw_version, Ordering::Relaxed);
        }
    }
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.record(0x0303);
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.record(0x0304);
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mem::MemStorage;
    use rustls::pki_types::PrivateKeyDer;

    #[test]
    fn test_tls_version_mapping_is_total() {
        assert_eq!(tls_version_code(0x0300), 300);
        assert_eq!(tls_version_code(0x0301), 100);
        assert_eq!(tls_version_code(0x0302), 110);
        assert_eq!(tls_version_code(0x0303), 120);
        assert_eq!(tls_version_code(0x0304), 130);
        assert_eq!(tls_version_code(0x7f1c), 0x7f1c);
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com"), ("example.com", 443));
        assert_eq!(split_host_port("example.com:8443"), ("example.com", 8443));
        assert_eq!(split_host_port("::1"), ("::1", 443));
        assert_eq!(split_host_port("example.com:notaport"), ("example.com:notaport", 443));
    }

    fn self_signed(
        san: &str,
        not_after_unix: i64,
    ) -> (rcgen::Certificate, rcgen::KeyPair) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec![san.to_string()]).unwrap();
        params.not_before = ::time::OffsetDateTime::from_unix_timestamp(1700000000).unwrap();
        params.not_after = ::time::OffsetDateTime::from_unix_timestamp(not_after_unix).unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert, key)
    }

    async fn stub_tls_server(cert: &rcgen::Certificate, key: &rcgen::KeyPair) -> u16 {
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
                    let _ = acceptor.accept(stream).await;
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn test_certificate_inspection() {
        // 2030-01-01T00:00:00Z
        let expires = 1893456000;
        let (cert, key) = self_signed("localhost", expires);
        let port = stub_tls_server(&cert, &key).await;

        let probe = TlsProbe::load(
            "cert1".to_string(),
            &TlsProbeConfig {
                interval: Some(Duration::from_secs(1)),
                timeout: Some(Duration::from_secs(2)),
                host: format!("localhost:{port}"),
            },
        )
        .await
        .unwrap();

        let storage: Arc<dyn StorageWriter> = Arc::new(MemStorage::default());
        probe
            .execute(&CancellationToken::new(), &storage)
            .await
            .unwrap();

        let samples = storage
            .query_tls_range(Utc::now() - chrono::Duration::minutes(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);

        let sample = &samples[0];
        assert!(sample.secure);
        assert_eq!(sample.security, "tls 1.3");
        assert_eq!(
            sample.cert_expires,
            DateTime::from_timestamp(expires, 0),
        );

        // Fingerprint must be the hex SHA-1 of the served certificate's
        // signature bits.
        let (_, parsed) = X509Certificate::from_der(cert.der()).unwrap();
        let mut hash = Sha1::new();
        hash.update(&parsed.signature_value.data);
        assert_eq!(
            sample.cert_fingerprint.as_deref(),
            Some(hex::encode(hash.finalize()).as_str()),
        );
    }

    #[tokio::test]
    async fn test_handshake_failure_reports_none() {
        // Closed port: dial fails, the probe still emits a sample.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = TlsProbe::load(
            "cert1".to_string(),
            &TlsProbeConfig {
                interval: Some(Duration::from_secs(1)),
                timeout: Some(Duration::from_secs(1)),
                host: format!("localhost:{port}"),
            },
        )
        .await
        .unwrap();

        let storage: Arc<dyn StorageWriter> = Arc::new(MemStorage::default());
        probe
            .execute(&CancellationToken::new(), &storage)
            .await
            .unwrap();

        let samples = storage
            .query_tls_range(Utc::now() - chrono::Duration::minutes(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert!(!samples[0].secure);
        assert_eq!(samples[0].security, "none");
        assert!(samples[0].cert_fingerprint.is_none());
    }
}
