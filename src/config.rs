//! Configuration file loading and validation.
//!
//! Config files are YAML or JSON, detected by extension. Probe maps
//! are keyed by label; durations accept bare seconds or suffixed
//! strings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::duration;

/// Default launch period for probes without an `interval`.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Default per-execution ceiling for probes without a `timeout`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to decode config file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config file format '{0}'")]
    UnsupportedFormat(String),
    #[error("config file must be a regular file")]
    NotRegularFile,
    #[error("invalid probe '{label}': {reason}")]
    InvalidProbe { label: String, reason: String },
    #[error("invalid proxy '{name}': {reason}")]
    InvalidProxy { name: String, reason: String },
}

#[derive(Debug, Default, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub probes: ProbesConfig,
    #[serde(default)]
    pub proxies: BTreeMap<String, ProxyConfig>,
    #[serde(default)]
    pub exporters: ExportersConfig,
    #[serde(default)]
    pub taskhost: TaskhostConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProbesConfig {
    #[serde(default)]
    pub http: BTreeMap<String, HttpProbeConfig>,
    #[serde(default)]
    pub icmp: BTreeMap<String, IcmpProbeConfig>,
    #[serde(default)]
    pub tls: BTreeMap<String, TlsProbeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpProbeConfig {
    #[serde(default, deserialize_with = "duration::serde_opt::deserialize")]
    pub interval: Option<Duration>,
    #[serde(default, deserialize_with = "duration::serde_opt::deserialize")]
    pub timeout: Option<Duration>,
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Name of an entry in the `proxies` map.
    #[serde(default, alias = "proxy")]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IcmpProbeConfig {
    #[serde(default, deserialize_with = "duration::serde_opt::deserialize")]
    pub interval: Option<Duration>,
    #[serde(default, deserialize_with = "duration::serde_opt::deserialize")]
    pub timeout: Option<Duration>,
    pub host: String,
    #[serde(default)]
    pub retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsProbeConfig {
    #[serde(default, deserialize_with = "duration::serde_opt::deserialize")]
    pub interval: Option<Duration>,
    #[serde(default, deserialize_with = "duration::serde_opt::deserialize")]
    pub timeout: Option<Duration>,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportersConfig {
    #[serde(default)]
    pub web: WebExporterConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebExporterConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskhostConfig {
    #[serde(default)]
    pub autorun: bool,
}

/// Allowed request methods for the HTTP probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    Get,
    #[default]
    Head,
    Post,
    Options,
}

impl HttpMethod {
    /// Empty means the default. CONNECT, PUT, PATCH and DELETE are
    /// explicitly disallowed; anything unrecognized is rejected too.
    pub fn parse(val: &str) -> Result<Self, String> {
        match val.to_uppercase().as_str() {
            "" => Ok(HttpMethod::Head),
            "GET" => Ok(HttpMethod::Get),
            "HEAD" => Ok(HttpMethod::Head),
            "POST" => Ok(HttpMethod::Post),
            "OPTIONS" => Ok(HttpMethod::Options),
            m @ ("CONNECT" | "PUT" | "PATCH" | "DELETE") => {
                Err(format!("http method '{m}' not allowed"))
            }
            m => Err(format!("invalid http method '{m}'")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

/// Clamp a configured interval: missing or sub-second values take the
/// default.
pub fn effective_interval(configured: Option<Duration>) -> Duration {
    match configured {
        Some(val) if val >= Duration::from_secs(1) => val,
        _ => DEFAULT_INTERVAL,
    }
}

/// Missing or zero timeouts take the default.
pub fn effective_timeout(configured: Option<Duration>) -> Duration {
    match configured {
        Some(val) if val > Duration::ZERO => val,
        _ => DEFAULT_TIMEOUT,
    }
}

impl RootConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (label, probe) in &self.probes.http {
            probe.validate(label, &self.proxies)?;
        }

        for (label, probe) in &self.probes.icmp {
            if probe.host.trim().is_empty() {
                return Err(ConfigError::InvalidProbe {
                    label: label.clone(),
                    reason: "icmp probe host is empty".to_string(),
                });
            }
        }

        for (label, probe) in &self.probes.tls {
            if probe.host.trim().is_empty() {
                return Err(ConfigError::InvalidProbe {
                    label: label.clone(),
                    reason: "tls probe host is empty".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl HttpProbeConfig {
    fn validate(
        &self,
        label: &str,
        proxies: &BTreeMap<String, ProxyConfig>,
    ) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidProbe {
            label: label.to_string(),
            reason,
        };

        HttpMethod::parse(self.method.as_deref().unwrap_or("")).map_err(invalid)?;

        let url = url::Url::parse(&ensure_scheme(&self.url))
            .map_err(|e| invalid(format!("invalid http url '{}': {e}", self.url)))?;
        if url.host_str().is_none() {
            return Err(invalid(format!(
                "invalid http url '{}': host required",
                self.url
            )));
        }

        if let Some(proxy) = &self.proxy_url {
            if proxies.is_empty() {
                return Err(invalid("no proxies defined in the config".to_string()));
            }
            if !proxies.contains_key(proxy) {
                return Err(invalid(format!("probe proxy '{proxy}' is not defined")));
            }
        }

        Ok(())
    }
}

/// Probe urls may omit the scheme; plain http is assumed.
pub fn ensure_scheme(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

/// Returns the first existing regular file among `locations`.
pub fn find_config(locations: &[&str]) -> Option<PathBuf> {
    locations
        .iter()
        .map(PathBuf::from)
        .find(|path| path.metadata().map(|m| m.is_file()).unwrap_or(false))
}

/// Load and validate a config file, YAML or JSON by extension.
pub fn load_file(path: &Path) -> Result<RootConfig, ConfigError> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_file() {
        return Err(ConfigError::NotRegularFile);
    }

    let text = std::fs::read_to_string(path)?;

    let cfg: RootConfig = match path.extension().and_then(|e| e.to_str()) {
        Some("yml") | Some("yaml") => serde_yaml::from_str(&text)?,
        Some("json") => serde_json::from_str(&text)?,
        other => {
            return Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            ))
        }
    };

    cfg.validate()?;

    Ok(cfg)
}
