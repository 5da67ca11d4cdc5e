//! Probe implementations and the shared execution state machine.
//!
//! Each probe kind satisfies the same capability set: report readiness,
//! run one measurement under a cancellation token, and identify itself
//! by label and kind. The scheduler depends on nothing else.

mod http;
mod icmp;
mod tls;

pub use http::HttpProbe;
pub use icmp::IcmpProbe;
pub use tls::TlsProbe;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::storage::{StorageError, StorageWriter};

/// Request identifier sent with outgoing probes.
pub const USER_AGENT: &str = concat!("watchpost/", env!("CARGO_PKG_VERSION"));

/// Protocol class of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Http,
    Icmp,
    Tls,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Http => "http",
            ProbeKind::Icmp => "icmp",
            ProbeKind::Tls => "tls",
        }
    }
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("execution already in flight")]
    Locked,
    #[error("failed to resolve '{host}': {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Capability set the scheduler depends on.
#[async_trait]
pub trait Probe: Send + Sync {
    /// True when the probe is due and no execution is in flight.
    fn ready(&self) -> bool;

    /// Run one measurement and push the resulting sample to `storage`.
    /// The execution is bounded by the probe's own timeout and aborts
    /// early when `ctx` is cancelled.
    async fn execute(
        &self,
        ctx: &CancellationToken,
        storage: &Arc<dyn StorageWriter>,
    ) -> Result<(), ProbeError>;

    fn label(&self) -> &str;

    fn kind(&self) -> ProbeKind;
}

/// Ready/locked/next-run state shared by all probe kinds.
///
/// `next_run` is advanced exactly once per execution, on exit, and the
/// write happens before the lock is released so the scheduler observes
/// both updates together.
pub struct ProbeTimer {
    interval: Duration,
    locked: AtomicBool,
    next_run: Mutex<Option<Instant>>,
}

impl ProbeTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            locked: AtomicBool::new(false),
            next_run: Mutex::new(None),
        }
    }

    /// Readiness check. The first observation arms `next_run` and
    /// reports not-ready; an immediate first launch is the task host's
    /// autorun pass.
    pub fn ready(&self) -> bool {
        if self.locked.load(Ordering::Acquire) {
            return false;
        }

        let mut next_run = self.next_run.lock().unwrap();
        match *next_run {
            None => {
                *next_run = Some(Instant::now() + self.interval);
                false
            }
            Some(at) => Instant::now() >= at,
        }
    }

    /// The ready -> running transition: compare-and-set on the lock.
    pub fn acquire(&self) -> Result<(), ProbeError> {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ProbeError::Locked)
    }

    /// The running -> idle transition, on any exit path.
    pub fn release(&self) {
        *self.next_run.lock().unwrap() = Some(Instant::now() + self.interval);
        self.locked.store(false, Ordering::Release);
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Index of raw config labels used to disambiguate collisions across
/// probe kinds: a colliding `foo` becomes `foo:http`, then `foo-1:http`
/// while still taken.
#[derive(Default)]
pub struct LabelIndex {
    counts: HashMap<String, usize>,
}

impl LabelIndex {
    pub fn add<'a, I: IntoIterator<Item = &'a String>>(&mut self, labels: I) {
        for label in labels {
            *self.counts.entry(label.clone()).or_default() += 1;
        }
    }

    fn is_unique(&self, label: &str) -> bool {
        self.counts.get(label).map_or(true, |n| *n <= 1)
    }

    pub fn resolve(&self, label: &str, kind: ProbeKind) -> String {
        if self.is_unique(label) {
            return label.to_string();
        }

        let tagged = format!("{label}:{kind}");
        if self.is_unique(&tagged) {
            return tagged;
        }

        let mut idx = 1usize;
        loop {
            let candidate = format!("{label}-{idx}:{kind}");
            if self.is_unique(&candidate) {
                return candidate;
            }
            idx += 1;
        }
    }
}

/// Resolve a hostname to its first address.
pub(crate) async fn resolve_host(host: &str) -> Result<std::net::IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host((host, 0u16))
        .await
        .map_err(|source| ProbeError::Resolve {
            host: host.to_string(),
            source,
        })?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Resolve {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
        })
}
