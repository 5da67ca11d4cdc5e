//! Task host: owns the probe set and dispatches ready probes.
//!
//! A one-second ticker drives the loop. On every tick each ready probe
//! is spawned as its own task; overlap protection is the probe's own
//! lock, so the host imposes no concurrency cap. Cancelling the
//! lifecycle token stops dispatching; in-flight executions observe the
//! token and wind down on their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::probe::Probe;
use crate::storage::StorageWriter;

pub struct TaskHost {
    probes: Vec<Arc<dyn Probe>>,
    storage: Arc<dyn StorageWriter>,
    autorun: bool,
    started: AtomicBool,
}

impl TaskHost {
    pub fn new(
        probes: Vec<Arc<dyn Probe>>,
        storage: Arc<dyn StorageWriter>,
        autorun: bool,
    ) -> Self {
        Self {
            probes,
            storage,
            autorun,
            started: AtomicBool::new(false),
        }
    }

    /// Dispatch loop; blocks until `ctx` is cancelled. Starting a host
    /// twice is a programming error and panics.
    pub async fn run(&self, ctx: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            panic!("TaskHost::run called more than once");
        }

        if self.autorun {
            tracing::info!("autorun enabled");
            for probe in &self.probes {
                self.spawn_execution(probe.clone(), &ctx);
            }
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = ticker.tick() => {
                    for probe in &self.probes {
                        if probe.ready() {
                            self.spawn_execution(probe.clone(), &ctx);
                        }
                    }
                }
            }
        }
    }

    fn spawn_execution(&self, probe: Arc<dyn Probe>, ctx: &CancellationToken) {
        let storage = self.storage.clone();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            tracing::debug!(label = probe.label(), kind = %probe.kind(), "exec probe");

            if let Err(err) = probe.execute(&ctx, &storage).await {
                tracing::error!(
                    label = probe.label(),
                    kind = %probe.kind(),
                    err = %err,
                    "probe returned error",
                );
            }
        });
    }
}
