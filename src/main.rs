//! watchpost - uptime and certificate probing service.
//!
//! Wires config, storage, probes, the task host and the optional read
//! API together, then blocks until a termination signal cancels the
//! root lifecycle token.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use watchpost::probe::{HttpProbe, IcmpProbe, LabelIndex, Probe, ProbeKind, TlsProbe};
use watchpost::proxy::ProxyRegistry;
use watchpost::scheduler::TaskHost;
use watchpost::{config, storage, web};

const CONFIG_LOCATIONS: &[&str] = &["./watchpost.yml", "/etc/watchpost/watchpost.yml"];

const DEFAULT_API_PORT: u16 = 7200;

#[derive(Parser)]
#[command(name = "watchpost", about, version)]
struct Cli {
    /// Config file location.
    #[arg(long)]
    cfg: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Log in JSON format.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let debug = cli.debug || std::env::var("DEBUG").is_ok_and(|v| v == "true");
    let json_logs = cli.json_logs || std::env::var("LOGFMT").is_ok_and(|v| v == "json");

    init_logging(debug, json_logs);

    tracing::info!("starting watchpost service");

    let cfg_path = match cli.cfg {
        Some(path) => path,
        None => config::find_config(CONFIG_LOCATIONS).context("no config files found")?,
    };

    tracing::info!(at = %cfg_path.display(), "config file located");

    let cfg = config::load_file(&cfg_path)
        .with_context(|| format!("failed to load config from {}", cfg_path.display()))?;

    let storage = storage::from_env()
        .await
        .context("failed to set up storage")?;

    tracing::info!(
        kind = storage.kind(),
        version = storage.version(),
        "using storage",
    );

    let proxies = ProxyRegistry::load(&cfg.proxies).context("failed to load proxies")?;
    let probes = build_probes(&cfg, &proxies).await?;

    if probes.is_empty() {
        tracing::warn!("no probes configured");
    }

    let ctx = CancellationToken::new();
    spawn_signal_handler(ctx.clone());

    if cfg.exporters.web.enabled {
        let port = api_port();
        let server = web::Server::new(storage.clone(), port);
        let server_ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = server.run(server_ctx).await {
                tracing::error!(err = %err, "api server error");
                std::process::exit(1);
            }
        });
    }

    tracing::info!("starting tasks now");

    let host = TaskHost::new(probes, storage.clone(), cfg.taskhost.autorun);
    host.run(ctx).await;

    storage.close().await;

    Ok(())
}

fn init_logging(debug: bool, json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug { "watchpost=debug" } else { "watchpost=info" })
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn api_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_API_PORT)
}

/// Construct every configured probe, disambiguating labels that
/// collide across kinds. Any probe that fails to load aborts startup.
async fn build_probes(
    cfg: &config::RootConfig,
    proxies: &ProxyRegistry,
) -> Result<Vec<Arc<dyn Probe>>> {
    let mut index = LabelIndex::default();
    index.add(cfg.probes.http.keys());
    index.add(cfg.probes.icmp.keys());
    index.add(cfg.probes.tls.keys());

    let mut probes: Vec<Arc<dyn Probe>> = Vec::new();

    for (key, probe_cfg) in &cfg.probes.http {
        let label = index.resolve(key, ProbeKind::Http);
        let probe = HttpProbe::load(label.clone(), probe_cfg, proxies)
            .await
            .with_context(|| format!("failed to load http probe '{label}'"))?;

        tracing::info!(
            label = %label,
            url = %probe_cfg.url,
            interval_s = probe.interval().as_secs(),
            "add http probe",
        );

        probes.push(Arc::new(probe));
    }

    for (key, probe_cfg) in &cfg.probes.icmp {
        let label = index.resolve(key, ProbeKind::Icmp);
        let probe = IcmpProbe::load(label.clone(), probe_cfg);

        tracing::info!(
            label = %label,
            host = %probe_cfg.host,
            interval_s = probe.interval().as_secs(),
            "add icmp probe",
        );

        probes.push(Arc::new(probe));
    }

    for (key, probe_cfg) in &cfg.probes.tls {
        let label = index.resolve(key, ProbeKind::Tls);
        let probe = TlsProbe::load(label.clone(), probe_cfg)
            .await
            .with_context(|| format!("failed to load tls probe '{label}'"))?;

        tracing::info!(
            label = %label,
            host = %probe_cfg.host,
            interval_s = probe.interval().as_secs(),
            "add tls probe",
        );

        probes.push(Arc::new(probe));
    }

    Ok(probes)
}

fn spawn_signal_handler(ctx: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("shutting down...");
        ctx.cancel();
    });
}
