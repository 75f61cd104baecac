use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

use clustermon::config::Config;
use clustermon::metric::Metric;
use clustermon::router::MetricRouter;
use clustermon::stats::StatsApi;
use clustermon::ticker::MultiChanTicker;
use clustermon::topology::{StaticTopology, Topology};

/// Capacity of the channel between the router and the log sink.
const SINK_CHANNEL_CAPACITY: usize = 1024;

/// Central routing and aggregation stage for cluster metrics.
#[derive(Parser)]
#[command(name = "clustermon", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("clustermon {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting clustermon",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let hostname = resolve_hostname(cfg.hostname.as_deref());

    let topology = StaticTopology::from_sysfs();
    if topology.is_empty() {
        bail!("no hardware threads found in sysfs");
    }
    let info = topology.cpu_info();
    tracing::info!(
        hostname = %hostname,
        hw_threads = info.num_hw_threads,
        sockets = info.num_sockets,
        numa_domains = info.num_numa_domains,
        "topology discovered",
    );
    let topology: Arc<dyn Topology> = Arc::new(topology);

    let ticker = MultiChanTicker::new(cfg.interval)?;

    let stats = StatsApi::new(cfg.stats_api.clone());
    stats.start(&ticker).await.context("starting stats api")?;

    let router = MetricRouter::new(&cfg.router, &hostname, topology, stats.handle())
        .context("configuring router")?;

    let (sink_tx, sink_rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
    router.add_output(sink_tx)?;
    router.start(&ticker).context("starting router")?;

    let sink = tokio::spawn(log_sink(sink_rx));

    ticker.start();

    wait_for_signal().await;

    ticker.close().await;
    router.close().await;
    drop(router);
    if let Err(e) = sink.await {
        tracing::warn!(error = %e, "log sink task failed");
    }

    match serde_json::to_string(&stats.snapshot()) {
        Ok(json) => tracing::info!(stats = %json, "final component stats"),
        Err(e) => tracing::warn!(error = %e, "encoding final stats"),
    }
    stats.close().await;

    tracing::info!("clustermon stopped");

    Ok(())
}

/// Writes every routed metric to the log in line protocol.
async fn log_sink(mut rx: mpsc::Receiver<Metric>) {
    let mut count = 0u64;
    while let Some(metric) = rx.recv().await {
        tracing::info!(target: "clustermon::sink", "{metric}");
        count += 1;
    }
    tracing::debug!(count, "log sink drained");
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to wait for SIGINT");
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}

fn resolve_hostname(configured: Option<&str>) -> String {
    if let Some(h) = configured.filter(|h| !h.is_empty()) {
        return h.to_string();
    }

    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
