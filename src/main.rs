use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing_subscriber::{fmt, EnvFilter};

use pmc_controller::catalog::StaticCatalog;
use pmc_controller::config::{Config, ControlSource};
use pmc_controller::control::http::ControlServer;
use pmc_controller::control::{self, ControlChannel, LineChannel};
use pmc_controller::controller::Controller;
use pmc_controller::export::health::HealthMetrics;
use pmc_controller::selection::SelectionEngine;
use pmc_controller::sensor::{HwpcSensor, SensorProcess};

/// Hardware performance counter event controller.
#[derive(Parser)]
#[command(name = "pmc-controller", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides the configuration file.
    #[arg(long)]
    log_level: Option<String>,

    /// Host whose control commands are applied. Overrides the configuration file.
    #[arg(long)]
    hostname: Option<String>,

    /// Processor model (PMU name). Overrides the configuration file.
    #[arg(long)]
    pmu: Option<String>,

    /// Seed for the event pool permutation. Overrides the configuration file.
    #[arg(long)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
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
        println!("pmc-controller {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .as_ref()
        .context("--config is required (use --help for usage)")?;

    let mut cfg = Config::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    if let Some(level) = cli.log_level {
        cfg.log_level = level;
    }
    if let Some(hostname) = cli.hostname {
        cfg.hostname = hostname;
    }
    if let Some(pmu) = cli.pmu {
        cfg.pmu = pmu;
    }
    if cli.seed.is_some() {
        cfg.seed = cli.seed;
    }

    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    cfg.validate().context("validating config")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        hostname = %cfg.hostname,
        pmu = %cfg.pmu,
        "starting pmc-controller",
    );

    // The loop is strictly sequential; one thread is enough.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let catalog = StaticCatalog::load(&cfg.catalog.path)?;

    let engine = SelectionEngine::new(&cfg.pmu, cfg.fixed_events.clone(), &catalog, cfg.seed)
        .context("building selection engine")?;

    engine
        .check_fixed_slots()
        .with_context(|| format!("checking fixed events for {}", cfg.pmu))?;

    let metrics = if cfg.health.enabled {
        let metrics = Arc::new(
            HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?,
        );
        metrics
            .start()
            .await
            .context("starting health metrics server")?;
        Some(metrics)
    } else {
        None
    };

    let sensor = HwpcSensor::new(cfg.sensor.clone());

    let result = match cfg.control.source {
        ControlSource::Http => {
            let (tx, channel) = control::queue(cfg.hostname.clone(), cfg.control.queue_capacity);
            let server = ControlServer::new(&cfg.control.addr, tx);
            server.start().await.context("starting control server")?;

            let result = drive(Controller::new(engine, channel, sensor), metrics.clone()).await;

            server.stop().await?;
            result
        }
        ControlSource::Stdin => {
            let stdin = BufReader::new(tokio::io::stdin());
            let channel = LineChannel::new(cfg.hostname.clone(), stdin);
            drive(Controller::new(engine, channel, sensor), metrics.clone()).await
        }
    };

    if let Some(metrics) = &metrics {
        metrics.stop().await?;
    }

    result
}

/// Run the controller until it fails or the process is asked to stop.
async fn drive<C, S>(
    controller: Controller<C, S>,
    metrics: Option<Arc<HealthMetrics>>,
) -> Result<()>
where
    C: ControlChannel,
    S: SensorProcess,
{
    let mut controller = match metrics {
        Some(metrics) => controller.with_metrics(metrics),
        None => controller,
    };

    controller.run_until(shutdown_signal()).await
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<&'static str> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for SIGINT")?;
            Ok("SIGINT")
        }
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}
