use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use metricsd::config::{Config, ConfigKey, PipelineConfig};
use metricsd::export::health::HealthMetrics;
use metricsd::processor::Processor;
use metricsd::time::{monotonic_ns, wall_clock_ns};

/// On-device metrics pipeline daemon.
#[derive(Parser)]
#[command(name = "metricsd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

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

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("metricsd {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => serde_yaml::from_str("{}").context("building default config")?,
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting metricsd",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let health = if cfg.health.enabled {
        let health = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
        health.start().await?;
        Some(health)
    } else {
        None
    };

    let alarm_tick = cfg.alarm_tick_interval;
    let boot_configs = cfg.configs.clone();
    let processor = Arc::new(Processor::new(&cfg, health.clone()));

    processor.set_alert_handler(Arc::new(|alert| {
        tracing::warn!(
            alert_id = alert.alert_id,
            metric_id = alert.metric_id,
            rolling_sum = alert.rolling_sum,
            "anomaly alert"
        );
    }));

    // Install pipeline configs listed in the daemon config.
    for path in &boot_configs {
        let data = std::fs::read(path)
            .with_context(|| format!("reading pipeline config {}", path.display()))?;
        let pipeline = PipelineConfig::from_yaml_bytes(&data)
            .with_context(|| format!("parsing pipeline config {}", path.display()))?;
        let key = ConfigKey {
            uid: 0,
            config_id: pipeline.id,
        };
        processor.on_config_updated(monotonic_ns(), wall_clock_ns(), key, pipeline, false);
    }

    // Restore refractory carry-over from a previous run, if present.
    processor.load_metadata(wall_clock_ns(), monotonic_ns());

    // Drive the alarm/TTL tick until shutdown.
    let tick_processor = Arc::clone(&processor);
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(alarm_tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let fired = tick_processor.on_periodic_tick(monotonic_ns(), wall_clock_ns());
            for alarm in fired {
                tracing::debug!(
                    key = %alarm.key,
                    alarm_id = alarm.alarm_id,
                    periods = alarm.periods,
                    "periodic alarm fired"
                );
            }
        }
    });

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;
    ticker.abort();

    // Persist carry-over state; failure means a cold start next boot.
    if !processor.save_metadata(wall_clock_ns(), monotonic_ns()) {
        tracing::warn!("carry-over state not persisted");
    }
    if let Some(health) = &health {
        health.stop();
    }

    tracing::info!("metricsd stopped");

    Ok(())
}
