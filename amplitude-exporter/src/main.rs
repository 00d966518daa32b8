//! Prometheus exporter for Amplitude chart queries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use amplitude_exporter::logging::init_tracing;
use amplitude_exporter::{
    ExporterConfig, HttpFetcher, HttpServer, MetricRegistry, ScrapeScheduler,
};

/// Prometheus exporter for Amplitude chart queries.
#[derive(Parser, Debug)]
#[command(name = "amplitude-exporter")]
#[command(about = "Export Amplitude chart values as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(
        short,
        long,
        env = "AMPLITUDE_EXPORTER_CONFIG",
        default_value = "config.json5"
    )]
    config: String,

    /// HTTP listen address (overrides config).
    #[arg(short, long)]
    listen: Option<String>,

    /// Scrape interval in seconds (overrides config).
    #[arg(short, long)]
    interval: Option<u64>,

    /// Per-query timeout in seconds (overrides config).
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error); overrides config.
    #[arg(long)]
    log_level: Option<String>,

    /// Shorthand for `--log-level debug`.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply_overrides(&self, config: &mut ExporterConfig) {
        if let Some(listen) = &self.listen {
            config.prometheus.listen = listen.clone();
        }
        if let Some(interval) = self.interval {
            config.scrape.interval_secs = interval;
        }
        if let Some(timeout) = self.timeout {
            config.upstream.timeout_secs = timeout;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ExporterConfig::load_from_file(&args.config)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", args.config, e))?;
    args.apply_overrides(&mut config);
    config.validate()?;

    init_tracing(&config.logging)?;

    info!(
        config = %args.config,
        projects = config.projects.len(),
        charts = config.chart_count(),
        "Starting Amplitude exporter"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(MetricRegistry::from_config(&config)?);
    let fetcher = Arc::new(
        HttpFetcher::new(&config.upstream)
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?,
    );
    let scheduler = ScrapeScheduler::from_config(&config, registry.clone(), fetcher);

    let listen_addr: SocketAddr = config
        .prometheus
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;
    let http_server = HttpServer::new(
        registry.clone(),
        listen_addr,
        config.prometheus.path.clone(),
    );

    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    shutdown_tx.send(true)?;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = scheduler_task.await;
        let _ = http_task.await;
    })
    .await;

    let health = registry.health().snapshot();
    info!(
        scrapes = health.total_scrapes,
        fetch_errors = health.fetch_errors_total,
        series_count = registry.len(),
        "Final statistics"
    );

    info!("Exporter stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
