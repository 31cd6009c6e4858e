//! # rbnb-route
//!
//! Routing plug-in binary: serves data requests from a gateway server by
//! forwarding them to a remote data source.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;

use route_broker::settings::MetricsSettings;
use route_broker::{load_settings, open_recorder, Broker, BrokerConfig, MetricsReporter, RouteSettings};
use route_net::{TcpDataConnector, TcpRequestSourceConnector};
use route_telemetry::{default_data_dir, init_telemetry, TelemetryConfig};

/// Request-routing plug-in.
#[derive(Parser, Debug)]
#[command(name = "rbnb-route", about = "Routes data requests from a gateway to a remote data source")]
struct Cli {
    /// Gateway (request source) address, host:port.
    #[arg(short = 'a', long)]
    plugin_address: Option<String>,

    /// Remote data source (sink) address, host:port.
    #[arg(short = 'b', long)]
    sink_address: Option<String>,

    /// Fetch timeout in milliseconds; -1 waits forever.
    #[arg(short = 't', long, allow_hyphen_values = true)]
    timeout: Option<i64>,

    /// Client name; defaults to the last segment of the remote source name.
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Metrics as interval[,cache[,archive]].
    #[arg(short = 'm', long)]
    metrics: Option<String>,

    /// Debug logging for the routing crates.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Log JSON lines instead of text.
    #[arg(long)]
    json_logs: bool,

    /// JSON settings file merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Flags win over file and environment settings.
    fn apply(&self, settings: &mut RouteSettings) -> Result<()> {
        if let Some(addr) = &self.plugin_address {
            settings.plugin_address = addr.clone();
        }
        if let Some(addr) = &self.sink_address {
            settings.sink_address = addr.clone();
        }
        if let Some(timeout) = self.timeout {
            settings.timeout_ms = timeout;
        }
        if let Some(name) = &self.name {
            settings.client_name = Some(name.clone());
        }
        if let Some(spec) = &self.metrics {
            settings.metrics = MetricsSettings::parse_triplet(spec).context("invalid -m value")?;
        }
        if self.debug {
            settings.logging.debug = true;
        }
        if self.json_logs {
            settings.logging.json = true;
        }
        Ok(())
    }
}

fn telemetry_config(settings: &RouteSettings) -> TelemetryConfig {
    let config = TelemetryConfig {
        log_level: Level::from_str(&settings.logging.level).unwrap_or(Level::INFO),
        json: settings.logging.json,
        ..TelemetryConfig::default()
    };
    if settings.logging.debug {
        config.with_debug()
    } else {
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref()).context("failed to load settings")?;
    cli.apply(&mut settings)?;
    settings.validate().context("invalid settings")?;

    let _telemetry = init_telemetry(telemetry_config(&settings));

    let data_dir = default_data_dir();
    if settings.metrics.archive > 0 {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create directory: {}", data_dir.display()))?;
    }
    let metrics = open_recorder(&settings.metrics, &data_dir)?;

    let broker = Broker::new(
        BrokerConfig::from(&settings),
        Arc::new(TcpRequestSourceConnector),
        Arc::new(TcpDataConnector),
        metrics.clone(),
    );
    let shutdown = broker.shutdown_token();

    let reporter = tokio::spawn(MetricsReporter::new(metrics, &settings.metrics).run(shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    tracing::info!(
        plugin_address = %settings.plugin_address,
        sink_address = %settings.sink_address,
        timeout_ms = settings.timeout_ms,
        max_threads = settings.max_threads,
        metrics_interval_secs = settings.metrics.interval_secs,
        "starting routing plug-in"
    );
    let result = broker.run().await;

    shutdown.cancel();
    if let Err(e) = reporter.await {
        tracing::warn!(error = %e, "metrics reporter task failed");
    }
    result.context("routing plug-in stopped")
}
