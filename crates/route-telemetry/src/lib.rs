mod metrics;

pub use metrics::{HistogramSummary, MetricType, MetricsQuery, MetricsRecorder, MetricsSnapshot};

use std::path::PathBuf;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for logging.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "route_broker" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Debug level for the routing crates, default level elsewhere.
    pub fn with_debug(mut self) -> Self {
        for module in ["route_core", "route_broker", "route_net", "rbnb_route"] {
            self.module_levels.push((module.to_string(), Level::DEBUG));
        }
        self
    }

    fn filter_directive(&self) -> String {
        let mut directive = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            directive.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        directive
    }
}

/// Returned by [`init_telemetry`]; keep it alive for the life of the process.
pub struct TelemetryGuard {
    directive: String,
    installed: bool,
}

impl TelemetryGuard {
    /// Filter directive in effect when RUST_LOG is unset.
    pub fn directive(&self) -> &str {
        &self.directive
    }

    /// False when another subscriber was already installed.
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Install the global tracing subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let directive = config.filter_directive();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .is_ok();

    TelemetryGuard {
        directive,
        installed,
    }
}

/// Default directory for on-disk state such as the metrics archive.
pub fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".rbnb-route")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_includes_module_levels() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("route_net".into(), Level::TRACE)],
            json: false,
        };
        assert_eq!(config.filter_directive(), "warn,route_net=trace");
    }

    #[test]
    fn debug_flag_targets_route_crates() {
        let directive = TelemetryConfig::default().with_debug().filter_directive();
        assert!(directive.starts_with("info,"));
        assert!(directive.contains("route_broker=debug"));
        assert!(directive.contains("rbnb_route=debug"));
    }

    #[test]
    fn second_init_is_harmless() {
        let first = init_telemetry(TelemetryConfig::default());
        let second = init_telemetry(TelemetryConfig::default());
        assert!(!(first.installed() && second.installed()));
        assert_eq!(second.directive(), "info");
    }

    #[test]
    fn data_dir_is_named_for_the_router() {
        assert!(default_data_dir().ends_with(".rbnb-route"));
    }
}
