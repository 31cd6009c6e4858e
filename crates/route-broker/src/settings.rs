//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RouteSettings::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply `ROUTE_*` environment variable overrides
//!
//! Command-line flags are applied last by the binary.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Errors that can occur when loading or validating settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Metrics reporting: snapshot every `interval_secs`, keep `cache` rows,
/// persist to disk when `archive > 0`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSettings {
    pub interval_secs: u64,
    pub cache: u64,
    pub archive: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            cache: 3600,
            archive: 0,
        }
    }
}

impl MetricsSettings {
    /// Parse `interval[,cache[,archive]]`; omitted fields keep their defaults.
    pub fn parse_triplet(spec: &str) -> Result<Self> {
        let mut out = Self::default();
        let fields: Vec<&str> = spec.split(',').map(str::trim).collect();
        if fields.len() > 3 || fields.iter().any(|f| f.is_empty()) {
            return Err(SettingsError::InvalidValue(format!(
                "metrics must be interval,cache,archive: {spec}"
            )));
        }
        let parse = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| SettingsError::InvalidValue(format!("not a number in metrics value: {s}")))
        };
        if let Some(v) = fields.first() {
            out.interval_secs = parse(v)?;
        }
        if let Some(v) = fields.get(1) {
            out.cache = parse(v)?;
        }
        if let Some(v) = fields.get(2) {
            out.archive = parse(v)?;
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Debug level for the routing crates.
    pub debug: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            debug: false,
        }
    }
}

/// Top-level router settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteSettings {
    /// Request-source (gateway) server address.
    pub plugin_address: String,
    /// Data-source (sink) server address.
    pub sink_address: String,
    /// Fetch timeout in milliseconds; -1 waits forever.
    pub timeout_ms: i64,
    /// Overrides the client name derived from the remote source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    pub max_threads: usize,
    pub max_connect: u32,
    pub metrics: MetricsSettings,
    pub logging: LoggingSettings,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            plugin_address: "localhost:3333".to_string(),
            sink_address: "localhost:3333".to_string(),
            timeout_ms: 60_000,
            client_name: None,
            max_threads: 100,
            max_connect: 10_000,
            metrics: MetricsSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl RouteSettings {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms < -1 {
            return Err(SettingsError::InvalidValue(format!(
                "timeout must be >= -1, got {}",
                self.timeout_ms
            )));
        }
        if self.max_threads == 0 {
            return Err(SettingsError::InvalidValue("maxThreads must be at least 1".into()));
        }
        if self.max_connect == 0 {
            return Err(SettingsError::InvalidValue("maxConnect must be at least 1".into()));
        }
        if self.plugin_address.is_empty() || self.sink_address.is_empty() {
            return Err(SettingsError::InvalidValue("server addresses must not be empty".into()));
        }
        Ok(())
    }
}

/// Load settings, merging the optional file over defaults, then env overrides.
pub fn load_settings(path: Option<&Path>) -> Result<RouteSettings> {
    let defaults = serde_json::to_value(RouteSettings::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            warn!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut settings: RouteSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `ROUTE_*` environment overrides. Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut RouteSettings) {
    if let Some(v) = read_env_string("ROUTE_PLUGIN_ADDRESS") {
        settings.plugin_address = v;
    }
    if let Some(v) = read_env_string("ROUTE_SINK_ADDRESS") {
        settings.sink_address = v;
    }
    if let Some(v) = read_env_parsed("ROUTE_TIMEOUT_MS", parse_timeout_ms) {
        settings.timeout_ms = v;
    }
    if let Some(v) = read_env_string("ROUTE_CLIENT_NAME") {
        settings.client_name = Some(v);
    }
    if let Some(v) = read_env_parsed("ROUTE_MAX_THREADS", |s| parse_usize_range(s, 1, 100_000)) {
        settings.max_threads = v;
    }
    if let Some(v) = read_env_parsed("ROUTE_MAX_CONNECT", |s| parse_u32_range(s, 1, u32::MAX)) {
        settings.max_connect = v;
    }
    if let Some(v) = read_env_parsed("ROUTE_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_timeout_ms(val: &str) -> Option<i64> {
    val.parse::<i64>().ok().filter(|n| *n >= -1)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_parsed<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let val = std::env::var(name).ok()?;
    let result = parse(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_file(contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("route-test-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults_match_plugin_flags() {
        let s = RouteSettings::default();
        assert_eq!(s.plugin_address, "localhost:3333");
        assert_eq!(s.sink_address, "localhost:3333");
        assert_eq!(s.timeout_ms, 60_000);
        assert_eq!(s.max_threads, 100);
        assert_eq!(s.max_connect, 10_000);
        assert_eq!(s.metrics, MetricsSettings { interval_secs: 10, cache: 3600, archive: 0 });
        assert!(s.validate().is_ok());
    }

    #[test]
    fn merge_nested_override() {
        let merged = deep_merge(
            serde_json::json!({"metrics": {"intervalSecs": 10, "cache": 3600}}),
            serde_json::json!({"metrics": {"cache": 60}}),
        );
        assert_eq!(merged["metrics"]["intervalSecs"], 10);
        assert_eq!(merged["metrics"]["cache"], 60);
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replaces() {
        let merged = deep_merge(serde_json::json!({"a": [1, 2]}), serde_json::json!({"a": [3]}));
        assert_eq!(merged["a"], serde_json::json!([3]));
    }

    #[test]
    fn load_file_overrides_defaults() {
        let path = temp_file(r#"{"sinkAddress": "remote:4444", "timeoutMs": -1, "metrics": {"archive": 5}}"#);
        let s = load_settings(Some(&path)).unwrap();
        assert_eq!(s.sink_address, "remote:4444");
        assert_eq!(s.timeout_ms, -1);
        assert_eq!(s.metrics.archive, 5);
        assert_eq!(s.metrics.cache, 3600);
        assert_eq!(s.max_threads, 100);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join(format!("route-missing-{}.json", uuid::Uuid::now_v7()));
        let s = load_settings(Some(&path)).unwrap();
        assert_eq!(s.timeout_ms, RouteSettings::default().timeout_ms);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let path = temp_file("{not json");
        assert!(matches!(load_settings(Some(&path)), Err(SettingsError::Json(_))));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut s = RouteSettings::default();
        s.timeout_ms = -2;
        assert!(s.validate().is_err());

        let mut s = RouteSettings::default();
        s.max_threads = 0;
        assert!(s.validate().is_err());

        let mut s = RouteSettings::default();
        s.sink_address.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn metrics_triplet_parsing() {
        assert_eq!(
            MetricsSettings::parse_triplet("5,100,2").unwrap(),
            MetricsSettings { interval_secs: 5, cache: 100, archive: 2 }
        );
        let partial = MetricsSettings::parse_triplet("30").unwrap();
        assert_eq!(partial.interval_secs, 30);
        assert_eq!(partial.cache, 3600);
        assert!(MetricsSettings::parse_triplet("1,x").is_err());
        assert!(MetricsSettings::parse_triplet("1,2,3,4").is_err());
        assert!(MetricsSettings::parse_triplet("1,,3").is_err());
    }

    #[test]
    fn value_parsers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_timeout_ms("-1"), Some(-1));
        assert_eq!(parse_timeout_ms("-5"), None);
        assert_eq!(parse_usize_range("0", 1, 10), None);
        assert_eq!(parse_usize_range("10", 1, 10), Some(10));
        assert_eq!(parse_u32_range("abc", 1, 10), None);
    }
}
