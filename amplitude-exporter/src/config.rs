//! Configuration for the Amplitude exporter.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::descriptor::{SeriesKind, build_metric_name, sanitize_label_name};
use crate::http::{HEALTH_PATH, READY_PATH};
use crate::registry::HEALTH_FAMILIES;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Amplitude API settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Scrape scheduling settings.
    #[serde(default)]
    pub scrape: ScrapeConfig,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Projects and the charts queried for each of them.
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

/// Amplitude API endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the chart API (default: "https://amplitude.com/api/3/chart").
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout for a single chart query (seconds).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://amplitude.com/api/3/chart".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Scrape scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// How often every configured chart is queried (seconds).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

fn default_interval() -> u64 {
    60
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
        }
    }
}

impl ScrapeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Namespace prepended to every metric name (default: "amplitude").
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_namespace() -> String {
    "amplitude".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            namespace: default_namespace(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// An Amplitude project with its API credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name, part of every series key.
    pub name: String,

    /// API key id (basic auth user).
    pub api_id: String,

    /// API secret key (basic auth password).
    pub api_key: String,

    /// Charts exported for this project.
    #[serde(default)]
    pub charts: Vec<ChartConfig>,
}

/// A saved Amplitude chart exported as one series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartConfig {
    /// Chart id as shown in the Amplitude chart URL.
    pub id: String,

    /// Metric name.
    pub name: String,

    /// Optional subsystem between namespace and name.
    #[serde(default)]
    pub subsystem: String,

    /// HELP text.
    #[serde(default)]
    pub help: String,

    /// Series kind (default: counter).
    #[serde(default, rename = "type")]
    pub kind: SeriesKind,

    /// Variable label names.
    #[serde(default)]
    pub label_names: Vec<String>,

    /// Values for `label_names`, same order and length.
    #[serde(default)]
    pub label_values: Vec<String>,

    /// Constant labels attached to the series.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scrape.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "interval_secs must be > 0".to_string(),
            ));
        }

        if self.upstream.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeout_secs must be > 0".to_string(),
            ));
        }

        if self
            .prometheus
            .listen
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            )));
        }

        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if [HEALTH_PATH, READY_PATH].contains(&self.prometheus.path.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Metrics path {} is reserved",
                self.prometheus.path
            )));
        }

        self.validate_series()
    }

    /// Check that every chart yields a distinct, well-formed series.
    fn validate_series(&self) -> Result<(), ConfigError> {
        let namespace = &self.prometheus.namespace;
        let reserved: HashSet<String> = HEALTH_FAMILIES
            .iter()
            .map(|family| build_metric_name(namespace, "", family))
            .collect();

        // metric name -> (kind, sanitized label names)
        let mut schemas: HashMap<String, (SeriesKind, Vec<String>)> = HashMap::new();
        let mut keys = HashSet::new();
        let mut exposed = HashSet::new();

        for project in &self.projects {
            if project.name.is_empty() {
                return Err(ConfigError::Validation(
                    "Project name must not be empty".to_string(),
                ));
            }

            for chart in &project.charts {
                if chart.id.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "Project '{}' has a chart without id",
                        project.name
                    )));
                }

                if !keys.insert((project.name.as_str(), chart.id.as_str())) {
                    return Err(ConfigError::Validation(format!(
                        "Duplicate chart '{}' in project '{}'",
                        chart.id, project.name
                    )));
                }

                if chart.label_names.len() != chart.label_values.len() {
                    return Err(ConfigError::Validation(format!(
                        "Chart '{}/{}': {} label names but {} label values",
                        project.name,
                        chart.id,
                        chart.label_names.len(),
                        chart.label_values.len()
                    )));
                }

                // Compared as exposed, so "a-b" and "a_b" or a tag shadowing a label collide
                let label_names: Vec<String> = chart
                    .label_names
                    .iter()
                    .map(|n| sanitize_label_name(n))
                    .collect();
                let mut seen = HashSet::new();
                let duplicate = label_names
                    .iter()
                    .cloned()
                    .chain(chart.tags.keys().map(|k| sanitize_label_name(k)))
                    .find(|n| !seen.insert(n.clone()));
                if let Some(dup) = duplicate {
                    return Err(ConfigError::Validation(format!(
                        "Chart '{}/{}': label '{}' declared twice",
                        project.name, chart.id, dup
                    )));
                }

                let metric_name = build_metric_name(namespace, &chart.subsystem, &chart.name);

                if reserved.contains(&metric_name) {
                    return Err(ConfigError::Validation(format!(
                        "Chart '{}/{}': metric '{}' is reserved for exporter health",
                        project.name, chart.id, metric_name
                    )));
                }

                match schemas.get(&metric_name) {
                    Some((kind, names)) if *kind != chart.kind || *names != label_names => {
                        return Err(ConfigError::Validation(format!(
                            "Chart '{}/{}': metric '{}' is already declared with a different type or label set",
                            project.name, chart.id, metric_name
                        )));
                    }
                    Some(_) => {}
                    None => {
                        schemas.insert(metric_name.clone(), (chart.kind, label_names));
                    }
                }

                if !exposed.insert((metric_name.clone(), chart.label_values.clone())) {
                    return Err(ConfigError::Validation(format!(
                        "Chart '{}/{}': series {}{:?} is already exported by another chart",
                        project.name, chart.id, metric_name, chart.label_values
                    )));
                }
            }
        }

        Ok(())
    }

    /// Total number of configured charts.
    pub fn chart_count(&self) -> usize {
        self.projects.iter().map(|p| p.charts.len()).sum()
    }
}
