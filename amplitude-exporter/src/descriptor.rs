//! Static description of the exported series.
//!
//! A [`SeriesDescriptor`] is built once per configured chart and never changes
//! afterwards. Metric and label names are sanitized here so the exposition
//! layer can write them verbatim.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{ChartConfig, ProjectConfig};

/// How upstream windows are turned into an exposed value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesKind {
    /// Accumulated across buckets, never decreases.
    #[default]
    Counter,
    /// Latest bucket value, exposed with the bucket timestamp.
    Gauge,
}

impl SeriesKind {
    /// Get the TYPE comment string for Prometheus exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesKind::Counter => "counter",
            SeriesKind::Gauge => "gauge",
        }
    }
}

impl fmt::Display for SeriesKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a series: one chart of one project.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub project: String,
    pub chart: String,
}

impl SeriesKey {
    pub fn new(project: impl Into<String>, chart: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            chart: chart.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.chart)
    }
}

/// Immutable metadata for one exported series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesDescriptor {
    /// Unique key (project/chart).
    pub key: SeriesKey,
    /// Upstream chart id queried for this series.
    pub chart_id: String,
    /// Counter or gauge.
    pub kind: SeriesKind,
    /// Full Prometheus metric name.
    pub name: String,
    /// HELP text.
    pub help: String,
    /// Sanitized variable label names.
    pub label_names: Vec<String>,
    /// Label values, same arity as `label_names`.
    pub label_values: Vec<String>,
    /// Constant labels, sorted by name.
    pub const_labels: Vec<(String, String)>,
}

impl SeriesDescriptor {
    /// Build the descriptor for a configured chart.
    pub fn from_chart(namespace: &str, project: &ProjectConfig, chart: &ChartConfig) -> Self {
        let help = if chart.help.is_empty() {
            format!("Amplitude chart {}", chart.id)
        } else {
            chart.help.clone()
        };

        // BTreeMap iteration keeps them sorted
        let const_labels = chart
            .tags
            .iter()
            .map(|(k, v)| (sanitize_label_name(k), v.clone()))
            .collect();

        Self {
            key: SeriesKey::new(&project.name, &chart.id),
            chart_id: chart.id.clone(),
            kind: chart.kind,
            name: build_metric_name(namespace, &chart.subsystem, &chart.name),
            help,
            label_names: chart
                .label_names
                .iter()
                .map(|n| sanitize_label_name(n))
                .collect(),
            label_values: chart.label_values.clone(),
            const_labels,
        }
    }

    /// All label pairs in exposition order: variable labels, then constant ones.
    ///
    /// Returns `None` when names and values disagree in length.
    pub fn labels(&self) -> Option<Vec<(&str, &str)>> {
        if self.label_names.len() != self.label_values.len() {
            return None;
        }

        let labels = self
            .label_names
            .iter()
            .zip(&self.label_values)
            .chain(self.const_labels.iter().map(|(k, v)| (k, v)))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        Some(labels)
    }
}

/// Sanitize a metric name to be Prometheus-compatible.
///
/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
/// This function:
/// - Replaces invalid characters with underscores
/// - Ensures the name starts with a letter or underscore
/// - Collapses multiple underscores into one
pub fn sanitize_metric_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 1);
    let mut last_was_underscore = false;
    let mut chars = name.chars().peekable();

    // A leading digit is kept behind an underscore
    if let Some(&first) = chars.peek()
        && first.is_ascii_digit()
    {
        result.push('_');
        last_was_underscore = true;
    }

    for c in chars {
        let is_valid_char = c.is_ascii_alphanumeric() || c == '_' || c == ':';

        if is_valid_char {
            if c == '_' {
                if !last_was_underscore {
                    result.push(c);
                    last_was_underscore = true;
                }
            } else {
                result.push(c);
                last_was_underscore = false;
            }
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    if result.is_empty() {
        result.push_str("unnamed");
    }

    result
}

/// Sanitize a label name to be Prometheus-compatible.
///
/// Prometheus label names must match `[a-zA-Z_][a-zA-Z0-9_]*`.
/// Labels starting with `__` are reserved for internal use.
pub fn sanitize_label_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 1);

    // Same leading-digit rule as metric names: keep the digit behind an underscore
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        result.push('_');
    }
    let mut last_was_underscore = !result.is_empty();

    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            result.push(c);
            last_was_underscore = c == '_';
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    if result.is_empty() {
        return "label".to_string();
    }

    if result.starts_with("__") {
        result.insert(0, 'z');
    }

    result
}

/// Build a full Prometheus metric name from components.
///
/// Format: `{namespace}_{subsystem}_{name}`, empty components are skipped.
pub fn build_metric_name(namespace: &str, subsystem: &str, name: &str) -> String {
    let joined = [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_");

    sanitize_metric_name(&joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn chart(id: &str) -> ChartConfig {
        ChartConfig {
            id: id.to_string(),
            name: "signups".to_string(),
            subsystem: "users".to_string(),
            help: String::new(),
            kind: SeriesKind::Gauge,
            label_names: vec!["platform-name".to_string()],
            label_values: vec!["ios".to_string()],
            tags: BTreeMap::from([
                ("team".to_string(), "growth".to_string()),
                ("env".to_string(), "prod".to_string()),
            ]),
        }
    }

    fn project() -> ProjectConfig {
        ProjectConfig {
            name: "mobile".to_string(),
            api_id: "id".to_string(),
            api_key: "key".to_string(),
            charts: vec![],
        }
    }

    #[test]
    fn test_descriptor_from_chart() {
        let desc = SeriesDescriptor::from_chart("amplitude", &project(), &chart("x1y2"));

        assert_eq!(desc.key, SeriesKey::new("mobile", "x1y2"));
        assert_eq!(desc.key.to_string(), "mobile/x1y2");
        assert_eq!(desc.name, "amplitude_users_signups");
        assert_eq!(desc.kind, SeriesKind::Gauge);
        assert_eq!(desc.help, "Amplitude chart x1y2");
        assert_eq!(desc.label_names, vec!["platform_name"]);
        assert_eq!(
            desc.const_labels,
            vec![
                ("env".to_string(), "prod".to_string()),
                ("team".to_string(), "growth".to_string()),
            ]
        );
    }

    #[test]
    fn test_descriptor_labels_order() {
        let desc = SeriesDescriptor::from_chart("amplitude", &project(), &chart("c"));

        assert_eq!(
            desc.labels().unwrap(),
            vec![
                ("platform_name", "ios"),
                ("env", "prod"),
                ("team", "growth")
            ]
        );
    }

    #[test]
    fn test_descriptor_labels_arity_mismatch() {
        let mut desc = SeriesDescriptor::from_chart("amplitude", &project(), &chart("c"));
        desc.label_values.push("extra".to_string());

        assert!(desc.labels().is_none());
    }

    #[test]
    fn test_series_kind_as_str() {
        assert_eq!(SeriesKind::Counter.as_str(), "counter");
        assert_eq!(SeriesKind::Gauge.to_string(), "gauge");
        assert_eq!(SeriesKind::default(), SeriesKind::Counter);
    }

    #[test]
    fn test_build_metric_name() {
        assert_eq!(
            build_metric_name("amplitude", "users", "signups"),
            "amplitude_users_signups"
        );
        assert_eq!(
            build_metric_name("amplitude", "", "daily-active"),
            "amplitude_daily_active"
        );
        assert_eq!(build_metric_name("", "", "events"), "events");
    }

    #[test]
    fn test_sanitize_metric_name_special_chars() {
        assert_eq!(sanitize_metric_name("cpu.usage%"), "cpu_usage");
        assert_eq!(sanitize_metric_name("memory-used"), "memory_used");
        assert_eq!(sanitize_metric_name("cpu___usage"), "cpu_usage");
    }

    #[test]
    fn test_sanitize_metric_name_leading_number() {
        assert_eq!(sanitize_metric_name("7day_retention"), "_7day_retention");
    }

    #[test]
    fn test_sanitize_metric_name_empty() {
        assert_eq!(sanitize_metric_name(""), "unnamed");
        assert_eq!(sanitize_metric_name("///"), "unnamed");
    }

    #[test]
    fn test_sanitize_metric_name_colons() {
        assert_eq!(sanitize_metric_name("foo:bar"), "foo:bar");
    }

    #[test]
    fn test_sanitize_label_name() {
        assert_eq!(sanitize_label_name("platform"), "platform");
        assert_eq!(sanitize_label_name("device-id"), "device_id");
        assert_eq!(sanitize_label_name("1st"), "_1st");
        assert_eq!(sanitize_label_name("9-lives"), "_9_lives");
        assert_eq!(sanitize_label_name("__meta"), "z__meta");
        assert_eq!(sanitize_label_name(""), "label");
    }
}
