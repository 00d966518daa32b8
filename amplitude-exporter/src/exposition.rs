//! Prometheus text exposition of the registry.

use std::fmt::Write;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::warn;

use crate::descriptor::{SeriesKey, SeriesKind, build_metric_name};
use crate::registry::{HEALTH_FAMILIES, MetricRegistry, Series};

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Error producing the sample of a single series.
#[derive(Debug, thiserror::Error)]
pub enum ExpositionError {
    #[error("{key}: {expected} label names but {got} label values")]
    LabelArity {
        key: SeriesKey,
        expected: usize,
        got: usize,
    },
}

/// Render every series plus the health metrics.
///
/// A series that cannot be encoded is logged and left out; the rest of the
/// output is unaffected.
pub fn render(registry: &MetricRegistry) -> String {
    let _cycle = registry.read_cycle();
    let mut output = String::with_capacity(registry.len() * 128 + 1024);

    let mut current_name: Option<&str> = None;
    for series in registry.series() {
        let descriptor = &series.descriptor;

        // Series are sorted by name, so HELP/TYPE go out once per family
        if current_name != Some(descriptor.name.as_str()) {
            writeln!(
                output,
                "# HELP {} {}",
                descriptor.name,
                escape_help(&descriptor.help)
            )
            .ok();
            writeln!(output, "# TYPE {} {}", descriptor.name, descriptor.kind).ok();
            current_name = Some(descriptor.name.as_str());
        }

        match encode_series(series) {
            Ok(line) => output.push_str(&line),
            Err(e) => {
                warn!(series = %descriptor.key, error = %e, "Skipping series in exposition");
            }
        }
    }

    render_health(registry, &mut output);
    output
}

/// Encode one sample line, with a timestamp for gauges.
pub fn encode_series(series: &Series) -> Result<String, ExpositionError> {
    let descriptor = &series.descriptor;
    let labels = descriptor
        .labels()
        .ok_or_else(|| ExpositionError::LabelArity {
            key: descriptor.key.clone(),
            expected: descriptor.label_names.len(),
            got: descriptor.label_values.len(),
        })?;

    let snapshot = series.state.snapshot();

    let timestamp = match descriptor.kind {
        SeriesKind::Counter => None,
        SeriesKind::Gauge if snapshot.bucket_key.is_empty() => None,
        SeriesKind::Gauge => {
            let parsed = parse_bucket_timestamp(&snapshot.bucket_key);
            if parsed.is_none() {
                warn!(
                    series = %descriptor.key,
                    bucket = %snapshot.bucket_key,
                    "Bucket key is not a timestamp, exposing gauge without one"
                );
            }
            parsed
        }
    };

    let mut line = format!(
        "{}{} {}",
        descriptor.name,
        format_labels(&labels),
        format_value(snapshot.value)
    );
    if let Some(ts) = timestamp {
        write!(line, " {}", ts).ok();
    }
    line.push('\n');

    Ok(line)
}

fn render_health(registry: &MetricRegistry, output: &mut String) {
    let health = registry.health().snapshot();
    let namespace = registry.namespace();

    let [up, scrapes, fetch_errors, duration] = HEALTH_FAMILIES;
    let families = [
        (
            up,
            "Was the last scrape of amplitude successful.",
            SeriesKind::Gauge,
            if health.up { 1.0 } else { 0.0 },
        ),
        (
            scrapes,
            "Current total Amplitude scrapes.",
            SeriesKind::Counter,
            health.total_scrapes as f64,
        ),
        (
            fetch_errors,
            "Chart queries that failed.",
            SeriesKind::Counter,
            health.fetch_errors_total as f64,
        ),
        (
            duration,
            "Duration of the last scrape cycle.",
            SeriesKind::Gauge,
            health.last_scrape_duration.as_secs_f64(),
        ),
    ];

    for (name, help, kind, value) in families {
        let name = build_metric_name(namespace, "", name);
        writeln!(output, "# HELP {} {}", name, help).ok();
        writeln!(output, "# TYPE {} {}", name, kind).ok();
        writeln!(output, "{} {}", name, format_value(value)).ok();
    }
}

/// Parse a bucket key into epoch milliseconds (UTC).
///
/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS`, `YYYY-MM-DD HH:MM:SS` and
/// `YYYY-MM-DD`.
pub fn parse_bucket_timestamp(key: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(key) {
        return Some(dt.timestamp_millis());
    }

    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(key, format) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }

    NaiveDate::parse_from_str(key, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// HELP text only escapes backslash and newline.
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Format labels for Prometheus exposition format.
fn format_labels(labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return String::new();
    }

    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}
