//! Registry of exported series and process health.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::config::{ConfigError, ExporterConfig};
use crate::descriptor::{SeriesDescriptor, SeriesKey, SeriesKind};
use crate::fetcher::{FetchError, Window};
use crate::state::{MetricState, Transition};

/// A configured series and its reconstruction state.
#[derive(Debug)]
pub struct Series {
    pub descriptor: SeriesDescriptor,
    pub state: MetricState,
}

impl Series {
    pub fn new(descriptor: SeriesDescriptor) -> Self {
        let state = MetricState::new(descriptor.kind);
        Self { descriptor, state }
    }

    /// Feed the trailing buckets of a window into the state.
    ///
    /// Gauges need one bucket, counters two.
    pub fn apply(&self, window: &Window) -> Result<Option<Transition>, FetchError> {
        match self.descriptor.kind {
            SeriesKind::Gauge => {
                let last = window.last().ok_or_else(|| self.insufficient(1, window))?;
                self.state.set_gauge(&last.key, last.value);
                Ok(None)
            }
            SeriesKind::Counter => {
                let (prev, last) = window
                    .last_two()
                    .ok_or_else(|| self.insufficient(2, window))?;
                let transition =
                    self.state
                        .update_counter(&last.key, last.value, &prev.key, prev.value);
                Ok(Some(transition))
            }
        }
    }

    fn insufficient(&self, needed: usize, window: &Window) -> FetchError {
        FetchError::InsufficientPoints {
            key: self.descriptor.key.clone(),
            needed,
            got: window.len(),
        }
    }
}

/// Metric families written for [`ScrapeHealth`], before the namespace prefix.
pub const HEALTH_FAMILIES: [&str; 4] = [
    "up",
    "exporter_scrapes_total",
    "exporter_fetch_errors_total",
    "exporter_last_scrape_duration_seconds",
];

/// Health of the scrape loop, written by the scheduler and read by exposition.
#[derive(Debug, Default)]
pub struct ScrapeHealth {
    up: AtomicBool,
    total_scrapes: AtomicU64,
    fetch_errors: AtomicU64,
    last_duration_ms: AtomicU64,
}

/// Point-in-time copy of [`ScrapeHealth`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSnapshot {
    /// Every fetch of the last cycle succeeded.
    pub up: bool,
    /// Completed scrape cycles.
    pub total_scrapes: u64,
    /// Failed fetches over all cycles.
    pub fetch_errors_total: u64,
    /// Wall time of the last cycle.
    pub last_scrape_duration: Duration,
}

impl ScrapeHealth {
    /// Record the outcome of a finished cycle.
    pub fn record_cycle(&self, failed: u64, duration: Duration) {
        self.up.store(failed == 0, Ordering::SeqCst);
        self.fetch_errors.fetch_add(failed, Ordering::SeqCst);
        self.last_duration_ms
            .store(duration.as_millis() as u64, Ordering::SeqCst);
        self.total_scrapes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            up: self.up.load(Ordering::SeqCst),
            total_scrapes: self.total_scrapes.load(Ordering::SeqCst),
            fetch_errors_total: self.fetch_errors.load(Ordering::SeqCst),
            last_scrape_duration: Duration::from_millis(
                self.last_duration_ms.load(Ordering::SeqCst),
            ),
        }
    }
}

/// All exported series, fixed at construction.
///
/// The set of series never changes; each [`MetricState`] carries its own
/// lock. The registry-wide `cycle` lock only orders whole scrape cycles
/// against whole exposition passes.
#[derive(Debug)]
pub struct MetricRegistry {
    namespace: String,
    /// Sorted by metric name, then label values.
    series: Vec<Series>,
    index: HashMap<SeriesKey, usize>,
    cycle: RwLock<()>,
    health: ScrapeHealth,
}

/// Create a shareable registry handle.
pub type SharedRegistry = Arc<MetricRegistry>;

impl MetricRegistry {
    /// Build a registry from descriptors. Keys must be unique.
    pub fn new(
        namespace: impl Into<String>,
        mut descriptors: Vec<SeriesDescriptor>,
    ) -> Result<Self, ConfigError> {
        descriptors.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.label_values.cmp(&b.label_values))
        });

        let mut index = HashMap::with_capacity(descriptors.len());
        for (i, descriptor) in descriptors.iter().enumerate() {
            if index.insert(descriptor.key.clone(), i).is_some() {
                return Err(ConfigError::Validation(format!(
                    "Duplicate series key: {}",
                    descriptor.key
                )));
            }
        }

        Ok(Self {
            namespace: namespace.into(),
            series: descriptors.into_iter().map(Series::new).collect(),
            index,
            cycle: RwLock::new(()),
            health: ScrapeHealth::default(),
        })
    }

    /// Build the registry for every chart of every project.
    pub fn from_config(config: &ExporterConfig) -> Result<Self, ConfigError> {
        let namespace = &config.prometheus.namespace;
        let descriptors = config
            .projects
            .iter()
            .flat_map(|project| {
                project
                    .charts
                    .iter()
                    .map(move |chart| SeriesDescriptor::from_chart(namespace, project, chart))
            })
            .collect();

        Self::new(namespace.clone(), descriptors)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get(&self, key: &SeriesKey) -> Option<&Series> {
        self.index.get(key).map(|&i| &self.series[i])
    }

    /// Series in exposition order.
    pub fn series(&self) -> &[Series] {
        &self.series
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn health(&self) -> &ScrapeHealth {
        &self.health
    }

    /// Reset one series. Returns false if the key is unknown.
    pub fn reset(&self, key: &SeriesKey) -> bool {
        match self.get(key) {
            Some(series) => {
                debug!(series = %key, "Resetting series state");
                series.state.reset();
                true
            }
            None => false,
        }
    }

    /// Exclusive guard held while a scrape cycle applies its windows.
    pub fn write_cycle(&self) -> RwLockWriteGuard<'_, ()> {
        self.cycle.write()
    }

    /// Shared guard held for one exposition pass.
    pub fn read_cycle(&self) -> RwLockReadGuard<'_, ()> {
        self.cycle.read()
    }
}
