//! Periodic scraping of every configured chart.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ExporterConfig;
use crate::descriptor::SeriesKey;
use crate::fetcher::{ChartQuery, Credentials, FetchError, Fetcher, Window};
use crate::registry::SharedRegistry;

/// A chart to query on every cycle.
#[derive(Debug, Clone)]
pub struct ScrapeTarget {
    pub key: SeriesKey,
    pub chart_id: String,
    pub credentials: Arc<Credentials>,
}

impl ScrapeTarget {
    /// One target per chart, sharing the project credentials.
    pub fn from_config(config: &ExporterConfig) -> Vec<Self> {
        config
            .projects
            .iter()
            .flat_map(|project| {
                let credentials = Arc::new(Credentials::new(&project.api_id, &project.api_key));
                project.charts.iter().map(move |chart| ScrapeTarget {
                    key: SeriesKey::new(&project.name, &chart.id),
                    chart_id: chart.id.clone(),
                    credentials: credentials.clone(),
                })
            })
            .collect()
    }
}

/// Outcome of one scrape cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// Drives scrape cycles on a fixed interval.
pub struct ScrapeScheduler {
    registry: SharedRegistry,
    fetcher: Arc<dyn Fetcher>,
    targets: Vec<ScrapeTarget>,
    interval: Duration,
    timeout: Duration,
}

impl ScrapeScheduler {
    pub fn new(
        registry: SharedRegistry,
        fetcher: Arc<dyn Fetcher>,
        targets: Vec<ScrapeTarget>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        let targets = targets
            .into_iter()
            .filter(|target| {
                let known = registry.get(&target.key).is_some();
                if !known {
                    warn!(series = %target.key, "No registered series for chart, not scraping it");
                }
                known
            })
            .collect();

        Self {
            registry,
            fetcher,
            targets,
            interval,
            timeout,
        }
    }

    /// Scheduler for every chart of the configuration.
    pub fn from_config(
        config: &ExporterConfig,
        registry: SharedRegistry,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self::new(
            registry,
            fetcher,
            ScrapeTarget::from_config(config),
            config.scrape.interval(),
            config.upstream.timeout(),
        )
    }

    pub fn targets(&self) -> &[ScrapeTarget] {
        &self.targets
    }

    /// Run cycles until the shutdown signal is received.
    ///
    /// The first cycle starts one full interval after this is called. A
    /// cycle interrupted by shutdown applies none of its results.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            charts = self.targets.len(),
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "Starting scrape scheduler"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = self.run_cycle() => {}
                        _ = wait_for_shutdown(&mut shutdown) => {
                            info!("Shutdown during scrape cycle, dropping its results");
                            break;
                        }
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        info!("Scrape scheduler stopped");
    }

    /// Query every chart once and apply the windows.
    ///
    /// Fetches run one after another without any lock held; the windows are
    /// then applied together under the registry cycle lock. A failed chart is
    /// skipped and marks the cycle unhealthy.
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();

        let mut results = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let result = self.fetch(target).await;
            results.push((target, result));
        }

        let mut report = CycleReport::default();
        {
            let _cycle = self.registry.write_cycle();
            for (target, result) in results {
                match result.and_then(|window| self.apply(target, &window)) {
                    Ok(()) => report.succeeded += 1,
                    Err(e) => {
                        warn!(series = %target.key, error = %e, "Chart scrape failed");
                        report.failed += 1;
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        self.registry
            .health()
            .record_cycle(report.failed as u64, elapsed);

        debug!(
            succeeded = report.succeeded,
            failed = report.failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Scrape cycle finished"
        );

        report
    }

    async fn fetch(&self, target: &ScrapeTarget) -> Result<Window, FetchError> {
        let query = ChartQuery {
            key: &target.key,
            chart_id: &target.chart_id,
            credentials: target.credentials.as_ref(),
        };

        match tokio::time::timeout(self.timeout, self.fetcher.fetch(&query)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                key: target.key.clone(),
                timeout: self.timeout,
            }),
        }
    }

    fn apply(&self, target: &ScrapeTarget, window: &Window) -> Result<(), FetchError> {
        let Some(series) = self.registry.get(&target.key) else {
            return Ok(());
        };

        let transition = series.apply(window)?;
        let snapshot = series.state.snapshot();
        debug!(
            series = %target.key,
            bucket = %snapshot.bucket_key,
            value = snapshot.value,
            transition = ?transition,
            "Series updated"
        );

        Ok(())
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::SeriesKind;
    use crate::registry::MetricRegistry;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves queued windows per chart id; `None` answers with a 500.
    #[derive(Default)]
    struct MockFetcher {
        responses: Mutex<HashMap<String, VecDeque<Option<Window>>>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        fn push(&self, chart: &str, window: Option<Window>) {
            self.responses
                .lock()
                .entry(chart.to_string())
                .or_default()
                .push_back(window);
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, query: &ChartQuery<'_>) -> Result<Window, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let next = self
                .responses
                .lock()
                .get_mut(query.chart_id)
                .and_then(|queue| queue.pop_front());

            match next {
                Some(Some(window)) => Ok(window),
                _ => Err(FetchError::Status {
                    key: query.key.clone(),
                    status: 500,
                }),
            }
        }
    }

    const CONFIG: &str = r#"{
        scrape: { interval_secs: 60 },
        upstream: { timeout_secs: 1 },
        projects: [
            { name: "web", api_id: "i", api_key: "k",
              charts: [
                  { id: "signups", name: "signups" },
                  { id: "purchases", name: "purchases" },
                  { id: "active", name: "active", type: "gauge" }
              ] }
        ]
    }"#;

    fn setup(fetcher: Arc<MockFetcher>) -> (SharedRegistry, ScrapeScheduler) {
        let config = ExporterConfig::parse(CONFIG).unwrap();
        let registry = Arc::new(MetricRegistry::from_config(&config).unwrap());
        let scheduler = ScrapeScheduler::from_config(&config, registry.clone(), fetcher);
        (registry, scheduler)
    }

    fn value(registry: &SharedRegistry, chart: &str) -> f64 {
        registry
            .get(&SeriesKey::new("web", chart))
            .unwrap()
            .state
            .value()
    }

    #[test]
    fn test_targets_from_config() {
        let config = ExporterConfig::parse(CONFIG).unwrap();
        let targets = ScrapeTarget::from_config(&config);

        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].key, SeriesKey::new("web", "signups"));
        assert_eq!(targets[0].credentials.api_id, "i");
        assert!(Arc::ptr_eq(&targets[0].credentials, &targets[2].credentials));
    }

    #[test]
    fn test_unknown_targets_dropped() {
        let registry = Arc::new(MetricRegistry::new("amplitude", vec![]).unwrap());
        let scheduler = ScrapeScheduler::new(
            registry,
            Arc::new(MockFetcher::default()),
            vec![ScrapeTarget {
                key: SeriesKey::new("web", "x"),
                chart_id: "x".to_string(),
                credentials: Arc::new(Credentials::new("i", "k")),
            }],
            Duration::from_secs(60),
            Duration::from_secs(1),
        );

        assert!(scheduler.targets().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_all_succeed() {
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.push(
            "signups",
            Some(Window::from_pairs([("10:00", 3.0), ("10:05", 5.0)])),
        );
        fetcher.push(
            "purchases",
            Some(Window::from_pairs([("10:00", 1.0), ("10:05", 2.0)])),
        );
        fetcher.push("active", Some(Window::from_pairs([("10:05", 40.0)])));

        let (registry, scheduler) = setup(fetcher);
        let report = scheduler.run_cycle().await;

        assert_eq!(
            report,
            CycleReport {
                succeeded: 3,
                failed: 0
            }
        );
        assert_eq!(value(&registry, "signups"), 5.0);
        assert_eq!(value(&registry, "purchases"), 2.0);
        assert_eq!(value(&registry, "active"), 40.0);

        let health = registry.health().snapshot();
        assert!(health.up);
        assert_eq!(health.total_scrapes, 1);
    }

    #[tokio::test]
    async fn test_cycle_partial_failure() {
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.push(
            "signups",
            Some(Window::from_pairs([("10:00", 3.0), ("10:05", 5.0)])),
        );
        fetcher.push("purchases", None);
        fetcher.push("active", Some(Window::from_pairs([("10:05", 40.0)])));

        let (registry, scheduler) = setup(fetcher);
        let report = scheduler.run_cycle().await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(value(&registry, "signups"), 5.0);
        assert_eq!(value(&registry, "purchases"), 0.0);
        assert_eq!(value(&registry, "active"), 40.0);

        let health = registry.health().snapshot();
        assert!(!health.up);
        assert_eq!(health.total_scrapes, 1);
        assert_eq!(health.fetch_errors_total, 1);
    }

    #[tokio::test]
    async fn test_health_recovers_on_next_cycle() {
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.push("signups", None);
        for window in [
            Window::from_pairs([("10:00", 3.0), ("10:05", 5.0)]),
            Window::from_pairs([("10:05", 6.0), ("10:10", 1.0)]),
        ] {
            fetcher.push("purchases", Some(window));
        }
        fetcher.push(
            "signups",
            Some(Window::from_pairs([("10:05", 6.0), ("10:10", 1.0)])),
        );
        fetcher.push("active", Some(Window::from_pairs([("10:05", 1.0)])));
        fetcher.push("active", Some(Window::from_pairs([("10:10", 2.0)])));

        let (registry, scheduler) = setup(fetcher);

        scheduler.run_cycle().await;
        assert!(!registry.health().snapshot().up);

        scheduler.run_cycle().await;
        let health = registry.health().snapshot();
        assert!(health.up);
        assert_eq!(health.total_scrapes, 2);

        // purchases advanced one bucket: max(5, 6) + 1
        assert_eq!(value(&registry, "purchases"), 7.0);
        assert_eq!(value(&registry, "signups"), 1.0);
        assert_eq!(value(&registry, "active"), 2.0);
    }

    #[tokio::test]
    async fn test_counter_with_single_point_fails() {
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.push("signups", Some(Window::from_pairs([("10:05", 5.0)])));
        fetcher.push("purchases", Some(Window::default()));
        fetcher.push("active", Some(Window::default()));

        let (registry, scheduler) = setup(fetcher);
        let report = scheduler.run_cycle().await;

        assert_eq!(report.failed, 3);
        assert_eq!(value(&registry, "signups"), 0.0);
        assert_eq!(
            registry
                .get(&SeriesKey::new("web", "active"))
                .unwrap()
                .descriptor
                .kind,
            SeriesKind::Gauge
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout() {
        let fetcher = Arc::new(MockFetcher {
            delay: Duration::from_secs(5),
            ..Default::default()
        });
        fetcher.push(
            "signups",
            Some(Window::from_pairs([("10:00", 3.0), ("10:05", 5.0)])),
        );

        let (registry, scheduler) = setup(fetcher);
        let report = scheduler.run_cycle().await;

        assert_eq!(report.failed, 3);
        assert_eq!(value(&registry, "signups"), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_cycle_after_one_interval() {
        let fetcher = Arc::new(MockFetcher::default());
        let (registry, scheduler) = setup(fetcher.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.health().snapshot().total_scrapes, 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(registry.health().snapshot().total_scrapes, 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.health().snapshot().total_scrapes, 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_cycle_drops_results() {
        let fetcher = Arc::new(MockFetcher {
            delay: Duration::from_millis(800),
            ..Default::default()
        });
        fetcher.push(
            "signups",
            Some(Window::from_pairs([("10:00", 3.0), ("10:05", 5.0)])),
        );

        let (registry, scheduler) = setup(fetcher.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        // First cycle starts at 60s; stop while the second fetch is in flight
        tokio::time::sleep(Duration::from_millis(61_000)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(registry.health().snapshot().total_scrapes, 0);
        assert_eq!(value(&registry, "signups"), 0.0);
    }
}
