//! Prometheus exporter for Amplitude chart queries.
//!
//! This crate polls the Amplitude dashboard API for the trailing buckets of
//! configured charts, rebuilds a monotonic counter (or a gauge) per chart and
//! exposes the result via an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  Amplitude API  │────>│    Scheduler    │────>│    Registry     │────>│   HTTP Server   │
//! │ (chart queries) │     │ (fetch, apply)  │     │ (series state)  │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! Run the exporter binary with a configuration file:
//!
//! ```bash
//! amplitude-exporter --config config.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod descriptor;
pub mod exposition;
pub mod fetcher;
pub mod http;
pub mod logging;
pub mod registry;
pub mod scheduler;
pub mod state;

pub use config::ExporterConfig;
pub use descriptor::{SeriesDescriptor, SeriesKey, SeriesKind};
pub use fetcher::{Fetcher, HttpFetcher, Window};
pub use http::HttpServer;
pub use registry::{MetricRegistry, SharedRegistry};
pub use scheduler::{CycleReport, ScrapeScheduler};
pub use state::MetricState;
