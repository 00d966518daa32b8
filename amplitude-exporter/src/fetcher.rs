//! Amplitude chart queries.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::trace;

use crate::config::UpstreamConfig;
use crate::descriptor::SeriesKey;

/// Error type for chart queries.
///
/// Every variant names the series so a single log line is enough context.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{key}: request failed: {source}")]
    Request {
        key: SeriesKey,
        #[source]
        source: reqwest::Error,
    },
    #[error("{key}: no response within {timeout:?}")]
    Timeout { key: SeriesKey, timeout: Duration },
    #[error("{key}: upstream returned status {status}")]
    Status { key: SeriesKey, status: u16 },
    #[error("{key}: malformed response: {message}")]
    Decode { key: SeriesKey, message: String },
    #[error("{key}: window has {got} point(s), {needed} needed")]
    InsufficientPoints {
        key: SeriesKey,
        needed: usize,
        got: usize,
    },
}

impl FetchError {
    /// The series the failed query belonged to.
    pub fn key(&self) -> &SeriesKey {
        match self {
            FetchError::Request { key, .. }
            | FetchError::Timeout { key, .. }
            | FetchError::Status { key, .. }
            | FetchError::Decode { key, .. }
            | FetchError::InsufficientPoints { key, .. } => key,
        }
    }
}

/// One time bucket of a chart.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    /// Sortable bucket identifier, usually `YYYY-MM-DDTHH:MM:SS`.
    pub key: String,
    pub value: f64,
}

impl Bucket {
    pub fn new(key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Time-ascending buckets returned by one chart query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Window {
    buckets: Vec<Bucket>,
}

impl Window {
    pub fn new(buckets: Vec<Bucket>) -> Self {
        Self { buckets }
    }

    /// Build a window from `(key, value)` pairs.
    pub fn from_pairs<K: Into<String>>(pairs: impl IntoIterator<Item = (K, f64)>) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(key, value)| Bucket::new(key, value))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Newest bucket.
    pub fn last(&self) -> Option<&Bucket> {
        self.buckets.last()
    }

    /// The two newest buckets as `(previous, last)`.
    pub fn last_two(&self) -> Option<(&Bucket, &Bucket)> {
        match self.buckets.as_slice() {
            [.., prev, last] => Some((prev, last)),
            _ => None,
        }
    }
}

/// API credentials of a project.
#[derive(Clone)]
pub struct Credentials {
    pub api_id: String,
    pub api_key: String,
}

impl Credentials {
    pub fn new(api_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_id: api_id.into(),
            api_key: api_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_id", &self.api_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Everything needed to query one chart.
#[derive(Debug, Clone, Copy)]
pub struct ChartQuery<'a> {
    pub key: &'a SeriesKey,
    pub chart_id: &'a str,
    pub credentials: &'a Credentials,
}

/// Source of chart windows.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, query: &ChartQuery<'_>) -> Result<Window, FetchError>;
}

/// Chart query response body. Only the fields used for the window are kept.
#[derive(Debug, Deserialize)]
pub struct ChartResponse {
    pub data: ChartData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    #[serde(default)]
    pub x_values: Vec<String>,
    #[serde(default)]
    pub series: Vec<Vec<SeriesPoint>>,
}

#[derive(Debug, Deserialize)]
pub struct SeriesPoint {
    pub value: f64,
}

impl ChartResponse {
    /// Pair the x axis with the first series.
    pub fn into_window(self) -> Window {
        let Some(values) = self.data.series.into_iter().next() else {
            return Window::default();
        };

        Window::from_pairs(
            self.data
                .x_values
                .into_iter()
                .zip(values.into_iter().map(|p| p.value)),
        )
    }
}

/// Fetcher backed by the Amplitude dashboard REST API.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpFetcher {
    /// Build the client. Fails if the TLS backend cannot be initialized.
    pub fn new(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let timeout = config.timeout();
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn query_url(&self, chart_id: &str) -> String {
        format!("{}/{}/query", self.base_url, chart_id)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, query: &ChartQuery<'_>) -> Result<Window, FetchError> {
        let url = self.query_url(query.chart_id);
        trace!(series = %query.key, url = %url, "Querying chart");

        let response = self
            .client
            .get(&url)
            .basic_auth(
                &query.credentials.api_id,
                Some(&query.credentials.api_key),
            )
            .send()
            .await
            .map_err(|source| self.request_error(query.key, source))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                key: query.key.clone(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| self.request_error(query.key, source))?;

        let parsed: ChartResponse =
            serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
                key: query.key.clone(),
                message: e.to_string(),
            })?;

        Ok(parsed.into_window())
    }
}

impl HttpFetcher {
    fn request_error(&self, key: &SeriesKey, source: reqwest::Error) -> FetchError {
        if source.is_timeout() {
            FetchError::Timeout {
                key: key.clone(),
                timeout: self.timeout,
            }
        } else {
            FetchError::Request {
                key: key.clone(),
                source,
            }
        }
    }
}
