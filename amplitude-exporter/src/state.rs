//! Per-series reconstruction of exported values from upstream windows.
//!
//! Amplitude returns a sliding window of time buckets, and the value of the
//! newest bucket keeps growing until the bucket closes. Each poll hands the
//! two trailing buckets to [`MetricState`], which folds closed buckets into a
//! base total so that a counter never goes backwards between polls.
//!
//! ```text
//!   poll n:      [ .. | 10:00 = 3 | 10:05 = 5 ]     base = b, pending = 5
//!   poll n+1:         [ 10:05 = 7 | 10:10 = 1 ]     base = b + max(5, 7), pending = 1
//! ```

use parking_lot::RwLock;
use tracing::debug;

use crate::descriptor::SeriesKind;

/// How a counter update was reconciled with the previous state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The trailing bucket is the one already pending; its value was revised.
    Revised,
    /// The window moved forward by one bucket; the closed bucket was folded
    /// using the larger of the pending and the reported final value.
    Advanced,
    /// The previous bucket could not be correlated (first update or a gap);
    /// the pending value was folded as is.
    Gap,
}

/// Consistent view of a series.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    /// Exposed value.
    pub value: f64,
    /// Bucket the value belongs to, empty if never updated.
    pub bucket_key: String,
}

#[derive(Debug, Default)]
struct Inner {
    last_bucket_key: String,
    base_value: f64,
    pending_value: f64,
}

/// Mutable reconstruction state of one series.
#[derive(Debug)]
pub struct MetricState {
    kind: SeriesKind,
    inner: RwLock<Inner>,
}

impl MetricState {
    pub fn new(kind: SeriesKind) -> Self {
        Self {
            kind,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn kind(&self) -> SeriesKind {
        self.kind
    }

    /// Fold the two trailing buckets of a counter window.
    ///
    /// `last_*` is the newest (possibly still open) bucket, `prev_*` the one
    /// before it. Negative values are clamped to zero.
    pub fn update_counter(
        &self,
        last_key: &str,
        last_value: f64,
        prev_key: &str,
        prev_value: f64,
    ) -> Transition {
        let last_value = last_value.max(0.0);
        let prev_value = prev_value.max(0.0);

        let mut inner = self.inner.write();

        let transition = if inner.last_bucket_key == last_key {
            Transition::Revised
        } else if inner.last_bucket_key == prev_key {
            inner.base_value += inner.pending_value.max(prev_value);
            Transition::Advanced
        } else {
            if !inner.last_bucket_key.is_empty() {
                debug!(
                    from = %inner.last_bucket_key,
                    to = %last_key,
                    pending = inner.pending_value,
                    "Bucket gap, folding pending value"
                );
            }
            inner.base_value += inner.pending_value;
            Transition::Gap
        };

        if transition != Transition::Revised {
            inner.last_bucket_key = last_key.to_string();
        }
        inner.pending_value = last_value;

        transition
    }

    /// Overwrite the gauge with the newest bucket.
    pub fn set_gauge(&self, key: &str, value: f64) {
        let mut inner = self.inner.write();
        inner.last_bucket_key = key.to_string();
        inner.pending_value = value;
    }

    /// Current exposed value and the bucket it belongs to.
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.read();
        let value = match self.kind {
            SeriesKind::Counter => inner.base_value + inner.pending_value,
            SeriesKind::Gauge => inner.pending_value,
        };

        StateSnapshot {
            value,
            bucket_key: inner.last_bucket_key.clone(),
        }
    }

    /// Current exposed value.
    pub fn value(&self) -> f64 {
        self.snapshot().value
    }

    /// Forget everything, as if the series was just configured.
    pub fn reset(&self) {
        *self.inner.write() = Inner::default();
    }
}
