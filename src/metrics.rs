use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::ErrorCode;
use crate::response::Response;
use crate::util::{duration_to_millis, lock_unpoisoned};

#[derive(Clone, Debug)]
pub struct SessionMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub requests_cancelled: u64,
    pub invalid_requests: u64,
    pub renewals: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct SessionMetrics {
    inner: Arc<SessionMetricsInner>,
}

#[derive(Debug, Default)]
struct SessionMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    requests_cancelled: AtomicU64,
    invalid_requests: AtomicU64,
    renewals: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    metrics: SessionMetrics,
}

impl SessionMetrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_renewal(&self) {
        self.inner.renewals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response(&self, response: &Response) {
        self.record_latency(response.elapsed());
        if let Some(status) = response.status() {
            self.add_status_count(status.as_u16());
        }

        let Some(error) = response.error() else {
            self.inner
                .requests_succeeded
                .fetch_add(1, Ordering::Relaxed);
            return;
        };

        match error.code() {
            ErrorCode::UserCancelled => {
                self.inner
                    .requests_cancelled
                    .fetch_add(1, Ordering::Relaxed);
            }
            ErrorCode::InvalidRequest => {
                self.inner.invalid_requests.fetch_add(1, Ordering::Relaxed);
                self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.add_error_count(error.code().as_str());
    }

    pub(crate) fn snapshot(&self) -> SessionMetricsSnapshot {
        let latency_samples = self.inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = self.inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        SessionMetricsSnapshot {
            requests_started: self.inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: self.inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            requests_cancelled: self.inner.requests_cancelled.load(Ordering::Relaxed),
            invalid_requests: self.inner.invalid_requests.load(Ordering::Relaxed),
            renewals: self.inner.renewals.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&self.inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.inner
            .latency_total_ms
            .fetch_add(duration_to_millis(latency), Ordering::Relaxed);
    }

    fn add_status_count(&self, status: u16) {
        let mut status_counts = lock_unpoisoned(&self.inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, error_key: &str) {
        let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
        *error_counts.entry(error_key.to_owned()).or_insert(0) += 1;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
