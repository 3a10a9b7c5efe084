#![allow(missing_docs)]
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{probe::HealthSample, registry::ServiceId};

/// Summary statistics derived from the samples currently held for one service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub request_count: usize,
    pub error_count: usize,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Requests per second since the oldest sample still in the window.
    pub throughput: f64,
}

/// Totals across every service in the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub total_requests: usize,
    pub total_errors: usize,
    pub error_rate: f64,
    /// Mean of the per-service average latencies, over services that have samples.
    pub avg_latency_ms: f64,
    pub services_with_samples: usize,
}

/// Fixed-capacity FIFO sample buffers, one per service, each behind its own mutex.
///
/// The key set is fixed at construction; samples for unknown services are dropped.
#[derive(Debug)]
pub struct MetricsStore {
    capacity: usize,
    buffers: HashMap<ServiceId, Mutex<VecDeque<HealthSample>>>,
}

impl MetricsStore {
    pub fn new<I, S>(ids: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ServiceId>,
    {
        let capacity = capacity.max(1);
        let buffers = ids
            .into_iter()
            .map(|id| (id.into(), Mutex::new(VecDeque::with_capacity(capacity))))
            .collect();

        Self { capacity, buffers }
    }

    /// Appends a sample, evicting the oldest one once the buffer is full.
    pub fn record(&self, id: &str, sample: HealthSample) {
        let Some(buffer) = self.buffers.get(id) else {
            warn!("Dropping health sample for unregistered service '{id}'");
            return;
        };

        let mut samples = match buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Copies the samples currently held for `id`, oldest first.
    pub fn samples(&self, id: &str) -> Vec<HealthSample> {
        self.buffers
            .get(id)
            .map(|buffer| match buffer.lock() {
                Ok(guard) => guard.iter().cloned().collect(),
                Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
            })
            .unwrap_or_default()
    }

    /// Derives a snapshot for one service. Services without samples yield all zeros.
    pub fn snapshot(&self, id: &str) -> MetricsSnapshot {
        summarize(&self.samples(id))
    }

    /// Snapshots for every service, keyed by id.
    pub fn snapshots(&self) -> HashMap<ServiceId, MetricsSnapshot> {
        self.buffers
            .keys()
            .map(|id| (id.clone(), self.snapshot(id)))
            .collect()
    }

    pub fn global_snapshot(&self) -> AggregateSnapshot {
        aggregate(self.snapshots().values())
    }
}

/// Value at index `floor((count - 1) * percentile)` of an ascending slice.
pub fn percentile(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let last = sorted.len() - 1;
    let index = ((last as f64) * percentile.clamp(0.0, 1.0)).floor() as usize;
    sorted[index.min(last)]
}

fn summarize(samples: &[HealthSample]) -> MetricsSnapshot {
    if samples.is_empty() {
        return MetricsSnapshot::default();
    }

    let request_count = samples.len();
    let error_count = samples.iter().filter(|sample| !sample.is_healthy()).count();

    let mut latencies: Vec<f64> = samples.iter().map(|sample| sample.latency_ms).collect();
    latencies.sort_by(f64::total_cmp);
    let avg_latency_ms = latencies.iter().sum::<f64>() / request_count as f64;

    let throughput = samples
        .iter()
        .map(|sample| sample.timestamp)
        .min()
        .map(|first| (Utc::now() - first).num_milliseconds() as f64 / 1000.0)
        .filter(|elapsed| *elapsed > 0.0)
        .map(|elapsed| request_count as f64 / elapsed)
        .unwrap_or(0.0);

    MetricsSnapshot {
        request_count,
        error_count,
        error_rate: error_count as f64 / request_count as f64,
        avg_latency_ms,
        p50_latency_ms: percentile(&latencies, 0.50),
        p95_latency_ms: percentile(&latencies, 0.95),
        p99_latency_ms: percentile(&latencies, 0.99),
        throughput,
    }
}

fn aggregate<'a>(snapshots: impl Iterator<Item = &'a MetricsSnapshot>) -> AggregateSnapshot {
    let mut total = AggregateSnapshot::default();
    let mut latency_sum = 0.0;

    for snapshot in snapshots.filter(|snapshot| snapshot.request_count > 0) {
        total.total_requests += snapshot.request_count;
        total.total_errors += snapshot.error_count;
        total.services_with_samples += 1;
        latency_sum += snapshot.avg_latency_ms;
    }

    if total.total_requests > 0 {
        total.error_rate = total.total_errors as f64 / total.total_requests as f64;
    }
    if total.services_with_samples > 0 {
        total.avg_latency_ms = latency_sum / total.services_with_samples as f64;
    }
    total
}
