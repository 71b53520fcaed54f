//! Metrics collection utilities.
//!
//! Aggregated global and per-category statistics with latency percentiles,
//! exposed to callers as cheap snapshots.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::retry::ErrorKind;

/// Aggregated metrics across all categories.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_requests: 0,
            successes: 0,
            failures: 0,
            retries: 0,
            average_latency: None,
            p95_latency: None,
        }
    }
}

/// Category-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct CategoryStats {
    pub category: String,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub failures_by_kind: HashMap<&'static str, u64>,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub last_status: Option<u16>,
}

impl CategoryStats {
    fn from_accumulator(category: &str, acc: &CategoryAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        Self {
            category: category.to_string(),
            total_requests: acc.total_requests,
            successes: acc.successes,
            failures: acc.failures,
            failures_by_kind: acc.failures_by_kind.clone(),
            average_latency: avg,
            p95_latency: p95,
            last_status: acc.last_status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub categories: Vec<CategoryStats>,
}

#[derive(Debug)]
struct CategoryAccumulator {
    total_requests: u64,
    successes: u64,
    failures: u64,
    failures_by_kind: HashMap<&'static str, u64>,
    latencies: VecDeque<Duration>,
    max_window: usize,
    last_status: Option<u16>,
}

impl CategoryAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            total_requests: 0,
            successes: 0,
            failures: 0,
            failures_by_kind: HashMap::new(),
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            last_status: None,
        }
    }

    fn record(&mut self, status: Option<u16>, kind: Option<ErrorKind>, latency: Duration) {
        self.total_requests += 1;
        if let Some(status) = status {
            self.last_status = Some(status);
        }

        match kind {
            None => self.successes += 1,
            Some(kind) => {
                self.failures += 1;
                *self.failures_by_kind.entry(kind.as_str()).or_insert(0) += 1;
            }
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        let p95 = samples[p95_index];
        (Some(Duration::from_secs_f64(avg)), Some(p95))
    }
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    categories: HashMap<String, CategoryAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            categories: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, category: &str) -> &mut CategoryAccumulator {
        self.categories
            .entry(category.to_string())
            .or_insert_with(|| CategoryAccumulator::new(self.max_window))
    }
}

/// Thread-safe metrics collector shared by the session and its handlers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(128))),
        }
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    /// `kind = None` marks a success.
    pub fn record_outcome(
        &self,
        category: &str,
        status: Option<u16>,
        kind: Option<ErrorKind>,
        latency: Duration,
    ) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.total_requests += 1;
        if kind.is_none() {
            guard.global.successes += 1;
        } else {
            guard.global.failures += 1;
        }

        if let Some(avg) = guard.global.average_latency {
            let blended = (avg.as_secs_f64() * 0.9) + (latency.as_secs_f64() * 0.1);
            guard.global.average_latency = Some(Duration::from_secs_f64(blended));
        } else {
            guard.global.average_latency = Some(latency);
        }

        let acc = guard.accumulator_mut(category);
        acc.record(status, kind, latency);

        let mut percentile_samples: Vec<_> = guard
            .categories
            .values()
            .flat_map(|acc| acc.latencies.iter())
            .cloned()
            .collect();
        percentile_samples.sort_unstable();
        if !percentile_samples.is_empty() {
            let idx = ((percentile_samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
            guard.global.p95_latency = Some(percentile_samples[idx]);
        }
    }

    pub fn record_retry(&self) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.retries += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.inner.lock().expect("metrics lock poisoned");
        let categories = guard
            .categories
            .iter()
            .map(|(category, acc)| CategoryStats::from_accumulator(category, acc))
            .collect();
        MetricsSnapshot {
            global: guard.global.clone(),
            categories,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_success_and_failure() {
        let metrics = MetricsCollector::new();
        metrics.record_outcome("read", Some(200), None, Duration::from_millis(150));
        metrics.record_outcome(
            "read",
            Some(429),
            Some(ErrorKind::RateLimited),
            Duration::from_millis(800),
        );
        metrics.record_outcome("read", None, Some(ErrorKind::NetworkError), Duration::ZERO);

        let snapshot = metrics.snapshot();
        let category = snapshot
            .categories
            .iter()
            .find(|c| c.category == "read")
            .unwrap();
        assert_eq!(category.total_requests, 3);
        assert_eq!(category.successes, 1);
        assert_eq!(category.failures, 2);
        assert_eq!(category.failures_by_kind.get("rate_limited"), Some(&1));
        assert_eq!(snapshot.global.failures, 2);
    }

    #[test]
    fn categories_accumulate_independently() {
        let metrics = MetricsCollector::new();
        metrics.record_outcome("read", Some(200), None, Duration::from_millis(100));
        metrics.record_outcome("write", Some(200), None, Duration::from_millis(100));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.categories.len(), 2);
        assert_eq!(snapshot.global.total_requests, 2);
    }
}
