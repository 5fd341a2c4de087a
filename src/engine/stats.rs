// Live fetch statistics: outcome counters, rolling latency, per-entity request counts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::FetchError;

/// Latency samples kept for the rolling average.
const LATENCY_WINDOW: usize = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub entities: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub requests_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub upstream_captures: u64,
    pub retries: u64,
    pub avg_fetch_ms: Option<f64>,
    pub failures_by_class: BTreeMap<String, u64>,
    pub requests_by_entity: BTreeMap<String, u64>,
    pub active_pipelines: u64,
    pub cycles: u64,
    pub last_cycle: Option<CycleSummary>,
}

pub struct StatsCollector {
    requests_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    captures: AtomicU64,
    retries: AtomicU64,
    active_pipelines: AtomicU64,
    cycles: AtomicU64,
    latencies: Mutex<VecDeque<Duration>>,
    failures_by_class: Mutex<HashMap<&'static str, u64>>,
    requests_by_entity: Mutex<HashMap<String, u64>>,
    last_cycle: Mutex<Option<CycleSummary>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            captures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            active_pipelines: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            failures_by_class: Mutex::new(HashMap::new()),
            requests_by_entity: Mutex::new(HashMap::new()),
            last_cycle: Mutex::new(None),
        }
    }

    pub fn record_request(&self, entity: &str) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        *self
            .requests_by_entity
            .lock()
            .entry(entity.to_string())
            .or_insert(0) += 1;
    }

    /// `fetch_time` is `None` when the result came straight from cache.
    pub fn record_success(&self, fetch_time: Option<Duration>) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let Some(elapsed) = fetch_time else {
            return;
        };
        let mut latencies = self.latencies.lock();
        if latencies.len() == LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(elapsed);
    }

    pub fn record_failure(&self, err: &FetchError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self
            .failures_by_class
            .lock()
            .entry(err.root().class())
            .or_insert(0) += 1;
    }

    /// One call into the session provider.
    pub fn record_capture(&self) {
        self.captures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_pipelines(&self) {
        self.active_pipelines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_pipelines(&self) {
        self.active_pipelines.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_cycle(&self, summary: CycleSummary) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        *self.last_cycle.lock() = Some(summary);
    }

    pub fn avg_fetch_time(&self) -> Option<Duration> {
        let latencies = self.latencies.lock();
        if latencies.is_empty() {
            return None;
        }
        let total: Duration = latencies.iter().sum();
        Some(total / latencies.len() as u32)
    }

    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            upstream_captures: self.captures(),
            retries: self.retries.load(Ordering::Relaxed),
            avg_fetch_ms: self.avg_fetch_time().map(|d| d.as_secs_f64() * 1000.0),
            failures_by_class: self
                .failures_by_class
                .lock()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            requests_by_entity: self
                .requests_by_entity
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            active_pipelines: self.active_pipelines.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            last_cycle: self.last_cycle.lock().clone(),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
