// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//!
//! Rolling request and attempt window for the performance data service.
//!
//! Keeps the most recent request samples and fetch attempts in fixed-size
//! ring buffers. Success rate, p95 latency and usage counters are computed
//! from the window on demand. Cancelled requests are counted separately and
//! never lower the success rate.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::ErrorKind;
use crate::model::{DataSource, SortField};
use crate::retry::FetchAttemptResult;

/// Final outcome of a service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestOutcome {
    Success,
    Error,
    Cancelled,
}

/// One completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSample {
    pub operation: String,
    pub recorded_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub outcome: RequestOutcome,
    pub error_kind: Option<ErrorKind>,
    pub source: Option<DataSource>,
    pub sort_by: Option<SortField>,
    pub from_cache: bool,
}

/// Figures derived from the current window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub total_requests: usize,
    pub successes: usize,
    pub errors: usize,
    pub cancelled: usize,
    /// Successes over successes plus errors; `None` with no such requests.
    pub success_rate: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub source_usage: BTreeMap<DataSource, u64>,
    pub sort_usage: BTreeMap<SortField, u64>,
    pub cache_hits: usize,
    pub recent_attempts: Vec<FetchAttemptResult>,
}

#[derive(Default)]
struct Window {
    requests: VecDeque<RequestSample>,
    attempts: VecDeque<FetchAttemptResult>,
}

/// Bounded observability window.
pub struct Observability {
    capacity: usize,
    window: Mutex<Window>,
}

impl Observability {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            window: Mutex::new(Window::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record_request(&self, sample: RequestSample) {
        debug!(
            operation = %sample.operation,
            outcome = ?sample.outcome,
            duration_ms = sample.duration_ms,
            source = ?sample.source,
            "Request recorded"
        );
        let mut window = self.window.lock();
        if window.requests.len() >= self.capacity {
            window.requests.pop_front();
        }
        window.requests.push_back(sample);
    }

    pub fn record_attempt(&self, attempt: FetchAttemptResult) {
        let mut window = self.window.lock();
        if window.attempts.len() >= self.capacity {
            window.attempts.pop_front();
        }
        window.attempts.push_back(attempt);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        let window = self.window.lock();

        let mut successes = 0;
        let mut errors = 0;
        let mut cancelled = 0;
        let mut cache_hits = 0;
        let mut source_usage = BTreeMap::new();
        let mut sort_usage = BTreeMap::new();
        let mut latencies = Vec::with_capacity(window.requests.len());

        for sample in &window.requests {
            match sample.outcome {
                RequestOutcome::Success => successes += 1,
                RequestOutcome::Error => errors += 1,
                RequestOutcome::Cancelled => cancelled += 1,
            }
            if sample.from_cache {
                cache_hits += 1;
            }
            if let Some(source) = sample.source {
                *source_usage.entry(source).or_insert(0) += 1;
            }
            if let Some(sort) = sample.sort_by {
                *sort_usage.entry(sort).or_insert(0) += 1;
            }
            latencies.push(sample.duration_ms);
        }

        let decided = successes + errors;
        let success_rate = if decided > 0 {
            Some(successes as f64 / decided as f64)
        } else {
            None
        };

        ObservabilitySnapshot {
            total_requests: window.requests.len(),
            successes,
            errors,
            cancelled,
            success_rate,
            p95_latency_ms: percentile(&mut latencies, 95.0),
            source_usage,
            sort_usage,
            cache_hits,
            recent_attempts: window.attempts.iter().cloned().collect(),
        }
    }

    pub fn clear(&self) {
        let mut window = self.window.lock();
        window.requests.clear();
        window.attempts.clear();
    }
}

/// Nearest-rank percentile.
fn percentile(values: &mut [f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((pct / 100.0) * values.len() as f64).ceil() as usize;
    let index = rank.clamp(1, values.len()) - 1;
    Some(values[index])
}

/// Records one request sample when dropped.
///
/// Created at the start of a request; the outcome defaults to an error so
/// that an early return or a dropped future is still recorded.
pub struct RequestRecorder {
    observability: Arc<Observability>,
    operation: &'static str,
    started: Instant,
    outcome: RequestOutcome,
    error_kind: Option<ErrorKind>,
    source: Option<DataSource>,
    sort_by: Option<SortField>,
    from_cache: bool,
}

impl RequestRecorder {
    pub fn start(observability: Arc<Observability>, operation: &'static str) -> Self {
        Self {
            observability,
            operation,
            started: Instant::now(),
            outcome: RequestOutcome::Error,
            error_kind: None,
            source: None,
            sort_by: None,
            from_cache: false,
        }
    }

    pub fn sort_by(&mut self, sort: SortField) {
        self.sort_by = Some(sort);
    }

    pub fn source(&mut self, source: DataSource) {
        self.source = Some(source);
    }

    pub fn succeeded(&mut self, from_cache: bool) {
        self.outcome = RequestOutcome::Success;
        self.from_cache = from_cache;
    }

    /// Record the final error; cancellation is kept apart from failures.
    pub fn failed(&mut self, kind: ErrorKind) {
        self.outcome = if kind == ErrorKind::Cancelled {
            RequestOutcome::Cancelled
        } else {
            RequestOutcome::Error
        };
        self.error_kind = Some(kind);
    }
}

impl Drop for RequestRecorder {
    fn drop(&mut self) {
        self.observability.record_request(RequestSample {
            operation: self.operation.to_string(),
            recorded_at: Utc::now(),
            duration_ms: self.started.elapsed().as_secs_f64() * 1000.0,
            outcome: self.outcome,
            error_kind: self.error_kind,
            source: self.source,
            sort_by: self.sort_by,
            from_cache: self.from_cache,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(outcome: RequestOutcome, duration_ms: f64) -> RequestSample {
        RequestSample {
            operation: "top_queries".into(),
            recorded_at: Utc::now(),
            duration_ms,
            outcome,
            error_kind: None,
            source: Some(DataSource::HistoricalStore),
            sort_by: Some(SortField::Cpu),
            from_cache: false,
        }
    }

    #[test]
    fn test_window_is_bounded() {
        let obs = Observability::new(3);
        for i in 0..5 {
            obs.record_request(sample(RequestOutcome::Success, i as f64));
        }
        let snap = obs.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.source_usage[&DataSource::HistoricalStore], 3);
    }

    #[test]
    fn test_success_rate_ignores_cancelled() {
        let obs = Observability::new(10);
        obs.record_request(sample(RequestOutcome::Success, 1.0));
        obs.record_request(sample(RequestOutcome::Success, 1.0));
        obs.record_request(sample(RequestOutcome::Success, 1.0));
        obs.record_request(sample(RequestOutcome::Error, 1.0));
        obs.record_request(sample(RequestOutcome::Cancelled, 1.0));
        let snap = obs.snapshot();
        assert_eq!(snap.success_rate, Some(0.75));
        assert_eq!(snap.cancelled, 1);
    }

    #[test]
    fn test_empty_window() {
        let snap = Observability::new(10).snapshot();
        assert_eq!(snap.success_rate, None);
        assert_eq!(snap.p95_latency_ms, None);
    }

    #[test]
    fn test_p95_nearest_rank() {
        let mut values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&mut values, 95.0), Some(95.0));
        let mut one = vec![7.0];
        assert_eq!(percentile(&mut one, 95.0), Some(7.0));
    }

    #[tokio::test]
    async fn test_recorder_defaults_to_error_on_drop() {
        let obs = Arc::new(Observability::new(10));
        {
            let mut recorder = RequestRecorder::start(Arc::clone(&obs), "top_queries");
            recorder.sort_by(SortField::Executions);
        }
        {
            let mut recorder = RequestRecorder::start(Arc::clone(&obs), "top_queries");
            recorder.failed(ErrorKind::Cancelled);
        }
        let snap = obs.snapshot();
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.cancelled, 1);
        assert_eq!(snap.sort_usage[&SortField::Executions], 1);
    }
}
