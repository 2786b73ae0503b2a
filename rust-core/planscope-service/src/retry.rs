// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//!
//! Retry with exponential backoff and cooperative cancellation.
//!
//! Transient failures (timeout, connection, deadlock) are retried up to the
//! policy's attempt limit; everything else is returned after the first
//! attempt. Backoff sleeps are cut into small increments and the cancel
//! predicate is polled between them, so a cancelled request returns within
//! one increment.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, warn};

use crate::config::RetryPolicy;
use crate::error::ErrorKind;
use crate::observability::Observability;

/// Cooperative cancellation check, polled by long-running operations.
pub type CancelCheck = dyn Fn() -> bool + Send + Sync;

/// Outcome of a single fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
    Cancelled,
}

/// Record of one fetch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchAttemptResult {
    pub operation: String,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
    pub elapsed_ms: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    Cancelled,
    Failed { error: E, kind: ErrorKind, attempts: u32 },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Cancelled => write!(f, "cancelled"),
            RetryError::Failed {
                error,
                kind,
                attempts,
            } => write!(f, "{} failure after {} attempt(s): {}", kind, attempts, error),
        }
    }
}

/// Runs fallible async operations under a [`RetryPolicy`].
pub struct RetryExecutor {
    policy: RetryPolicy,
    observer: Option<Arc<Observability>>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            observer: None,
        }
    }

    /// Record every attempt into `observer`.
    pub fn with_observer(mut self, observer: Arc<Observability>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts,
    /// or `cancel` reports true.
    ///
    /// `cancel` is checked before every attempt and between backoff
    /// increments. A failure classified as cancelled is never retried.
    pub async fn execute<T, E, F, Fut, K>(
        &self,
        operation: &str,
        mut op: F,
        classify: K,
        cancel: &CancelCheck,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        K: Fn(&E) -> ErrorKind,
        E: fmt::Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            if cancel() {
                debug!(operation, attempt, "Cancelled before attempt");
                return Err(RetryError::Cancelled);
            }

            attempt += 1;
            let started = Instant::now();
            let result = op().await;
            let elapsed = started.elapsed();

            let error = match result {
                Ok(value) => {
                    self.record(operation, attempt, AttemptOutcome::Success, None, elapsed);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let kind = classify(&error);
            if kind == ErrorKind::Cancelled {
                self.record(operation, attempt, AttemptOutcome::Cancelled, Some(kind), elapsed);
                return Err(RetryError::Cancelled);
            }

            if !kind.is_transient() {
                self.record(
                    operation,
                    attempt,
                    AttemptOutcome::PermanentFailure,
                    Some(kind),
                    elapsed,
                );
                warn!(operation, attempt, kind = %kind, error = %error, "Permanent failure, not retrying");
                return Err(RetryError::Failed {
                    error,
                    kind,
                    attempts: attempt,
                });
            }

            self.record(
                operation,
                attempt,
                AttemptOutcome::TransientFailure,
                Some(kind),
                elapsed,
            );

            if attempt >= max_attempts {
                error!(
                    operation,
                    attempts = attempt,
                    kind = %kind,
                    error = %error,
                    "Giving up after transient failures"
                );
                return Err(RetryError::Failed {
                    error,
                    kind,
                    attempts: attempt,
                });
            }

            let backoff = self.policy.backoff_after(attempt);
            warn!(
                operation,
                attempt,
                max_attempts,
                kind = %kind,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Transient failure, retrying"
            );
            if self.sleep_unless_cancelled(backoff, cancel).await {
                debug!(operation, attempt, "Cancelled during backoff");
                return Err(RetryError::Cancelled);
            }
        }
    }

    /// Sleep for `total` in policy increments. Returns `true` if cancelled.
    async fn sleep_unless_cancelled(&self, total: Duration, cancel: &CancelCheck) -> bool {
        let step = self.policy.sleep_increment();
        let mut remaining = total;
        while !remaining.is_zero() {
            if cancel() {
                return true;
            }
            let nap = remaining.min(step);
            sleep(nap).await;
            remaining = remaining.saturating_sub(nap);
        }
        false
    }

    fn record(
        &self,
        operation: &str,
        attempt: u32,
        outcome: AttemptOutcome,
        error_kind: Option<ErrorKind>,
        elapsed: Duration,
    ) {
        if let Some(observer) = &self.observer {
            observer.record_attempt(FetchAttemptResult {
                operation: operation.to_string(),
                attempt,
                outcome,
                error_kind,
                elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                recorded_at: Utc::now(),
            });
        }
    }
}
