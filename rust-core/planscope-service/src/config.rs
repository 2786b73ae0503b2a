// SPDX-License-Identifier: PMPL-1.0-or-later
//! Service configuration.
//!
//! Every field has a default, so a partial JSON document (or `{}`) is a
//! valid configuration.

use std::time::Duration;

use planscope_plan::ParserConfig;
use serde::{Deserialize, Serialize};

/// Retry and backoff policy for source fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per fetch, the first one included.
    /// Default: 3.
    pub max_attempts: u32,
    /// Sleep before the second attempt; doubled after each further failure.
    /// Default: 500ms.
    pub initial_backoff_ms: u64,
    /// Upper bound on a single backoff sleep.
    /// Default: 8000ms.
    pub backoff_cap_ms: u64,
    /// Backoff sleeps are taken in steps of this size, with the cancel
    /// check polled between steps.
    /// Default: 100ms.
    pub sleep_increment_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            backoff_cap_ms: 8_000,
            sleep_increment_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Sleep taken after the `failures`-th consecutive transient failure.
    pub fn backoff_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }

    pub fn sleep_increment(&self) -> Duration {
        Duration::from_millis(self.sleep_increment_ms.max(1))
    }
}

/// Configuration for [`crate::QueryPerformanceDataService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Lifetime of a cached source status or permission check.
    /// Default: 300s.
    pub status_ttl_secs: u64,
    /// Lifetime of a cached top-queries page.
    /// Default: 30s.
    pub top_queries_ttl_secs: u64,
    /// Lifetime of a cached plan document.
    /// Default: 600s.
    pub plan_xml_ttl_secs: u64,
    /// Plan documents kept before the oldest is dropped.
    /// Default: 200.
    pub plan_xml_cache_size: usize,
    /// Longest query text kept in a result row, in characters.
    /// Default: 4000.
    pub max_query_text_len: usize,
    /// Request samples kept for success rate and latency figures.
    /// Default: 500.
    pub observability_capacity: usize,
    /// Period of the background status refresh.
    /// Default: 300s.
    pub refresh_interval_secs: u64,
    pub retry: RetryPolicy,
    pub parser: ParserConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            status_ttl_secs: 300,
            top_queries_ttl_secs: 30,
            plan_xml_ttl_secs: 600,
            plan_xml_cache_size: 200,
            max_query_text_len: 4_000,
            observability_capacity: 500,
            refresh_interval_secs: 300,
            retry: RetryPolicy::default(),
            parser: ParserConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn top_queries_ttl(&self) -> Duration {
        Duration::from_secs(self.top_queries_ttl_secs)
    }

    pub fn plan_xml_ttl(&self) -> Duration {
        Duration::from_secs(self.plan_xml_ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_after(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_after(4), Duration::from_millis(4_000));
        assert_eq!(policy.backoff_after(5), Duration::from_millis(8_000));
        assert_eq!(policy.backoff_after(60), Duration::from_millis(8_000));
    }

    #[test]
    fn test_zero_increment_is_raised() {
        let policy = RetryPolicy {
            sleep_increment_ms: 0,
            ..Default::default()
        };
        assert_eq!(policy.sleep_increment(), Duration::from_millis(1));
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config =
            ServiceConfig::from_json(r#"{"top_queries_ttl_secs": 5, "retry": {"max_attempts": 1}}"#)
                .unwrap();
        assert_eq!(config.top_queries_ttl(), Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.retry.initial_backoff_ms, 500);
        assert_eq!(config.status_ttl(), Duration::from_secs(300));
        assert_eq!(config.plan_xml_cache_size, 200);
        assert_eq!(config.parser.cache_size, 50);
    }

    #[test]
    fn test_empty_json_is_default() {
        let config = ServiceConfig::from_json("{}").unwrap();
        assert_eq!(config.observability_capacity, 500);
        assert_eq!(config.max_query_text_len, 4_000);
        assert_eq!(config.refresh_interval(), Duration::from_secs(300));
    }
}
