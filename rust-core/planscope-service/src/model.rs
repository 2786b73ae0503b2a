// SPDX-License-Identifier: PMPL-1.0-or-later
//! Typed records returned by the performance data service.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::CapabilityProfile;

/// Where query statistics came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSource {
    /// Persisted historical query store.
    HistoricalStore,
    /// In-memory diagnostic views over the current plan cache.
    LiveViews,
}

impl DataSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::HistoricalStore => "historical-store",
            DataSource::LiveViews => "live-views",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordering of a top-queries page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortField {
    #[default]
    TotalDuration,
    AvgDuration,
    Cpu,
    LogicalReads,
    Executions,
}

impl SortField {
    pub fn as_str(self) -> &'static str {
        match self {
            SortField::TotalDuration => "total-duration",
            SortField::AvgDuration => "avg-duration",
            SortField::Cpu => "cpu",
            SortField::LogicalReads => "logical-reads",
            SortField::Executions => "executions",
        }
    }

    /// Sort key of a record under this ordering.
    pub fn key(self, stats: &QueryStats) -> f64 {
        match self {
            SortField::TotalDuration => stats.total_duration_ms,
            SortField::AvgDuration => stats.avg_duration_ms,
            SortField::Cpu => stats.avg_cpu_ms,
            SortField::LogicalReads => stats.avg_logical_reads,
            SortField::Executions => stats.execution_count as f64,
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attention level derived from average duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn from_avg_duration_ms(avg_ms: f64) -> Self {
        if avg_ms >= 5_000.0 {
            Priority::Critical
        } else if avg_ms >= 1_000.0 {
            Priority::High
        } else if avg_ms >= 100.0 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

/// Aggregated runtime statistics of one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    /// Historical-store query id; absent for live-view rows.
    pub query_id: Option<i64>,
    pub query_hash: String,
    /// The hash was derived from the query text, not reported by the engine.
    pub hash_is_synthetic: bool,
    pub plan_hash: Option<String>,
    pub plan_id: Option<i64>,
    pub query_text: String,
    pub text_truncated: bool,
    pub execution_count: u64,
    pub avg_duration_ms: f64,
    pub total_duration_ms: f64,
    pub avg_cpu_ms: f64,
    pub avg_logical_reads: f64,
    pub avg_memory_grant_kb: f64,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub source: DataSource,
}

/// Request parameters for a top-queries page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopQueriesFilter {
    /// Look-back window. Only the historical store honours it exactly.
    pub time_window_hours: u32,
    pub sort_by: SortField,
    pub limit: u32,
    pub offset: u32,
    /// Case-insensitive match on query text or hash. The text is matched as
    /// returned, so literal values are only searchable with
    /// `include_sensitive`.
    pub search_text: Option<String>,
    pub min_executions: Option<u64>,
    pub min_avg_duration_ms: Option<f64>,
    pub priority: Option<Priority>,
    /// Return query text with literals intact.
    pub include_sensitive: bool,
    /// Bypass a fresh cached page.
    pub force_refresh: bool,
}

impl Default for TopQueriesFilter {
    fn default() -> Self {
        Self {
            time_window_hours: 24,
            sort_by: SortField::default(),
            limit: 50,
            offset: 0,
            search_text: None,
            min_executions: None,
            min_avg_duration_ms: None,
            priority: None,
            include_sensitive: false,
            force_refresh: false,
        }
    }
}

impl TopQueriesFilter {
    /// Whether a record passes the filters the source query cannot express.
    pub fn matches(&self, stats: &QueryStats) -> bool {
        if let Some(search) = self.search_text.as_deref().map(str::trim) {
            if !search.is_empty() {
                let needle = search.to_lowercase();
                let hit = stats.query_text.to_lowercase().contains(&needle)
                    || stats.query_hash.to_lowercase().contains(&needle);
                if !hit {
                    return false;
                }
            }
        }
        if let Some(min) = self.min_executions {
            if stats.execution_count < min {
                return false;
            }
        }
        if let Some(min) = self.min_avg_duration_ms {
            if stats.avg_duration_ms < min {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if stats.priority != priority {
                return false;
            }
        }
        true
    }
}

/// One page of top queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopQueriesPage {
    pub queries: Vec<QueryStats>,
    /// Data-quality notes collected while reading the rows.
    pub warnings: Vec<String>,
    /// Rows available at the source, before paging.
    pub total_count: u64,
    pub source: DataSource,
    /// Set when the historical store failed and live views were used.
    pub fallback_reason: Option<String>,
    pub from_cache: bool,
    pub correlation_id: String,
}

/// State of the historical store on the connected database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceState {
    /// The engine version has no historical store.
    Unsupported,
    Disabled,
    /// Readable, but no longer capturing.
    ReadOnly,
    Operational,
}

impl SourceState {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceState::Unsupported => "unsupported",
            SourceState::Disabled => "disabled",
            SourceState::ReadOnly => "read-only",
            SourceState::Operational => "operational",
        }
    }

    /// Map the engine's state description.
    pub fn from_engine_state(state: &str) -> Self {
        match state.trim().to_uppercase().replace(' ', "_").as_str() {
            "READ_WRITE" => SourceState::Operational,
            "READ_ONLY" => SourceState::ReadOnly,
            _ => SourceState::Disabled,
        }
    }
}

/// Result of a source status check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub state: SourceState,
    /// The engine's own state text, when it reported one.
    pub raw_state: Option<String>,
    pub capabilities: CapabilityProfile,
    pub checked_at: DateTime<Utc>,
}

impl SourceStatus {
    /// Whether top queries can be read from the historical store.
    pub fn historical_store_usable(&self) -> bool {
        matches!(self.state, SourceState::Operational | SourceState::ReadOnly)
    }
}

/// Diagnostic permissions held by the current login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionStatus {
    pub can_view_server_state: bool,
    pub can_view_database_state: bool,
    pub checked_at: DateTime<Utc>,
}

impl PermissionStatus {
    pub fn can_read_diagnostics(&self) -> bool {
        self.can_view_server_state || self.can_view_database_state
    }
}
