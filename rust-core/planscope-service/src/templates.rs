// SPDX-License-Identifier: PMPL-1.0-or-later
//! SQL templates consumed by the service.
//!
//! The service treats templates as opaque text. It binds the named
//! parameters below and reads the result columns below; nothing else about
//! the statements is assumed.
//!
//! | Template | Parameters | Columns read |
//! |----------|------------|--------------|
//! | top queries | `@time_window_hours`, `@sort_by`, `@limit`, `@offset` | `query_id`, `query_hash`, `plan_hash`, `plan_id`, `query_text`, `execution_count`, `avg_duration_ms`, `total_duration_ms`, `avg_cpu_ms`, `avg_logical_reads`, `avg_memory_grant_kb`, `last_execution_time`, `total_count` |
//! | plan document | `@query_id`, `@query_hash` | `query_plan`, `query_hash`, `plan_hash`, `plan_id` |
//! | source status | none | `actual_state_desc` |
//! | permissions | none | `has_view_server_state`, `has_view_database_state` |

use serde::{Deserialize, Serialize};

use crate::model::DataSource;

/// Provider of the statements run by the service.
pub trait QueryTemplates: Send + Sync {
    fn top_queries(&self, source: DataSource) -> &str;
    fn plan_document(&self, source: DataSource) -> &str;
    fn source_status(&self) -> &str;
    fn permissions(&self) -> &str;
}

/// Templates held as plain strings, loadable from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticTemplates {
    pub historical_top_queries: String,
    pub live_top_queries: String,
    pub historical_plan: String,
    pub live_plan: String,
    pub source_status: String,
    pub permissions: String,
}

impl QueryTemplates for StaticTemplates {
    fn top_queries(&self, source: DataSource) -> &str {
        match source {
            DataSource::HistoricalStore => &self.historical_top_queries,
            DataSource::LiveViews => &self.live_top_queries,
        }
    }

    fn plan_document(&self, source: DataSource) -> &str {
        match source {
            DataSource::HistoricalStore => &self.historical_plan,
            DataSource::LiveViews => &self.live_plan,
        }
    }

    fn source_status(&self) -> &str {
        &self.source_status
    }

    fn permissions(&self) -> &str {
        &self.permissions
    }
}

impl Default for StaticTemplates {
    fn default() -> Self {
        Self {
            historical_top_queries: HISTORICAL_TOP_QUERIES.to_string(),
            live_top_queries: LIVE_TOP_QUERIES.to_string(),
            historical_plan: HISTORICAL_PLAN.to_string(),
            live_plan: LIVE_PLAN.to_string(),
            source_status: SOURCE_STATUS.to_string(),
            permissions: PERMISSIONS.to_string(),
        }
    }
}

const HISTORICAL_TOP_QUERIES: &str = r#"
WITH agg AS (
    SELECT q.query_id,
           CONVERT(varchar(20), q.query_hash, 1) AS query_hash,
           MAX(p.plan_id) AS plan_id,
           MAX(CONVERT(varchar(20), p.query_plan_hash, 1)) AS plan_hash,
           MAX(t.query_sql_text) AS query_text,
           SUM(rs.count_executions) AS execution_count,
           SUM(rs.avg_duration * rs.count_executions) / NULLIF(SUM(rs.count_executions), 0) / 1000.0 AS avg_duration_ms,
           SUM(rs.avg_duration * rs.count_executions) / 1000.0 AS total_duration_ms,
           SUM(rs.avg_cpu_time * rs.count_executions) / NULLIF(SUM(rs.count_executions), 0) / 1000.0 AS avg_cpu_ms,
           SUM(rs.avg_logical_io_reads * rs.count_executions) / NULLIF(SUM(rs.count_executions), 0) AS avg_logical_reads,
           AVG(rs.avg_query_max_used_memory) * 8 AS avg_memory_grant_kb,
           MAX(rs.last_execution_time) AS last_execution_time
    FROM sys.query_store_query q
    JOIN sys.query_store_query_text t ON t.query_text_id = q.query_text_id
    JOIN sys.query_store_plan p ON p.query_id = q.query_id
    JOIN sys.query_store_runtime_stats rs ON rs.plan_id = p.plan_id
    JOIN sys.query_store_runtime_stats_interval i ON i.runtime_stats_interval_id = rs.runtime_stats_interval_id
    WHERE i.end_time >= DATEADD(hour, -@time_window_hours, SYSUTCDATETIME())
    GROUP BY q.query_id, q.query_hash
)
SELECT agg.*, COUNT(*) OVER () AS total_count
FROM agg
ORDER BY CASE @sort_by
    WHEN 'avg-duration' THEN avg_duration_ms
    WHEN 'cpu' THEN avg_cpu_ms
    WHEN 'logical-reads' THEN avg_logical_reads
    WHEN 'executions' THEN execution_count
    ELSE total_duration_ms END DESC
OFFSET @offset ROWS FETCH NEXT @limit ROWS ONLY;
"#;

const LIVE_TOP_QUERIES: &str = r#"
WITH agg AS (
    SELECT CONVERT(varchar(20), qs.query_hash, 1) AS query_hash,
           MAX(CONVERT(varchar(20), qs.query_plan_hash, 1)) AS plan_hash,
           MAX(SUBSTRING(st.text, (qs.statement_start_offset / 2) + 1,
               ((CASE qs.statement_end_offset WHEN -1 THEN DATALENGTH(st.text)
                 ELSE qs.statement_end_offset END - qs.statement_start_offset) / 2) + 1)) AS query_text,
           SUM(qs.execution_count) AS execution_count,
           SUM(qs.total_elapsed_time) / NULLIF(SUM(qs.execution_count), 0) / 1000.0 AS avg_duration_ms,
           SUM(qs.total_elapsed_time) / 1000.0 AS total_duration_ms,
           SUM(qs.total_worker_time) / NULLIF(SUM(qs.execution_count), 0) / 1000.0 AS avg_cpu_ms,
           SUM(qs.total_logical_reads) / NULLIF(SUM(qs.execution_count), 0) AS avg_logical_reads,
           AVG(qs.total_grant_kb / NULLIF(qs.execution_count, 0)) AS avg_memory_grant_kb,
           MAX(qs.last_execution_time) AS last_execution_time
    FROM sys.dm_exec_query_stats qs
    CROSS APPLY sys.dm_exec_sql_text(qs.sql_handle) st
    GROUP BY qs.query_hash
)
SELECT agg.*, COUNT(*) OVER () AS total_count
FROM agg
ORDER BY CASE @sort_by
    WHEN 'avg-duration' THEN avg_duration_ms
    WHEN 'cpu' THEN avg_cpu_ms
    WHEN 'logical-reads' THEN avg_logical_reads
    WHEN 'executions' THEN execution_count
    ELSE total_duration_ms END DESC
OFFSET @offset ROWS FETCH NEXT @limit ROWS ONLY;
"#;

const HISTORICAL_PLAN: &str = r#"
SELECT TOP (1) p.query_id, p.plan_id,
       CONVERT(varchar(20), q.query_hash, 1) AS query_hash,
       CONVERT(varchar(20), p.query_plan_hash, 1) AS plan_hash,
       p.query_plan
FROM sys.query_store_plan p
JOIN sys.query_store_query q ON q.query_id = p.query_id
WHERE (@query_id IS NOT NULL AND p.query_id = @query_id)
   OR (@query_id IS NULL AND CONVERT(varchar(20), q.query_hash, 1) = @query_hash)
ORDER BY p.last_execution_time DESC;
"#;

const LIVE_PLAN: &str = r#"
SELECT TOP (1) CONVERT(varchar(20), qs.query_hash, 1) AS query_hash,
       CONVERT(varchar(20), qs.query_plan_hash, 1) AS plan_hash,
       CONVERT(nvarchar(max), qp.query_plan) AS query_plan
FROM sys.dm_exec_query_stats qs
CROSS APPLY sys.dm_exec_query_plan(qs.plan_handle) qp
WHERE CONVERT(varchar(20), qs.query_hash, 1) = @query_hash
ORDER BY qs.last_execution_time DESC;
"#;

const SOURCE_STATUS: &str =
    "SELECT actual_state_desc, readonly_reason FROM sys.database_query_store_options;";

const PERMISSIONS: &str = r#"
SELECT HAS_PERMS_BY_NAME(NULL, NULL, 'VIEW SERVER STATE') AS has_view_server_state,
       HAS_PERMS_BY_NAME(DB_NAME(), 'DATABASE', 'VIEW DATABASE STATE') AS has_view_database_state;
"#;
