// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//!
//! Query performance data service.
//!
//! Chooses between the historical store and the live diagnostic views by
//! engine capability and store state, fetches through the retry executor,
//! falls back once from the historical store to live views, sanitizes rows
//! into typed records and caches results at several granularities with
//! independent lifetimes.
//!
//! All caches are fields of one service instance. No cache lock is held
//! across a fetch or a sleep.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use planscope_plan::{is_well_formed, ExecutionPlanParser, PlanDocument};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::{CachedPlanXml, PlanKey, PlanXmlCache, TtlCache};
use crate::capability::{CapabilityProfile, Feature, SourceCapabilityResolver};
use crate::config::ServiceConfig;
use crate::error::{classify, ErrorKind, ServiceError, TransportError};
use crate::model::{
    DataSource, PermissionStatus, Priority, QueryStats, SortField, SourceState, SourceStatus,
    TopQueriesFilter, TopQueriesPage,
};
use crate::observability::{Observability, ObservabilitySnapshot, RequestRecorder};
use crate::retry::{CancelCheck, RetryError, RetryExecutor};
use crate::sanitize::{read_i64, read_string, redact_plan_parameters, sanitize_rows, synthetic_hash};
use crate::templates::{QueryTemplates, StaticTemplates};
use crate::transport::{Params, ParamValue, QueryTransport, Row};

fn never_cancelled() -> bool {
    false
}

/// Canonical form of a top-queries request, hashed into the cache key.
///
/// Field order is fixed, so equal requests always serialize identically.
#[derive(Serialize)]
struct TopQueriesKey<'a> {
    connection: &'a str,
    source: DataSource,
    include_sensitive: bool,
    time_window_hours: u32,
    sort_by: SortField,
    limit: u32,
    offset: u32,
    search_text: Option<&'a str>,
    min_executions: Option<u64>,
    min_avg_duration_ms: Option<f64>,
    priority: Option<Priority>,
}

/// Source-aware access to query statistics and plan documents.
///
/// Shared between callers as `Arc<QueryPerformanceDataService>`.
pub struct QueryPerformanceDataService {
    transport: Arc<dyn QueryTransport>,
    templates: Arc<dyn QueryTemplates>,
    config: ServiceConfig,
    parser: ExecutionPlanParser,
    retry: RetryExecutor,
    observability: Arc<Observability>,
    /// Capability profile per connection; never expires.
    capabilities: Mutex<HashMap<String, CapabilityProfile>>,
    status_cache: TtlCache<String, SourceStatus>,
    permission_cache: TtlCache<String, PermissionStatus>,
    /// Keyed by (connection, request hash).
    top_queries_cache: TtlCache<(String, String), TopQueriesPage>,
    plan_cache: PlanXmlCache,
}

impl QueryPerformanceDataService {
    pub fn new(
        transport: Arc<dyn QueryTransport>,
        templates: Arc<dyn QueryTemplates>,
        config: ServiceConfig,
    ) -> Self {
        let observability = Arc::new(Observability::new(config.observability_capacity));
        let retry = RetryExecutor::new(config.retry.clone()).with_observer(Arc::clone(&observability));
        Self {
            transport,
            templates,
            parser: ExecutionPlanParser::new(config.parser.clone()),
            retry,
            observability,
            capabilities: Mutex::new(HashMap::new()),
            status_cache: TtlCache::new(config.status_ttl()),
            permission_cache: TtlCache::new(config.status_ttl()),
            top_queries_cache: TtlCache::new(config.top_queries_ttl()),
            plan_cache: PlanXmlCache::new(config.plan_xml_ttl(), config.plan_xml_cache_size),
            config,
        }
    }

    /// Service using the built-in statement templates.
    pub fn with_default_templates(transport: Arc<dyn QueryTransport>, config: ServiceConfig) -> Self {
        Self::new(transport, Arc::new(StaticTemplates::default()), config)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The shared plan parser.
    pub fn parser(&self) -> &ExecutionPlanParser {
        &self.parser
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Ask the engine to cancel whatever statement is in flight.
    pub async fn cancel_active_query(&self) -> bool {
        self.transport.cancel_active_query().await
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    /// The sentence to show a user for `err`.
    pub fn friendly_message(&self, err: &ServiceError) -> String {
        err.user_message()
    }

    fn ensure_connected(&self) -> Result<String, ServiceError> {
        if self.transport.is_connected() {
            Ok(self.transport.connection_id())
        } else {
            Err(ServiceError::NotConnected)
        }
    }

    async fn fetch(
        &self,
        operation: &str,
        sql: &str,
        params: &Params,
        cancel: &CancelCheck,
    ) -> Result<Vec<Row>, RetryError<TransportError>> {
        let transport = Arc::clone(&self.transport);
        self.retry
            .execute(
                operation,
                || {
                    let transport = Arc::clone(&transport);
                    let sql = sql.to_string();
                    let params = params.clone();
                    async move { transport.execute_query(&sql, &params).await }
                },
                classify,
                cancel,
            )
            .await
    }

    // -----------------------------------------------------------------------
    // Capabilities, status, permissions
    // -----------------------------------------------------------------------

    /// Capability profile of the connected engine, cached per connection.
    pub async fn capability_profile(&self) -> Result<CapabilityProfile, ServiceError> {
        let connection = self.ensure_connected()?;
        let cached = self.capabilities.lock().get(&connection).cloned();
        if let Some(profile) = cached {
            return Ok(profile);
        }

        let transport = Arc::clone(&self.transport);
        let version = self
            .retry
            .execute(
                "engine_version",
                || {
                    let transport = Arc::clone(&transport);
                    async move { transport.engine_major_version().await }
                },
                classify,
                &never_cancelled,
            )
            .await
            .map_err(fetch_error)?;

        let profile = SourceCapabilityResolver::resolve(version);
        info!(
            connection = %connection,
            engine_major_version = version,
            features = ?profile.features,
            "Resolved engine capabilities"
        );
        self.capabilities.lock().insert(connection, profile.clone());
        Ok(profile)
    }

    /// State of the historical store, cached per connection.
    pub async fn check_source_status(&self, force_refresh: bool) -> Result<SourceStatus, ServiceError> {
        let connection = self.ensure_connected()?;
        if !force_refresh {
            if let Some(status) = self.status_cache.get(&connection) {
                return Ok(status);
            }
        }

        let capabilities = self.capability_profile().await?;
        let (state, raw_state) = if capabilities.supports(Feature::HistoricalStore) {
            let rows = self
                .fetch(
                    "source_status",
                    self.templates.source_status(),
                    &Params::new(),
                    &never_cancelled,
                )
                .await
                .map_err(fetch_error)?;
            match rows
                .first()
                .and_then(|row| row.get("actual_state_desc"))
                .and_then(Value::as_str)
            {
                Some(raw) => (SourceState::from_engine_state(raw), Some(raw.to_string())),
                None => (SourceState::Disabled, None),
            }
        } else {
            (SourceState::Unsupported, None)
        };

        let status = SourceStatus {
            state,
            raw_state,
            capabilities,
            checked_at: Utc::now(),
        };
        info!(
            connection = %connection,
            state = status.state.as_str(),
            engine_major_version = status.capabilities.engine_major_version,
            "Source status checked"
        );
        self.status_cache.insert(connection, &status);
        Ok(status)
    }

    /// Diagnostic permissions of the current login, cached per connection.
    ///
    /// A permission failure while checking means neither permission is held.
    pub async fn check_permissions(&self, force_refresh: bool) -> Result<PermissionStatus, ServiceError> {
        let connection = self.ensure_connected()?;
        if !force_refresh {
            if let Some(status) = self.permission_cache.get(&connection) {
                return Ok(status);
            }
        }

        let rows = match self
            .fetch(
                "permissions",
                self.templates.permissions(),
                &Params::new(),
                &never_cancelled,
            )
            .await
        {
            Ok(rows) => rows,
            Err(RetryError::Failed {
                kind: ErrorKind::Permission,
                error,
                ..
            }) => {
                warn!(connection = %connection, error = %error, "Permission check denied");
                Vec::new()
            }
            Err(err) => return Err(fetch_error(err)),
        };

        let row = rows.first();
        let status = PermissionStatus {
            can_view_server_state: row.map(|r| read_flag(r, "has_view_server_state")).unwrap_or(false),
            can_view_database_state: row
                .map(|r| read_flag(r, "has_view_database_state"))
                .unwrap_or(false),
            checked_at: Utc::now(),
        };
        debug!(
            connection = %connection,
            server_state = status.can_view_server_state,
            database_state = status.can_view_database_state,
            "Permissions checked"
        );
        self.permission_cache.insert(connection, &status);
        Ok(status)
    }

    /// Drop connection-scoped caches and re-check the source status.
    ///
    /// Status, permission, top-queries and plan document entries of the
    /// current connection are always dropped. `force_refresh` also drops the
    /// capability profile and the plan documents of every connection.
    pub async fn refresh(&self, force_refresh: bool) -> Result<SourceStatus, ServiceError> {
        let connection = self.ensure_connected()?;
        self.status_cache.remove(&connection);
        self.permission_cache.remove(&connection);
        self.top_queries_cache.retain(|(conn, _)| conn != &connection);
        self.plan_cache.remove_connection(&connection);
        if force_refresh {
            self.capabilities.lock().remove(&connection);
            self.plan_cache.clear();
        }
        info!(connection = %connection, force_refresh, "Caches invalidated");
        self.check_source_status(true).await
    }

    /// Source for top queries, noting on the page why live views were chosen.
    async fn resolve_source(&self, warnings: &mut Vec<String>) -> Result<DataSource, ServiceError> {
        match self.check_source_status(false).await {
            Ok(status) if status.historical_store_usable() => Ok(DataSource::HistoricalStore),
            Ok(status) => {
                if status.state != SourceState::Unsupported {
                    warnings.push(format!(
                        "The query store is {}; showing live plan cache statistics",
                        status.state.as_str()
                    ));
                }
                Ok(DataSource::LiveViews)
            }
            Err(err @ (ServiceError::NotConnected | ServiceError::Cancelled)) => Err(err),
            Err(err) => {
                warn!(kind = %err.kind(), error = %err, "Source status check failed, using live views");
                warnings.push(
                    "The query store status could not be checked; showing live plan cache statistics"
                        .to_string(),
                );
                Ok(DataSource::LiveViews)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Top queries
    // -----------------------------------------------------------------------

    /// One page of the most expensive queries.
    ///
    /// `cancel` is polled before the request, between retries and after the
    /// fetch. A fresh cached page for the same request is returned as is.
    pub async fn get_top_queries(
        &self,
        filter: &TopQueriesFilter,
        cancel: &CancelCheck,
        correlation_id: Option<&str>,
    ) -> Result<TopQueriesPage, ServiceError> {
        let correlation_id = correlation_id
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = info_span!(
            "top_queries",
            correlation_id = %correlation_id,
            sort_by = %filter.sort_by
        );

        let mut recorder = RequestRecorder::start(Arc::clone(&self.observability), "top_queries");
        recorder.sort_by(filter.sort_by);

        let result = self
            .top_queries(filter, cancel, &correlation_id, &mut recorder)
            .instrument(span)
            .await;

        match &result {
            Ok(page) => recorder.succeeded(page.from_cache),
            Err(err) => {
                recorder.failed(err.kind());
                if err.kind() == ErrorKind::Cancelled {
                    debug!(correlation_id = %correlation_id, "Top queries request cancelled");
                } else {
                    warn!(
                        correlation_id = %correlation_id,
                        kind = %err.kind(),
                        error = %err,
                        "Top queries request failed"
                    );
                }
            }
        }
        result
    }

    async fn top_queries(
        &self,
        filter: &TopQueriesFilter,
        cancel: &CancelCheck,
        correlation_id: &str,
        recorder: &mut RequestRecorder,
    ) -> Result<TopQueriesPage, ServiceError> {
        if cancel() {
            return Err(ServiceError::Cancelled);
        }
        let connection = self.ensure_connected()?;

        let mut warnings = Vec::new();
        let primary = self.resolve_source(&mut warnings).await?;
        let key = (
            connection.clone(),
            top_queries_key(&connection, primary, filter)?,
        );

        if !filter.force_refresh {
            if let Some(mut page) = self.top_queries_cache.get(&key) {
                debug!(source = %page.source, rows = page.queries.len(), "Top queries served from cache");
                page.from_cache = true;
                page.correlation_id = correlation_id.to_string();
                recorder.source(page.source);
                return Ok(page);
            }
        }

        let params = top_queries_params(filter);
        let mut source = primary;
        let mut fallback_reason = None;
        let rows = match self
            .fetch("top_queries", self.templates.top_queries(primary), &params, cancel)
            .await
        {
            Ok(rows) => rows,
            Err(RetryError::Cancelled) => return Err(ServiceError::Cancelled),
            Err(RetryError::Failed {
                error,
                kind,
                attempts,
            }) if primary == DataSource::HistoricalStore => {
                warn!(
                    kind = %kind,
                    attempts,
                    error = %error,
                    "Historical store fetch failed, falling back to live views"
                );
                source = DataSource::LiveViews;
                fallback_reason = Some(format!(
                    "The query store could not be read ({}); showing live plan cache statistics",
                    kind
                ));
                self.fetch(
                    "top_queries_fallback",
                    self.templates.top_queries(DataSource::LiveViews),
                    &params,
                    cancel,
                )
                .await
                .map_err(fetch_error)?
            }
            Err(err) => return Err(fetch_error(err)),
        };
        recorder.source(source);

        if cancel() {
            return Err(ServiceError::Cancelled);
        }

        let sanitized = sanitize_rows(
            &rows,
            source,
            self.config.max_query_text_len,
            filter.include_sensitive,
        );
        warnings.extend(sanitized.warnings);

        let fetched = sanitized.queries.len();
        let mut queries: Vec<QueryStats> = sanitized
            .queries
            .into_iter()
            .filter(|stats| filter.matches(stats))
            .collect();
        queries.sort_by(|a, b| {
            filter
                .sort_by
                .key(b)
                .partial_cmp(&filter.sort_by.key(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let matched = queries.len();
        if filter.limit > 0 {
            queries.truncate(filter.limit as usize);
        }

        // A source total only holds while the post filters removed nothing.
        let total_count = match sanitized.reported_total {
            Some(total) if matched == fetched => total.max(fetched as u64),
            _ => u64::from(filter.offset) + queries.len() as u64,
        };

        let page = TopQueriesPage {
            queries,
            warnings,
            total_count,
            source,
            fallback_reason,
            from_cache: false,
            correlation_id: correlation_id.to_string(),
        };
        info!(
            source = %page.source,
            rows = page.queries.len(),
            total_count = page.total_count,
            warnings = page.warnings.len(),
            fallback = page.fallback_reason.is_some(),
            "Top queries fetched"
        );
        self.top_queries_cache.insert(key, &page);
        Ok(page)
    }

    // -----------------------------------------------------------------------
    // Plan documents
    // -----------------------------------------------------------------------

    /// Plan document of a query, by historical-store id or by query hash.
    ///
    /// Without `include_sensitive`, sniffed and runtime parameter values are
    /// redacted. Documents that are not well-formed are rejected.
    pub async fn get_query_plan_xml(
        &self,
        query_id: Option<i64>,
        query_hash: Option<&str>,
        include_sensitive: bool,
    ) -> Result<String, ServiceError> {
        let entry = self.plan_entry(query_id, query_hash).await?;
        if include_sensitive {
            Ok(entry.xml)
        } else {
            Ok(redact_plan_parameters(&entry.xml))
        }
    }

    /// Parsed plan of a query, through the shared parse cache.
    pub async fn get_query_plan(
        &self,
        query_id: Option<i64>,
        query_hash: Option<&str>,
    ) -> Result<PlanDocument, ServiceError> {
        let entry = self.plan_entry(query_id, query_hash).await?;
        let mut plan = self.parser.parse(&entry.xml)?;
        plan.metadata.query_id = entry.query_id.or(query_id);
        plan.metadata.plan_id = entry.plan_id;
        Ok(plan)
    }

    async fn plan_entry(
        &self,
        query_id: Option<i64>,
        query_hash: Option<&str>,
    ) -> Result<CachedPlanXml, ServiceError> {
        let connection = self.ensure_connected()?;
        let query_hash = query_hash.map(str::trim).filter(|hash| !hash.is_empty());
        if query_id.is_none() && query_hash.is_none() {
            return Err(ServiceError::InvalidRequest(
                "a query id or a query hash is required".to_string(),
            ));
        }

        let cached = query_id
            .and_then(|id| self.plan_cache.get_by_query_id(&connection, id))
            .or_else(|| {
                query_hash.and_then(|hash| self.plan_cache.get_by_query_hash(&connection, hash))
            });
        if let Some(entry) = cached {
            debug!(query_id = ?query_id, query_hash = ?query_hash, "Plan document served from cache");
            return Ok(entry);
        }

        self.fetch_plan(connection, query_id, query_hash).await
    }

    async fn fetch_plan(
        &self,
        connection: String,
        query_id: Option<i64>,
        query_hash: Option<&str>,
    ) -> Result<CachedPlanXml, ServiceError> {
        let label = match (query_id, query_hash) {
            (Some(id), _) => format!("query id {}", id),
            (None, Some(hash)) => format!("query hash {}", hash),
            (None, None) => "query".to_string(),
        };

        let historical = query_id.is_some()
            && self
                .check_source_status(false)
                .await
                .map(|status| status.historical_store_usable())
                .unwrap_or(false);
        let source = if historical {
            DataSource::HistoricalStore
        } else if query_hash.is_some() {
            DataSource::LiveViews
        } else {
            return Err(ServiceError::InvalidRequest(
                "the query store is not available; live views can only be searched by query hash"
                    .to_string(),
            ));
        };

        let mut params = Params::new();
        params.insert("query_id".to_string(), ParamValue::from(query_id));
        params.insert(
            "query_hash".to_string(),
            ParamValue::from(query_hash.map(str::to_string)),
        );

        let rows = match self
            .fetch(
                "plan_document",
                self.templates.plan_document(source),
                &params,
                &never_cancelled,
            )
            .await
        {
            Ok(rows) => rows,
            Err(RetryError::Failed { error, kind, .. })
                if source == DataSource::HistoricalStore && query_hash.is_some() =>
            {
                warn!(kind = %kind, error = %error, "Historical plan fetch failed, falling back to live views");
                self.fetch(
                    "plan_document_fallback",
                    self.templates.plan_document(DataSource::LiveViews),
                    &params,
                    &never_cancelled,
                )
                .await
                .map_err(fetch_error)?
            }
            Err(err) => return Err(fetch_error(err)),
        };

        let row = rows
            .into_iter()
            .find(|row| {
                row.get("query_plan")
                    .and_then(Value::as_str)
                    .is_some_and(|xml| !xml.trim().is_empty())
            })
            .ok_or_else(|| ServiceError::PlanNotFound(label.clone()))?;
        let xml = row
            .get("query_plan")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if !is_well_formed(&xml) {
            warn!(query = %label, bytes = xml.len(), "Rejected plan document that is not well-formed");
            return Err(ServiceError::InvalidPlanDocument(label));
        }

        let key = PlanKey {
            connection,
            query_hash: read_string(&row, "query_hash")
                .or_else(|| query_hash.map(str::to_string))
                .unwrap_or_else(|| synthetic_hash(&xml)),
            plan_hash: read_string(&row, "plan_hash").unwrap_or_else(|| synthetic_hash(&xml)),
        };
        let entry = CachedPlanXml {
            query_id: query_id.or_else(|| read_i64(&row, "query_id")),
            plan_id: read_i64(&row, "plan_id"),
            xml,
        };
        debug!(
            query = %label,
            query_hash = %key.query_hash,
            plan_hash = %key.plan_hash,
            source = %source,
            "Plan document fetched"
        );
        self.plan_cache.insert(key, &entry);
        Ok(entry)
    }
}

fn fetch_error(err: RetryError<TransportError>) -> ServiceError {
    match err {
        RetryError::Cancelled => ServiceError::Cancelled,
        RetryError::Failed {
            error,
            kind,
            attempts,
        } => ServiceError::Fetch {
            kind,
            attempts,
            source: error,
        },
    }
}

fn top_queries_key(
    connection: &str,
    source: DataSource,
    filter: &TopQueriesFilter,
) -> Result<String, ServiceError> {
    let key = TopQueriesKey {
        connection,
        source,
        include_sensitive: filter.include_sensitive,
        time_window_hours: filter.time_window_hours,
        sort_by: filter.sort_by,
        limit: filter.limit,
        offset: filter.offset,
        search_text: filter.search_text.as_deref(),
        min_executions: filter.min_executions,
        min_avg_duration_ms: filter.min_avg_duration_ms,
        priority: filter.priority,
    };
    let canonical = serde_json::to_vec(&key)?;
    Ok(Sha256::digest(&canonical)
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect())
}

fn top_queries_params(filter: &TopQueriesFilter) -> Params {
    let mut params = Params::new();
    params.insert(
        "time_window_hours".to_string(),
        ParamValue::from(filter.time_window_hours),
    );
    params.insert(
        "sort_by".to_string(),
        ParamValue::from(filter.sort_by.as_str()),
    );
    params.insert("limit".to_string(), ParamValue::from(filter.limit));
    params.insert("offset".to_string(), ParamValue::from(filter.offset));
    params
}

/// Read a permission flag returned as a boolean, a 0/1 number or text.
fn read_flag(row: &Row, field: &str) -> bool {
    match row.get(field) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes"),
        _ => false,
    }
}
