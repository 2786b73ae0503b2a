// SPDX-License-Identifier: PMPL-1.0-or-later
//! Service tests against a scripted transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use planscope_service::{
    BackgroundRefresher, DataSource, ErrorKind, ParamValue, Params, Priority,
    QueryPerformanceDataService, QueryTemplates, QueryTransport, RetryPolicy, Row, ServiceConfig,
    ServiceError, SortField, SourceState, TopQueriesFilter, TransportError,
};
use serde_json::{json, Value};
use tokio::time::{advance, sleep, Duration, Instant};

const TOP_HISTORICAL: &str = "top:historical";
const TOP_LIVE: &str = "top:live";
const PLAN_HISTORICAL: &str = "plan:historical";
const PLAN_LIVE: &str = "plan:live";
const STATUS: &str = "status";
const PERMISSIONS: &str = "permissions";

const PLAN_XML: &str = r#"<ShowPlanXML xmlns="http://schemas.microsoft.com/sqlserver/2004/07/showplan" Version="1.5">
  <BatchSequence><Batch><Statements>
    <StmtSimple StatementText="SELECT * FROM dbo.Orders WHERE Id = @id" StatementType="SELECT" StatementSubTreeCost="0.5" StatementEstRows="1" QueryHash="0xAAAA" QueryPlanHash="0xBBBB">
      <QueryPlan DegreeOfParallelism="1">
        <RelOp NodeId="0" PhysicalOp="Clustered Index Seek" LogicalOp="Clustered Index Seek" EstimateRows="1" EstimatedTotalSubtreeCost="0.5" />
        <ParameterList>
          <ColumnReference Column="@id" ParameterCompiledValue="(42)" ParameterRuntimeValue="(7)" />
        </ParameterList>
      </QueryPlan>
    </StmtSimple>
  </Statements></Batch></BatchSequence>
</ShowPlanXML>"#;

struct TestTemplates;

impl QueryTemplates for TestTemplates {
    fn top_queries(&self, source: DataSource) -> &str {
        match source {
            DataSource::HistoricalStore => TOP_HISTORICAL,
            DataSource::LiveViews => TOP_LIVE,
        }
    }

    fn plan_document(&self, source: DataSource) -> &str {
        match source {
            DataSource::HistoricalStore => PLAN_HISTORICAL,
            DataSource::LiveViews => PLAN_LIVE,
        }
    }

    fn source_status(&self) -> &str {
        STATUS
    }

    fn permissions(&self) -> &str {
        PERMISSIONS
    }
}

type Reply = Result<Vec<Row>, TransportError>;

/// Transport that answers each statement from a script.
///
/// Replies are consumed in order; the last one repeats.
struct MockTransport {
    connected: AtomicBool,
    connection: Mutex<String>,
    version: u32,
    script: Mutex<HashMap<String, Vec<Reply>>>,
    calls: Mutex<HashMap<String, u32>>,
    version_calls: Mutex<u32>,
    last_params: Mutex<Option<Params>>,
}

impl MockTransport {
    fn new(version: u32) -> Self {
        let transport = Self {
            connected: AtomicBool::new(true),
            connection: Mutex::new("server-a/db-1".to_string()),
            version,
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            version_calls: Mutex::new(0),
            last_params: Mutex::new(None),
        };
        transport.reply(STATUS, vec![Ok(vec![row(json!({"actual_state_desc": "READ_WRITE"}))])]);
        transport.reply(
            PERMISSIONS,
            vec![Ok(vec![row(json!({
                "has_view_server_state": 1,
                "has_view_database_state": true
            }))])],
        );
        transport
    }

    fn reply(&self, sql: &str, replies: Vec<Reply>) {
        self.script.lock().insert(sql.to_string(), replies);
    }

    fn calls(&self, sql: &str) -> u32 {
        self.calls.lock().get(sql).copied().unwrap_or(0)
    }

    fn version_calls(&self) -> u32 {
        *self.version_calls.lock()
    }

    fn switch_connection(&self, connection: &str) {
        *self.connection.lock() = connection.to_string();
    }
}

#[async_trait]
impl QueryTransport for MockTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_id(&self) -> String {
        self.connection.lock().clone()
    }

    async fn execute_query(&self, sql: &str, params: &Params) -> Result<Vec<Row>, TransportError> {
        *self.calls.lock().entry(sql.to_string()).or_insert(0) += 1;
        *self.last_params.lock() = Some(params.clone());
        let mut script = self.script.lock();
        let replies = script
            .get_mut(sql)
            .ok_or_else(|| TransportError::Other(format!("unscripted statement {}", sql)))?;
        if replies.len() > 1 {
            replies.remove(0)
        } else {
            replies[0].clone()
        }
    }

    async fn engine_major_version(&self) -> Result<u32, TransportError> {
        *self.version_calls.lock() += 1;
        Ok(self.version)
    }

    async fn cancel_active_query(&self) -> bool {
        true
    }
}

fn row(value: Value) -> Row {
    serde_json::from_value(value).unwrap()
}

fn query_row(id: i64, avg_ms: f64, executions: u64) -> Row {
    row(json!({
        "query_id": id,
        "query_hash": format!("0x{:04X}", id),
        "query_text": format!("SELECT * FROM t WHERE id = {} AND name = 'secret'", id),
        "execution_count": executions,
        "avg_duration_ms": avg_ms,
        "total_duration_ms": avg_ms * executions as f64,
        "avg_cpu_ms": avg_ms / 2.0,
        "avg_logical_reads": 10,
        "avg_memory_grant_kb": 0,
        "total_count": 3
    }))
}

fn three_rows() -> Vec<Row> {
    vec![
        query_row(1, 10.0, 5),
        query_row(2, 2_000.0, 3),
        query_row(3, 150.0, 100),
    ]
}

fn setup(version: u32) -> (Arc<MockTransport>, QueryPerformanceDataService) {
    setup_with(version, ServiceConfig::default())
}

fn setup_with(version: u32, config: ServiceConfig) -> (Arc<MockTransport>, QueryPerformanceDataService) {
    let transport = Arc::new(MockTransport::new(version));
    let service = QueryPerformanceDataService::new(
        transport.clone() as Arc<dyn QueryTransport>,
        Arc::new(TestTemplates),
        config,
    );
    (transport, service)
}

fn never() -> bool {
    false
}

// ---------------------------------------------------------------------------
// Source status
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_status_cached_until_ttl() {
    let (transport, service) = setup(16);

    let status = service.check_source_status(false).await.unwrap();
    assert_eq!(status.state, SourceState::Operational);
    assert_eq!(status.raw_state.as_deref(), Some("READ_WRITE"));
    service.check_source_status(false).await.unwrap();
    assert_eq!(transport.calls(STATUS), 1);

    advance(Duration::from_secs(299)).await;
    service.check_source_status(false).await.unwrap();
    assert_eq!(transport.calls(STATUS), 1);

    advance(Duration::from_secs(2)).await;
    service.check_source_status(false).await.unwrap();
    assert_eq!(transport.calls(STATUS), 2);

    service.check_source_status(true).await.unwrap();
    assert_eq!(transport.calls(STATUS), 3);
    assert_eq!(transport.version_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_old_engine_is_unsupported_without_querying() {
    let (transport, service) = setup(12);
    transport.reply(TOP_LIVE, vec![Ok(three_rows())]);

    let status = service.check_source_status(false).await.unwrap();
    assert_eq!(status.state, SourceState::Unsupported);
    assert_eq!(transport.calls(STATUS), 0);

    let page = service
        .get_top_queries(&TopQueriesFilter::default(), &never, None)
        .await
        .unwrap();
    assert_eq!(page.source, DataSource::LiveViews);
    assert!(page.fallback_reason.is_none());
    assert!(page.warnings.is_empty());
    assert_eq!(transport.calls(TOP_HISTORICAL), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_store_uses_live_views_with_warning() {
    let (transport, service) = setup(16);
    transport.reply(STATUS, vec![Ok(vec![row(json!({"actual_state_desc": "OFF"}))])]);
    transport.reply(TOP_LIVE, vec![Ok(three_rows())]);

    let page = service
        .get_top_queries(&TopQueriesFilter::default(), &never, None)
        .await
        .unwrap();
    assert_eq!(page.source, DataSource::LiveViews);
    assert_eq!(page.warnings.len(), 1);
    assert!(page.warnings[0].contains("disabled"));
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_means_no_permissions() {
    let (transport, service) = setup(16);
    let perms = service.check_permissions(false).await.unwrap();
    assert!(perms.can_view_server_state);
    assert!(perms.can_view_database_state);

    transport.reply(
        PERMISSIONS,
        vec![Err(TransportError::PermissionDenied("VIEW SERVER STATE".into()))],
    );
    let perms = service.check_permissions(true).await.unwrap();
    assert!(!perms.can_view_server_state);
    assert!(!perms.can_view_database_state);
    assert!(!perms.can_read_diagnostics());
    assert_eq!(transport.calls(PERMISSIONS), 2);
}

#[tokio::test(start_paused = true)]
async fn test_not_connected() {
    let (transport, service) = setup(16);
    transport.connected.store(false, Ordering::SeqCst);

    let err = service
        .get_top_queries(&TopQueriesFilter::default(), &never, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotConnected));
    assert!(matches!(
        service.check_source_status(false).await,
        Err(ServiceError::NotConnected)
    ));
    assert_eq!(transport.version_calls(), 0);
}

// ---------------------------------------------------------------------------
// Top queries
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_top_queries_sorted_and_masked() {
    let (transport, service) = setup(16);
    transport.reply(TOP_HISTORICAL, vec![Ok(three_rows())]);

    let filter = TopQueriesFilter {
        sort_by: SortField::AvgDuration,
        time_window_hours: 6,
        ..Default::default()
    };
    let page = service.get_top_queries(&filter, &never, Some("req-1")).await.unwrap();

    assert_eq!(page.source, DataSource::HistoricalStore);
    assert_eq!(page.correlation_id, "req-1");
    assert!(!page.from_cache);
    let ids: Vec<Option<i64>> = page.queries.iter().map(|q| q.query_id).collect();
    assert_eq!(ids, vec![Some(2), Some(3), Some(1)]);
    assert_eq!(page.queries[0].priority, Priority::High);
    assert_eq!(page.total_count, 3);
    assert!(page.queries.iter().all(|q| q.query_text.ends_with("name = '?'")));

    let params = transport.last_params.lock().clone().unwrap();
    assert_eq!(params["time_window_hours"], ParamValue::from(6i64));
    assert_eq!(params["sort_by"], ParamValue::from("avg-duration"));
}

#[tokio::test(start_paused = true)]
async fn test_generated_correlation_id() {
    let (transport, service) = setup(16);
    transport.reply(TOP_HISTORICAL, vec![Ok(three_rows())]);

    let page = service
        .get_top_queries(&TopQueriesFilter::default(), &never, None)
        .await
        .unwrap();
    assert_eq!(page.correlation_id.len(), 36);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retried() {
    let (transport, service) = setup(16);
    transport.reply(
        TOP_HISTORICAL,
        vec![
            Err(TransportError::Timeout("timeout expired".into())),
            Err(TransportError::Engine {
                code: Some(1205),
                message: "chosen as the deadlock victim".into(),
            }),
            Ok(three_rows()),
        ],
    );

    let started = Instant::now();
    let page = service
        .get_top_queries(&TopQueriesFilter::default(), &never, None)
        .await
        .unwrap();

    assert_eq!(page.source, DataSource::HistoricalStore);
    assert!(page.fallback_reason.is_none());
    assert_eq!(transport.calls(TOP_HISTORICAL), 3);
    assert_eq!(transport.calls(TOP_LIVE), 0);
    assert!(started.elapsed() >= Duration::from_millis(1_500));
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_falls_back_once() {
    let (transport, service) = setup(16);
    transport.reply(
        TOP_HISTORICAL,
        vec![Err(TransportError::Engine {
            code: Some(208),
            message: "Invalid object name".into(),
        })],
    );
    transport.reply(TOP_LIVE, vec![Ok(three_rows())]);

    let started = Instant::now();
    let page = service
        .get_top_queries(&TopQueriesFilter::default(), &never, None)
        .await
        .unwrap();

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(transport.calls(TOP_HISTORICAL), 1);
    assert_eq!(transport.calls(TOP_LIVE), 1);
    assert_eq!(page.source, DataSource::LiveViews);
    assert!(page.queries.iter().all(|q| q.source == DataSource::LiveViews));
    assert!(page.fallback_reason.unwrap().contains("source-query-error"));
}

#[tokio::test(start_paused = true)]
async fn test_fallback_failure_is_reported() {
    let (transport, service) = setup(16);
    transport.reply(
        TOP_HISTORICAL,
        vec![Err(TransportError::Engine {
            code: Some(208),
            message: "Invalid object name".into(),
        })],
    );
    transport.reply(
        TOP_LIVE,
        vec![Err(TransportError::PermissionDenied(
            "denied on object dm_exec_query_stats".into(),
        ))],
    );

    let err = service
        .get_top_queries(&TopQueriesFilter::default(), &never, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
    assert_eq!(transport.calls(TOP_LIVE), 1);
    assert!(!err.user_message().contains("dm_exec_query_stats"));

    let snap = service.observability();
    assert_eq!(snap.errors, 1);
    assert_eq!(snap.success_rate, Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn test_bad_rows_repaired_with_warnings() {
    let (transport, service) = setup(16);
    transport.reply(
        TOP_HISTORICAL,
        vec![Ok(vec![
            row(json!({"query_id": 1, "query_hash": "0x01", "avg_duration_ms": -5, "execution_count": 2})),
            row(json!({"query_text": "SELECT 1"})),
        ])],
    );

    let page = service
        .get_top_queries(&TopQueriesFilter::default(), &never, None)
        .await
        .unwrap();
    assert_eq!(page.queries.len(), 1);
    assert_eq!(page.queries[0].avg_duration_ms, 0.0);
    assert_eq!(page.warnings.len(), 2);
    assert!(page.warnings.iter().any(|w| w.contains("avg_duration_ms")));
    assert!(page.warnings.iter().any(|w| w.contains("skipped")));
}

#[tokio::test(start_paused = true)]
async fn test_post_filter_recounts_total() {
    let (transport, service) = setup(16);
    transport.reply(TOP_HISTORICAL, vec![Ok(three_rows())]);

    let filter = TopQueriesFilter {
        min_executions: Some(5),
        offset: 20,
        ..Default::default()
    };
    let page = service.get_top_queries(&filter, &never, None).await.unwrap();
    assert_eq!(page.queries.len(), 2);
    assert_eq!(page.total_count, 22);
}

#[tokio::test(start_paused = true)]
async fn test_limit_keeps_source_total() {
    let (transport, service) = setup(16);
    transport.reply(TOP_HISTORICAL, vec![Ok(three_rows())]);

    let filter = TopQueriesFilter {
        limit: 2,
        ..Default::default()
    };
    let page = service.get_top_queries(&filter, &never, None).await.unwrap();
    assert_eq!(page.queries.len(), 2);
    assert_eq!(page.total_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_search_sees_masked_text() {
    let (transport, service) = setup(16);
    transport.reply(TOP_HISTORICAL, vec![Ok(three_rows())]);

    let masked = TopQueriesFilter {
        search_text: Some("SECRET".to_string()),
        ..Default::default()
    };
    let page = service.get_top_queries(&masked, &never, None).await.unwrap();
    assert!(page.queries.is_empty());

    let sensitive = TopQueriesFilter {
        include_sensitive: true,
        ..masked
    };
    let page = service.get_top_queries(&sensitive, &never, None).await.unwrap();
    assert_eq!(page.queries.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let config = ServiceConfig {
        retry: RetryPolicy {
            initial_backoff_ms: 5_000,
            ..Default::default()
        },
        ..Default::default()
    };
    let (transport, service) = setup_with(16, config);
    transport.reply(
        TOP_HISTORICAL,
        vec![Err(TransportError::Connection("connection reset".into()))],
    );

    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    tokio::spawn(async move {
        sleep(Duration::from_millis(1_250)).await;
        flag.store(true, Ordering::SeqCst);
    });

    let check = Arc::clone(&cancelled);
    let cancel = move || check.load(Ordering::SeqCst);
    let started = Instant::now();
    let err = service
        .get_top_queries(&TopQueriesFilter::default(), &cancel, None)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Cancelled));
    assert!(started.elapsed() <= Duration::from_millis(1_350));
    assert_eq!(transport.calls(TOP_HISTORICAL), 1);
    assert_eq!(transport.calls(TOP_LIVE), 0);

    let snap = service.observability();
    assert_eq!(snap.cancelled, 1);
    assert_eq!(snap.success_rate, None);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start() {
    let (transport, service) = setup(16);
    let err = service
        .get_top_queries(&TopQueriesFilter::default(), &|| true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Cancelled));
    assert_eq!(transport.calls(TOP_HISTORICAL), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cached_page_is_an_independent_copy() {
    let (transport, service) = setup(16);
    transport.reply(TOP_HISTORICAL, vec![Ok(three_rows())]);
    let filter = TopQueriesFilter::default();

    let mut first = service.get_top_queries(&filter, &never, Some("a")).await.unwrap();
    first.queries.clear();
    first.warnings.push("caller note".into());

    let second = service.get_top_queries(&filter, &never, Some("b")).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.correlation_id, "b");
    assert_eq!(second.queries.len(), 3);
    assert!(second.warnings.is_empty());
    assert_eq!(transport.calls(TOP_HISTORICAL), 1);

    let forced = TopQueriesFilter {
        force_refresh: true,
        ..Default::default()
    };
    let third = service.get_top_queries(&forced, &never, None).await.unwrap();
    assert!(!third.from_cache);
    assert_eq!(transport.calls(TOP_HISTORICAL), 2);

    advance(Duration::from_secs(31)).await;
    service.get_top_queries(&filter, &never, None).await.unwrap();
    assert_eq!(transport.calls(TOP_HISTORICAL), 3);

    let snap = service.observability();
    assert_eq!(snap.successes, 4);
    assert_eq!(snap.cache_hits, 1);
    assert_eq!(snap.source_usage[&DataSource::HistoricalStore], 4);
}

#[tokio::test(start_paused = true)]
async fn test_sensitive_requests_cached_apart() {
    let (transport, service) = setup(16);
    transport.reply(TOP_HISTORICAL, vec![Ok(three_rows())]);

    let masked = service
        .get_top_queries(&TopQueriesFilter::default(), &never, None)
        .await
        .unwrap();
    let raw = service
        .get_top_queries(
            &TopQueriesFilter {
                include_sensitive: true,
                ..Default::default()
            },
            &never,
            None,
        )
        .await
        .unwrap();

    assert!(!raw.from_cache);
    assert!(raw.queries[0].query_text.contains("'secret'"));
    assert!(!masked.queries[0].query_text.contains("secret"));
    assert_eq!(transport.calls(TOP_HISTORICAL), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_invalidates_caches() {
    let (transport, service) = setup(16);
    transport.reply(TOP_HISTORICAL, vec![Ok(three_rows())]);
    let filter = TopQueriesFilter::default();

    service.get_top_queries(&filter, &never, None).await.unwrap();
    service.refresh(false).await.unwrap();
    assert_eq!(transport.calls(STATUS), 2);
    assert_eq!(transport.version_calls(), 1);

    let page = service.get_top_queries(&filter, &never, None).await.unwrap();
    assert!(!page.from_cache);
    assert_eq!(transport.calls(TOP_HISTORICAL), 2);

    service.refresh(true).await.unwrap();
    assert_eq!(transport.version_calls(), 2);
}

// ---------------------------------------------------------------------------
// Plan documents
// ---------------------------------------------------------------------------

fn plan_row() -> Row {
    row(json!({
        "query_id": 7,
        "plan_id": 70,
        "query_hash": "0xAAAA",
        "plan_hash": "0xBBBB",
        "query_plan": PLAN_XML
    }))
}

#[tokio::test(start_paused = true)]
async fn test_plan_xml_redacted_and_indexed() {
    let (transport, service) = setup(16);
    transport.reply(PLAN_HISTORICAL, vec![Ok(vec![plan_row()])]);

    let xml = service.get_query_plan_xml(Some(7), None, false).await.unwrap();
    assert!(xml.contains(r#"ParameterCompiledValue="[REDACTED]""#));
    assert!(xml.contains(r#"ParameterRuntimeValue="[REDACTED]""#));
    assert!(!xml.contains("(42)"));

    let raw = service.get_query_plan_xml(None, Some("0xaaaa"), true).await.unwrap();
    assert_eq!(raw, PLAN_XML);
    let again = service.get_query_plan_xml(Some(7), None, true).await.unwrap();
    assert_eq!(again, PLAN_XML);
    assert_eq!(transport.calls(PLAN_HISTORICAL), 1);
    assert_eq!(transport.calls(PLAN_LIVE), 0);
}

#[tokio::test(start_paused = true)]
async fn test_plan_cache_follows_connection() {
    let (transport, service) = setup(16);
    let other_xml = PLAN_XML.replace("dbo.Orders", "dbo.Returns");
    let mut other_row = plan_row();
    other_row.insert("query_plan".to_string(), json!(other_xml));
    transport.reply(PLAN_HISTORICAL, vec![Ok(vec![plan_row()]), Ok(vec![other_row])]);

    let first = service.get_query_plan_xml(Some(7), None, true).await.unwrap();
    assert_eq!(first, PLAN_XML);

    // Query ids are local to a database.
    transport.switch_connection("server-b/db-2");
    let second = service.get_query_plan_xml(Some(7), None, true).await.unwrap();
    assert_eq!(second, other_xml);
    assert_eq!(transport.calls(PLAN_HISTORICAL), 2);
    let by_hash = service.get_query_plan_xml(None, Some("0xAAAA"), true).await.unwrap();
    assert_eq!(by_hash, other_xml);

    transport.switch_connection("server-a/db-1");
    let back = service.get_query_plan_xml(Some(7), None, true).await.unwrap();
    assert_eq!(back, PLAN_XML);
    assert_eq!(transport.calls(PLAN_HISTORICAL), 2);

    service.refresh(false).await.unwrap();
    service.get_query_plan_xml(Some(7), None, true).await.unwrap();
    assert_eq!(transport.calls(PLAN_HISTORICAL), 3);
}

#[tokio::test(start_paused = true)]
async fn test_plan_by_hash_uses_live_views() {
    let (transport, service) = setup(16);
    transport.reply(PLAN_LIVE, vec![Ok(vec![row(json!({"query_plan": PLAN_XML}))])]);

    let xml = service.get_query_plan_xml(None, Some("0xAAAA"), true).await.unwrap();
    assert_eq!(xml, PLAN_XML);
    assert_eq!(transport.calls(PLAN_HISTORICAL), 0);
    assert_eq!(transport.calls(PLAN_LIVE), 1);

    let params = transport.last_params.lock().clone().unwrap();
    assert_eq!(params["query_hash"], ParamValue::from("0xAAAA"));
}

#[tokio::test(start_paused = true)]
async fn test_plan_request_errors() {
    let (transport, service) = setup(16);
    assert!(matches!(
        service.get_query_plan_xml(None, None, false).await,
        Err(ServiceError::InvalidRequest(_))
    ));
    assert!(matches!(
        service.get_query_plan_xml(None, Some("  "), false).await,
        Err(ServiceError::InvalidRequest(_))
    ));

    transport.reply(PLAN_HISTORICAL, vec![Ok(vec![])]);
    assert!(matches!(
        service.get_query_plan_xml(Some(1), None, false).await,
        Err(ServiceError::PlanNotFound(_))
    ));

    transport.reply(
        PLAN_HISTORICAL,
        vec![Ok(vec![row(json!({"query_id": 2, "query_plan": "<ShowPlanXML><Batch></ShowPlanXML>"}))])],
    );
    let err = service.get_query_plan_xml(Some(2), None, false).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidPlanDocument(_)));

    // Rejected documents are not cached.
    service.get_query_plan_xml(Some(2), None, false).await.unwrap_err();
    assert_eq!(transport.calls(PLAN_HISTORICAL), 3);
}

#[tokio::test(start_paused = true)]
async fn test_parsed_plan_carries_ids() {
    let (transport, service) = setup(16);
    transport.reply(PLAN_HISTORICAL, vec![Ok(vec![plan_row()])]);

    let plan = service.get_query_plan(Some(7), None).await.unwrap();
    assert_eq!(plan.metadata.query_id, Some(7));
    assert_eq!(plan.metadata.plan_id, Some(70));
    assert_eq!(plan.metadata.query_hash.as_deref(), Some("0xAAAA"));
    assert_eq!(plan.operator_count(), 1);

    service.get_query_plan(Some(7), None).await.unwrap();
    assert_eq!(service.parser().cache_info().hits, 1);
    assert_eq!(transport.calls(PLAN_HISTORICAL), 1);
}

// ---------------------------------------------------------------------------
// Background refresh
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_refresher_lifecycle() {
    let (transport, service) = setup(16);
    let refresher = BackgroundRefresher::with_interval(Arc::new(service), Duration::from_secs(60));

    assert!(refresher.start());
    assert!(!refresher.start());
    assert!(refresher.is_running());

    sleep(Duration::from_secs(61)).await;
    assert_eq!(transport.calls(STATUS), 1);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.calls(STATUS), 2);

    transport.connected.store(false, Ordering::SeqCst);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.calls(STATUS), 2);

    assert!(refresher.stop().await);
    assert!(!refresher.is_running());
    assert!(!refresher.stop().await);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_the_cache() {
    let (transport, service) = setup(16);
    transport.reply(TOP_HISTORICAL, vec![Ok(three_rows())]);
    let service = Arc::new(service);

    let requests = (0..8).map(|i| {
        let service = Arc::clone(&service);
        async move {
            let filter = TopQueriesFilter {
                sort_by: if i % 2 == 0 { SortField::Cpu } else { SortField::Executions },
                ..Default::default()
            };
            service.get_top_queries(&filter, &never, None).await
        }
    });
    let pages = futures::future::join_all(requests).await;

    assert!(pages.iter().all(|page| page.is_ok()));
    let fetched = transport.calls(TOP_HISTORICAL);
    assert!((2..=8).contains(&fetched), "fetched {} times", fetched);

    let again = service
        .get_top_queries(
            &TopQueriesFilter {
                sort_by: SortField::Cpu,
                ..Default::default()
            },
            &never,
            None,
        )
        .await
        .unwrap();
    assert!(again.from_cache);
    assert_eq!(transport.calls(TOP_HISTORICAL), fetched);
}
