// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Showplan document parser.
//!
//! Turns a showplan XML document into a [`PlanDocument`]. Producers are not
//! consistent about namespaces: some declare the showplan namespace, some emit
//! bare element names. Every element lookup therefore tries the namespaced
//! name first and falls back to the local name. Producers also disagree on
//! where an operator's inputs live: directly under the `RelOp`, or deeper
//! under the operator-specific element (`<NestedLoops>`, `<Hash>`, ...) or a
//! scalar subquery. The nearest `RelOp` on every path is an input, taken once.
//!
//! Parsing is pure. The only state is the content-addressed parse cache owned
//! by [`ExecutionPlanParser`].

use parking_lot::Mutex;
use roxmltree::Node;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheInfo, ParseCache, DEFAULT_PARSE_CACHE_SIZE};
use crate::error::PlanError;
use crate::model::{
    MissingIndexRecommendation, PlanDocument, PlanOperator, PlanWarning, WarningKind,
};

/// Namespace declared by conforming showplan producers.
pub const SHOWPLAN_NAMESPACE: &str = "http://schemas.microsoft.com/sqlserver/2004/07/showplan";

/// Deepest operator nesting accepted before the document is rejected.
pub const MAX_OPERATOR_DEPTH: u32 = 256;

const TRUNCATION_MARKER: &str = "...";

/// Parser configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Number of parsed documents kept in the parse cache.
    /// Default: 50.
    pub cache_size: usize,
    /// Longest predicate summary kept, in characters, marker included.
    /// Default: 256.
    pub max_predicate_len: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_PARSE_CACHE_SIZE,
            max_predicate_len: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionPlanParser
// ---------------------------------------------------------------------------

/// Parses plan documents and caches the results by content hash.
///
/// Safe to share between threads; the cache mutex is held only while the map
/// is read or written, never while a document is being parsed.
pub struct ExecutionPlanParser {
    config: ParserConfig,
    cache: Mutex<ParseCache>,
}

impl ExecutionPlanParser {
    pub fn new(config: ParserConfig) -> Self {
        let cache = Mutex::new(ParseCache::new(config.cache_size));
        Self { config, cache }
    }

    pub fn with_defaults() -> Self {
        Self::new(ParserConfig::default())
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Parse a plan document, serving repeats from the cache.
    ///
    /// The returned document is always the caller's own copy.
    pub fn parse(&self, document: &str) -> Result<PlanDocument, PlanError> {
        let key = ParseCache::fingerprint(document);

        let cached = self.cache.lock().get(&key);
        if let Some(plan) = cached {
            debug!(fingerprint = &key[..12], "Plan parse cache hit");
            return Ok(plan);
        }

        let plan = parse_document(document, &self.config)?;
        debug!(
            fingerprint = &key[..12],
            operators = plan.operator_count(),
            warnings = plan.warnings.len(),
            "Parsed plan document"
        );
        self.cache.lock().insert(key, plan.clone());
        Ok(plan)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn cache_info(&self) -> CacheInfo {
        self.cache.lock().info()
    }
}

impl Default for ExecutionPlanParser {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Document walk
// ---------------------------------------------------------------------------

/// Parse a document without touching any cache.
///
/// Malformed XML is an error. A well-formed document without a statement or
/// without an operator tree yields a document with those parts left empty.
pub fn parse_document(document: &str, config: &ParserConfig) -> Result<PlanDocument, PlanError> {
    let xml = roxmltree::Document::parse(document)?;
    let mut plan = PlanDocument::empty(document);

    let Some(statement) = find_element(xml.root(), "StmtSimple") else {
        debug!("Plan document has no statement element");
        return Ok(plan);
    };
    read_statement(statement, &mut plan);

    let query_plan = find_element(statement, "QueryPlan");
    if let Some(qp) = query_plan {
        read_query_plan(qp, &mut plan);
    }
    plan.missing_indexes = read_missing_indexes(statement);

    if let Some(root) = query_plan.and_then(root_operator) {
        let mut builder = TreeBuilder {
            next_id: 0,
            root_cost: attr_f64(root, "EstimatedTotalSubtreeCost"),
            dop: plan.degree_of_parallelism,
            config,
        };
        let root = builder.build(root, 0, None)?;
        if plan.total_cost <= 0.0 {
            plan.total_cost = root.estimated_cost;
        }
        if plan.total_estimated_rows <= 0.0 {
            plan.total_estimated_rows = root.estimated_rows;
        }
        plan.root = Some(root);
    }

    let synthesized = synthesize_document_warnings(&plan);
    plan.warnings.extend(synthesized);
    Ok(plan)
}

fn read_statement(statement: Node<'_, '_>, plan: &mut PlanDocument) {
    let meta = &mut plan.metadata;
    meta.statement_text = attr_string(statement, "StatementText");
    meta.statement_type = attr_string(statement, "StatementType");
    meta.query_hash = attr_string(statement, "QueryHash");
    meta.plan_hash = attr_string(statement, "QueryPlanHash");
    meta.optimization_level = attr_string(statement, "StatementOptmLevel");
    meta.early_abort_reason = attr_string(statement, "StatementOptmEarlyAbortReason");
    plan.total_cost = attr_f64(statement, "StatementSubTreeCost");
    plan.total_estimated_rows = attr_f64(statement, "StatementEstRows");
}

fn read_query_plan(qp: Node<'_, '_>, plan: &mut PlanDocument) {
    plan.degree_of_parallelism = attr_u64(qp, "DegreeOfParallelism")
        .map(|dop| u32::try_from(dop.max(1)).unwrap_or(u32::MAX))
        .unwrap_or(1);

    let meta = &mut plan.metadata;
    meta.compile_time_ms = attr_u64(qp, "CompileTime");
    meta.compile_cpu_ms = attr_u64(qp, "CompileCPU");
    meta.compile_memory_kb = attr_u64(qp, "CompileMemory");
    meta.cached_plan_size_kb = attr_u64(qp, "CachedPlanSize");

    plan.memory_grant_kb = qp
        .children()
        .find(|n| has_local_name(*n, "MemoryGrantInfo") || has_local_name(*n, "MemoryGrant"))
        .and_then(|grant| attr_u64(grant, "SerialDesiredMemory"));

    if let Some(block) = qp.children().find(|n| has_local_name(*n, "Warnings")) {
        let (warnings, _) = read_warnings(block);
        plan.warnings.extend(warnings);
    }
}

/// The top `RelOp` of a query plan: a direct child if there is one,
/// otherwise the first one anywhere below.
fn root_operator<'a, 'input>(qp: Node<'a, 'input>) -> Option<Node<'a, 'input>> {
    qp.children()
        .find(|n| has_local_name(*n, "RelOp"))
        .or_else(|| find_element(qp, "RelOp"))
}

fn read_missing_indexes(scope: Node<'_, '_>) -> Vec<MissingIndexRecommendation> {
    let mut out = Vec::new();
    for group in find_elements(scope, "MissingIndexGroup") {
        let impact = attr_f64(group, "Impact");
        for index in group.children().filter(|n| has_local_name(*n, "MissingIndex")) {
            let mut equality = Vec::new();
            let mut inequality = Vec::new();
            let mut include = Vec::new();

            for column_group in index.children().filter(|n| has_local_name(*n, "ColumnGroup")) {
                let columns = column_group
                    .children()
                    .filter(|n| has_local_name(*n, "Column"))
                    .filter_map(|c| c.attribute("Name"))
                    .map(|name| strip_brackets(name).to_string());
                match column_group.attribute("Usage").map(str::to_uppercase).as_deref() {
                    Some("EQUALITY") => equality.extend(columns),
                    Some("INEQUALITY") => inequality.extend(columns),
                    Some("INCLUDE") => include.extend(columns),
                    other => debug!(usage = ?other, "Ignoring missing-index column group"),
                }
            }

            out.push(MissingIndexRecommendation::new(
                index.attribute("Database").map(|v| strip_brackets(v).to_string()),
                index.attribute("Schema").map(|v| strip_brackets(v).to_string()),
                strip_brackets(index.attribute("Table").unwrap_or_default()),
                impact,
                equality,
                inequality,
                include,
            ));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Operator tree
// ---------------------------------------------------------------------------

struct TreeBuilder<'c> {
    /// Pre-order counter.
    next_id: u32,
    /// Root `EstimatedTotalSubtreeCost`; denominator for every `cost_percent`.
    root_cost: f64,
    dop: u32,
    config: &'c ParserConfig,
}

impl TreeBuilder<'_> {
    fn build(
        &mut self,
        node: Node<'_, '_>,
        depth: u32,
        parent_id: Option<u32>,
    ) -> Result<PlanOperator, PlanError> {
        if depth > MAX_OPERATOR_DEPTH {
            return Err(PlanError::TooDeep(MAX_OPERATOR_DEPTH));
        }

        let id = self.next_id;
        self.next_id += 1;

        let mut op = PlanOperator::new(
            id,
            node.attribute("PhysicalOp").unwrap_or_default(),
            node.attribute("LogicalOp").unwrap_or_default(),
        );
        op.parent_id = parent_id;
        op.depth = depth;
        op.estimated_cost = attr_f64(node, "EstimatedTotalSubtreeCost");
        op.cpu_cost = attr_f64(node, "EstimateCPU");
        op.io_cost = attr_f64(node, "EstimateIO");
        op.cost_percent = cost_percent(op.estimated_cost, self.root_cost);
        op.estimated_rows = attr_f64(node, "EstimateRows");
        op.avg_row_size = attr_f64(node, "AvgRowSize");
        op.parallel = attr_bool(node, "Parallel");
        op.degree_of_parallelism = if op.parallel { self.dop.max(1) } else { 1 };
        op.actual_rows = actual_rows(node);
        op.memory_grant_kb = operator_memory_grant(node);

        if let Some(object) = find_own(node, "Object") {
            op.database = object.attribute("Database").map(|v| strip_brackets(v).to_string());
            op.schema = object.attribute("Schema").map(|v| strip_brackets(v).to_string());
            op.table = object.attribute("Table").map(|v| strip_brackets(v).to_string());
            op.index = object.attribute("Index").map(|v| strip_brackets(v).to_string());
        }

        let max_len = self.config.max_predicate_len;
        op.seek_predicate = find_own(node, "SeekPredicates")
            .map(|p| summarize_predicate(p, max_len))
            .filter(|s| !s.is_empty());
        op.filter_predicate = find_own(node, "Predicate")
            .map(|p| summarize_predicate(p, max_len))
            .filter(|s| !s.is_empty());

        if let Some(block) = find_own(node, "Warnings") {
            let (warnings, spilled) = read_warnings(block);
            op.warnings = warnings;
            op.spills_to_temp = spilled;
        }

        for child in child_operators(node) {
            let child = self.build(child, depth + 1, Some(id))?;
            op.children.push(child);
        }
        Ok(op)
    }
}

/// Share of the root cost, in `[0, 100]`; zero when the root cost is zero.
pub fn cost_percent(cost: f64, root_cost: f64) -> f64 {
    if !root_cost.is_finite() || root_cost <= 0.0 || !cost.is_finite() {
        return 0.0;
    }
    (cost / root_cost * 100.0).clamp(0.0, 100.0)
}

/// Inputs of an operator, in document order, each taken once.
///
/// Every nearest `RelOp` below the operator counts, whether it is a direct
/// child, sits under the operator-specific element, or hangs off a scalar
/// subquery inside a predicate. The search stops at each `RelOp` found.
fn child_operators<'a, 'input>(op: Node<'a, 'input>) -> Vec<Node<'a, 'input>> {
    let mut found: Vec<Node<'a, 'input>> = Vec::new();
    let mut stack: Vec<Node<'a, 'input>> = op.children().filter(|n| n.is_element()).collect();
    stack.reverse();
    while let Some(node) = stack.pop() {
        if has_local_name(node, "RelOp") {
            push_unique(&mut found, node);
            continue;
        }
        let mut children: Vec<Node<'a, 'input>> =
            node.children().filter(|n| n.is_element()).collect();
        children.reverse();
        stack.extend(children);
    }
    found
}

fn push_unique<'a, 'input>(found: &mut Vec<Node<'a, 'input>>, node: Node<'a, 'input>) {
    if !found.contains(&node) {
        found.push(node);
    }
}

/// First element named `local` that belongs to this operator, without
/// descending into nested operators.
fn find_own<'a, 'input>(op: Node<'a, 'input>, local: &str) -> Option<Node<'a, 'input>> {
    let mut stack: Vec<Node<'a, 'input>> = op.children().filter(|n| n.is_element()).collect();
    stack.reverse();
    while let Some(node) = stack.pop() {
        if has_local_name(node, "RelOp") {
            continue;
        }
        if has_local_name(node, local) {
            return Some(node);
        }
        let mut children: Vec<Node<'a, 'input>> =
            node.children().filter(|n| n.is_element()).collect();
        children.reverse();
        stack.extend(children);
    }
    None
}

fn actual_rows(op: Node<'_, '_>) -> Option<u64> {
    let runtime = find_own(op, "RunTimeInformation")?;
    let mut total: Option<u64> = None;
    for counters in runtime
        .children()
        .filter(|n| has_local_name(*n, "RunTimeCountersPerThread"))
    {
        if let Some(rows) = attr_u64(counters, "ActualRows") {
            total = Some(total.unwrap_or(0).saturating_add(rows));
        }
    }
    total
}

fn operator_memory_grant(op: Node<'_, '_>) -> Option<u64> {
    let grant = find_own(op, "MemoryGrant").or_else(|| find_own(op, "MemoryGrantInfo"))?;
    attr_u64(grant, "SerialDesiredMemory").or_else(|| attr_u64(grant, "GrantedMemory"))
}

/// Summarize a predicate sub-tree as the columns and constants it mentions.
///
/// This is a lossy summary, not an expression reconstruction: operators and
/// nesting are dropped. The result is cut to `max_len` characters with a
/// trailing marker.
pub fn summarize_predicate(predicate: Node<'_, '_>, max_len: usize) -> String {
    let mut tokens: Vec<String> = Vec::new();
    let mut stack = vec![predicate];
    while let Some(node) = stack.pop() {
        // A subquery operator summarizes its own predicates.
        if has_local_name(node, "RelOp") {
            continue;
        }
        let mut children: Vec<Node<'_, '_>> = node.children().filter(|n| n.is_element()).collect();
        children.reverse();
        stack.extend(children);

        match node.tag_name().name() {
            "ColumnReference" => {
                if let Some(column) = node.attribute("Column") {
                    let column = strip_brackets(column);
                    let token = match node.attribute("Table") {
                        Some(table) => format!("{}.{}", strip_brackets(table), column),
                        None => column.to_string(),
                    };
                    tokens.push(token);
                }
            }
            "Const" => {
                if let Some(value) = node.attribute("ConstValue") {
                    tokens.push(value.to_string());
                }
            }
            _ => {}
        }
    }
    truncate_with_marker(&tokens.join(" "), max_len)
}

fn truncate_with_marker(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let keep = max_len.saturating_sub(TRUNCATION_MARKER.len());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Read a `Warnings` block: one warning per recognised child element or
/// boolean attribute. The flag reports whether anything spilled.
fn read_warnings(block: Node<'_, '_>) -> (Vec<PlanWarning>, bool) {
    let mut warnings = Vec::new();
    let mut spilled = false;

    for attr in block.attributes() {
        if !is_true(attr.value()) {
            continue;
        }
        if attr.name().to_lowercase().contains("spill") {
            spilled = true;
        }
        if let Some(kind) = WarningKind::from_showplan_name(attr.name()) {
            warnings.push(PlanWarning::new(kind, describe_flag(kind)));
        }
    }

    for child in block.children().filter(|n| n.is_element()) {
        let name = child.tag_name().name();
        if name.to_lowercase().contains("spill") {
            spilled = true;
        }
        match WarningKind::from_showplan_name(name) {
            Some(kind) => warnings.push(PlanWarning::new(kind, describe_warning(kind, child))),
            None => debug!(element = name, "Ignoring unrecognised plan warning"),
        }
    }

    (warnings, spilled)
}

fn describe_flag(kind: WarningKind) -> String {
    match kind {
        WarningKind::NoJoinPredicate => {
            "Join has no join predicate; every row of one input matches every row of the other"
                .to_string()
        }
        WarningKind::UnmatchedIndex => {
            "A filtered index could not be used because of parameterization".to_string()
        }
        WarningKind::SpillToTemp => "Operator spilled to tempdb".to_string(),
        other => format!("Engine reported {}", other),
    }
}

fn describe_warning(kind: WarningKind, node: Node<'_, '_>) -> String {
    match kind {
        WarningKind::MissingStatistics => {
            let columns: Vec<String> = node
                .descendants()
                .filter(|n| has_local_name(*n, "ColumnReference"))
                .filter_map(|n| n.attribute("Column"))
                .map(|c| strip_brackets(c).to_string())
                .collect();
            if columns.is_empty() {
                "Statistics are missing for some columns".to_string()
            } else {
                format!("Statistics are missing for columns: {}", columns.join(", "))
            }
        }
        WarningKind::SpillToTemp => match node.attribute("SpillLevel") {
            Some(level) => format!("Operator spilled to tempdb (spill level {})", level),
            None => match node.attribute("WritesToTempDb") {
                Some(pages) => format!("Operator spilled to tempdb ({} pages written)", pages),
                None => "Operator spilled to tempdb".to_string(),
            },
        },
        WarningKind::ImplicitConversion => format!(
            "Type conversion in expression ({}) may affect {}",
            node.attribute("Expression").unwrap_or("?"),
            node.attribute("ConvertIssue").unwrap_or("plan choice")
        ),
        WarningKind::MemoryGrant => format!(
            "Memory grant warning ({}): requested {} KB, granted {} KB",
            node.attribute("GrantWarningKind").unwrap_or("unknown"),
            node.attribute("RequestedMemory").unwrap_or("?"),
            node.attribute("GrantedMemory").unwrap_or("?")
        ),
        WarningKind::Wait => format!(
            "Waited {} ms on {}",
            node.attribute("WaitTime").unwrap_or("?"),
            node.attribute("WaitType").unwrap_or("unknown wait")
        ),
        other => describe_flag(other),
    }
}

fn synthesize_document_warnings(plan: &PlanDocument) -> Vec<PlanWarning> {
    let operators = plan.flatten();
    let mut warnings = Vec::new();

    let scans: Vec<String> = operators
        .iter()
        .filter(|op| op.is_scan())
        .map(|op| describe_operator(op))
        .collect();
    if !scans.is_empty() {
        warnings.push(PlanWarning::new(
            WarningKind::TableScan,
            format!(
                "Plan contains {} scan operator(s): {}",
                scans.len(),
                scans.join("; ")
            ),
        ));
    }

    let lookups: Vec<String> = operators
        .iter()
        .filter(|op| op.is_lookup())
        .map(|op| describe_operator(op))
        .collect();
    if !lookups.is_empty() {
        warnings.push(PlanWarning::new(
            WarningKind::KeyLookup,
            format!(
                "Plan contains {} lookup operator(s); a covering index may remove them: {}",
                lookups.len(),
                lookups.join("; ")
            ),
        ));
    }

    if !plan.missing_indexes.is_empty() {
        let best = plan
            .missing_indexes
            .iter()
            .map(|m| m.impact)
            .fold(0.0_f64, f64::max);
        warnings.push(PlanWarning::new(
            WarningKind::MissingIndexGroup,
            format!(
                "Engine reported {} missing index(es); highest estimated impact {:.1}%",
                plan.missing_indexes.len(),
                best
            ),
        ));
    }

    warnings
}

fn describe_operator(op: &PlanOperator) -> String {
    match op.object_name() {
        Some(object) => format!("{} on {}", op.physical_op, object),
        None => op.physical_op.clone(),
    }
}

// ---------------------------------------------------------------------------
// Namespace-tolerant lookup helpers
// ---------------------------------------------------------------------------

fn has_local_name(node: Node<'_, '_>, local: &str) -> bool {
    node.is_element() && node.tag_name().name() == local
}

fn is_showplan_element(node: Node<'_, '_>, local: &str) -> bool {
    has_local_name(node, local) && node.tag_name().namespace() == Some(SHOWPLAN_NAMESPACE)
}

/// First descendant named `local`: namespaced match first, bare name second.
fn find_element<'a, 'input>(scope: Node<'a, 'input>, local: &str) -> Option<Node<'a, 'input>> {
    scope
        .descendants()
        .find(|n| is_showplan_element(*n, local))
        .or_else(|| scope.descendants().find(|n| has_local_name(*n, local)))
}

/// All descendants named `local`. Uses the namespaced matches if there are
/// any, the bare-name matches otherwise; never both.
fn find_elements<'a, 'input>(scope: Node<'a, 'input>, local: &str) -> Vec<Node<'a, 'input>> {
    let namespaced: Vec<Node<'a, 'input>> = scope
        .descendants()
        .filter(|n| is_showplan_element(*n, local))
        .collect();
    if !namespaced.is_empty() {
        return namespaced;
    }
    scope
        .descendants()
        .filter(|n| has_local_name(*n, local))
        .collect()
}

/// Strip `[` `]` decorations from an identifier.
pub fn strip_brackets(name: &str) -> &str {
    let name = name.trim();
    let name = name.strip_prefix('[').unwrap_or(name);
    name.strip_suffix(']').unwrap_or(name)
}

fn attr_string(node: Node<'_, '_>, name: &str) -> Option<String> {
    node.attribute(name).map(str::to_string)
}

/// Non-negative finite number, or zero.
fn attr_f64(node: Node<'_, '_>, name: &str) -> f64 {
    node.attribute(name)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(0.0)
}

fn attr_u64(node: Node<'_, '_>, name: &str) -> Option<u64> {
    node.attribute(name)?.trim().parse().ok()
}

fn attr_bool(node: Node<'_, '_>, name: &str) -> bool {
    node.attribute(name).map(is_true).unwrap_or(false)
}

fn is_true(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true")
}
