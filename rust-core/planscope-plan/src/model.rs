// SPDX-License-Identifier: PMPL-1.0-or-later
//! Parsed plan document types.
//!
//! A [`PlanDocument`] owns its whole operator tree. Parents own their
//! children; a child refers back to its parent only by id, so the tree can be
//! cloned freely and a clone never shares state with the original.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PlanError;

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Severity of a plan warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

impl FromStr for Severity {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            _ => Err(PlanError::UnknownSeverity(s.to_string())),
        }
    }
}

/// Kind of a plan warning.
///
/// The first eight kinds are reported by the engine inside operator or
/// statement `Warnings` blocks. `TableScan` and `KeyLookup` are synthesized
/// at document level from the shape of the operator tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarningKind {
    NoJoinPredicate,
    MissingStatistics,
    SpillToTemp,
    ImplicitConversion,
    UnmatchedIndex,
    MissingIndexGroup,
    MemoryGrant,
    Wait,
    TableScan,
    KeyLookup,
}

impl WarningKind {
    /// Map a showplan warning element (or boolean attribute) name to a kind.
    ///
    /// Returns `None` for names outside the closed set.
    pub fn from_showplan_name(name: &str) -> Option<Self> {
        match name {
            "NoJoinPredicate" => Some(WarningKind::NoJoinPredicate),
            "ColumnsWithNoStatistics" | "ColumnsWithStaleStatistics" => {
                Some(WarningKind::MissingStatistics)
            }
            "SpillToTempDb" | "SpillOccurred" | "HashSpillDetails" | "SortSpillDetails"
            | "ExchangeSpillDetails" => Some(WarningKind::SpillToTemp),
            "PlanAffectingConvert" => Some(WarningKind::ImplicitConversion),
            "UnmatchedIndexes" => Some(WarningKind::UnmatchedIndex),
            "MemoryGrantWarning" => Some(WarningKind::MemoryGrant),
            "Wait" => Some(WarningKind::Wait),
            _ => None,
        }
    }

    /// Default severity attached when the engine does not say otherwise.
    pub fn default_severity(self) -> Severity {
        match self {
            WarningKind::NoJoinPredicate => Severity::Error,
            WarningKind::MissingStatistics
            | WarningKind::SpillToTemp
            | WarningKind::ImplicitConversion
            | WarningKind::MissingIndexGroup
            | WarningKind::MemoryGrant
            | WarningKind::TableScan => Severity::Warning,
            WarningKind::UnmatchedIndex | WarningKind::Wait | WarningKind::KeyLookup => {
                Severity::Info
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WarningKind::NoJoinPredicate => "no-join-predicate",
            WarningKind::MissingStatistics => "missing-statistics",
            WarningKind::SpillToTemp => "spill-to-temp",
            WarningKind::ImplicitConversion => "implicit-conversion",
            WarningKind::UnmatchedIndex => "unmatched-index",
            WarningKind::MissingIndexGroup => "missing-index-group",
            WarningKind::MemoryGrant => "memory-grant",
            WarningKind::Wait => "wait",
            WarningKind::TableScan => "table-scan",
            WarningKind::KeyLookup => "key-lookup",
        }
    }
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WarningKind {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "no-join-predicate" => Ok(WarningKind::NoJoinPredicate),
            "missing-statistics" => Ok(WarningKind::MissingStatistics),
            "spill-to-temp" => Ok(WarningKind::SpillToTemp),
            "implicit-conversion" => Ok(WarningKind::ImplicitConversion),
            "unmatched-index" => Ok(WarningKind::UnmatchedIndex),
            "missing-index-group" => Ok(WarningKind::MissingIndexGroup),
            "memory-grant" => Ok(WarningKind::MemoryGrant),
            "wait" => Ok(WarningKind::Wait),
            "table-scan" => Ok(WarningKind::TableScan),
            "key-lookup" => Ok(WarningKind::KeyLookup),
            _ => Err(PlanError::UnknownWarningKind(s.to_string())),
        }
    }
}

/// A single warning attached to an operator or to the whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanWarning {
    pub kind: WarningKind,
    pub message: String,
    pub severity: Severity,
}

impl PlanWarning {
    /// Create a warning with the kind's default severity.
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            severity: kind.default_severity(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

impl fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

/// One node of the operator tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOperator {
    /// Pre-order index; matches document order.
    pub id: u32,
    /// Id of the owning operator, `None` for the root.
    pub parent_id: Option<u32>,
    /// Distance from the root (root = 0).
    pub depth: u32,
    pub physical_op: String,
    pub logical_op: String,
    /// `EstimatedTotalSubtreeCost` as reported for this operator.
    pub estimated_cost: f64,
    pub cpu_cost: f64,
    pub io_cost: f64,
    /// Share of the root's subtree cost, in `[0, 100]`.
    pub cost_percent: f64,
    pub estimated_rows: f64,
    /// Actual rows summed over all threads, when runtime counters are present.
    pub actual_rows: Option<u64>,
    pub avg_row_size: f64,
    pub parallel: bool,
    pub degree_of_parallelism: u32,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub index: Option<String>,
    /// Lossy summary of the seek predicate (columns and constants).
    pub seek_predicate: Option<String>,
    /// Lossy summary of the residual filter predicate.
    pub filter_predicate: Option<String>,
    pub memory_grant_kb: Option<u64>,
    pub spills_to_temp: bool,
    pub children: Vec<PlanOperator>,
    pub warnings: Vec<PlanWarning>,
}

impl PlanOperator {
    /// An operator with the given names and everything else zeroed.
    pub fn new(id: u32, physical_op: impl Into<String>, logical_op: impl Into<String>) -> Self {
        Self {
            id,
            parent_id: None,
            depth: 0,
            physical_op: physical_op.into(),
            logical_op: logical_op.into(),
            estimated_cost: 0.0,
            cpu_cost: 0.0,
            io_cost: 0.0,
            cost_percent: 0.0,
            estimated_rows: 0.0,
            actual_rows: None,
            avg_row_size: 0.0,
            parallel: false,
            degree_of_parallelism: 1,
            database: None,
            schema: None,
            table: None,
            index: None,
            seek_predicate: None,
            filter_predicate: None,
            memory_grant_kb: None,
            spills_to_temp: false,
            children: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Cost attributable to this operator alone (subtree minus children).
    pub fn own_cost(&self) -> f64 {
        let children: f64 = self.children.iter().map(|c| c.estimated_cost).sum();
        (self.estimated_cost - children).max(0.0)
    }

    /// Whether this operator reads a whole table or index.
    pub fn is_scan(&self) -> bool {
        self.physical_op.ends_with("Scan") && self.physical_op != "Constant Scan"
    }

    /// Whether this operator is a bookmark (key or RID) lookup.
    pub fn is_lookup(&self) -> bool {
        self.physical_op.contains("Lookup") || self.logical_op.contains("Lookup")
    }

    /// `schema.table.index`, skipping the parts that are absent.
    pub fn object_name(&self) -> Option<String> {
        let parts: Vec<&str> = [&self.schema, &self.table, &self.index]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("."))
        }
    }

    /// Pre-order walk of this operator and its descendants.
    pub fn flatten(&self) -> Vec<&PlanOperator> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(op) = stack.pop() {
            out.push(op);
            for child in op.children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Missing indexes
// ---------------------------------------------------------------------------

/// Index names longer than this are cut; identifiers are limited to 128.
const MAX_INDEX_NAME_LEN: usize = 128;

/// An index suggested by the engine for the statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingIndexRecommendation {
    pub database: Option<String>,
    pub schema: Option<String>,
    pub table: String,
    /// Estimated cost reduction, in `[0, 100]`.
    pub impact: f64,
    pub equality_columns: Vec<String>,
    pub inequality_columns: Vec<String>,
    pub include_columns: Vec<String>,
    pub create_statement: String,
}

impl MissingIndexRecommendation {
    pub fn new(
        database: Option<String>,
        schema: Option<String>,
        table: impl Into<String>,
        impact: f64,
        equality_columns: Vec<String>,
        inequality_columns: Vec<String>,
        include_columns: Vec<String>,
    ) -> Self {
        let impact = if impact.is_finite() {
            impact.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let mut rec = Self {
            database,
            schema,
            table: table.into(),
            impact,
            equality_columns,
            inequality_columns,
            include_columns,
            create_statement: String::new(),
        };
        rec.create_statement = rec.build_create_statement();
        rec
    }

    /// Key columns in index order: equality first, then inequality.
    pub fn key_columns(&self) -> Vec<&str> {
        self.equality_columns
            .iter()
            .chain(self.inequality_columns.iter())
            .map(String::as_str)
            .collect()
    }

    /// Render the CREATE INDEX statement.
    ///
    /// Deterministic for a given set of column lists. When there are no key
    /// columns at all, the include columns become the key.
    pub fn build_create_statement(&self) -> String {
        let mut keys = self.key_columns();
        let mut includes: Vec<&str> = self.include_columns.iter().map(String::as_str).collect();
        if keys.is_empty() {
            keys = std::mem::take(&mut includes);
        }

        let mut name = format!("IX_{}", self.table);
        for col in &keys {
            name.push('_');
            name.push_str(col);
        }
        if name.len() > MAX_INDEX_NAME_LEN {
            let mut cut = MAX_INDEX_NAME_LEN;
            while !name.is_char_boundary(cut) {
                cut -= 1;
            }
            name.truncate(cut);
        }

        let target = [&self.database, &self.schema]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .chain(std::iter::once(self.table.as_str()))
            .map(bracket)
            .collect::<Vec<_>>()
            .join(".");

        let mut stmt = format!(
            "CREATE NONCLUSTERED INDEX {} ON {} ({})",
            bracket(&name),
            target,
            bracket_list(&keys)
        );
        if !includes.is_empty() {
            stmt.push_str(&format!(" INCLUDE ({})", bracket_list(&includes)));
        }
        stmt.push(';');
        stmt
    }
}

fn bracket(name: &str) -> String {
    format!("[{}]", name)
}

fn bracket_list(names: &[&str]) -> String {
    names.iter().map(|n| bracket(n)).collect::<Vec<_>>().join(", ")
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Statement-level metadata of a plan document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    /// Historical-store plan id, filled in by whoever fetched the document.
    pub plan_id: Option<i64>,
    /// Historical-store query id, filled in by whoever fetched the document.
    pub query_id: Option<i64>,
    pub query_hash: Option<String>,
    pub plan_hash: Option<String>,
    pub statement_text: Option<String>,
    pub statement_type: Option<String>,
    pub optimization_level: Option<String>,
    pub early_abort_reason: Option<String>,
    pub compile_time_ms: Option<u64>,
    pub compile_cpu_ms: Option<u64>,
    pub compile_memory_kb: Option<u64>,
    pub cached_plan_size_kb: Option<u64>,
}

/// A fully parsed execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDocument {
    pub metadata: PlanMetadata,
    pub root: Option<PlanOperator>,
    pub total_cost: f64,
    pub total_estimated_rows: f64,
    pub degree_of_parallelism: u32,
    /// Statement memory grant (`SerialDesiredMemory`), in KB.
    pub memory_grant_kb: Option<u64>,
    /// Statement-level and synthesized warnings.
    pub warnings: Vec<PlanWarning>,
    pub missing_indexes: Vec<MissingIndexRecommendation>,
    /// The document text exactly as parsed.
    pub raw_xml: String,
}

impl PlanDocument {
    /// A document with no statement and no operators.
    pub fn empty(raw_xml: impl Into<String>) -> Self {
        Self {
            metadata: PlanMetadata::default(),
            root: None,
            total_cost: 0.0,
            total_estimated_rows: 0.0,
            degree_of_parallelism: 1,
            memory_grant_kb: None,
            warnings: Vec::new(),
            missing_indexes: Vec::new(),
            raw_xml: raw_xml.into(),
        }
    }

    /// All operators in pre-order (document order).
    pub fn flatten(&self) -> Vec<&PlanOperator> {
        self.root.as_ref().map(PlanOperator::flatten).unwrap_or_default()
    }

    pub fn operator_count(&self) -> usize {
        self.flatten().len()
    }

    pub fn find_operator(&self, id: u32) -> Option<&PlanOperator> {
        self.flatten().into_iter().find(|op| op.id == id)
    }

    /// Parent of the operator with `id`, resolved through `parent_id`.
    pub fn parent_of(&self, id: u32) -> Option<&PlanOperator> {
        let parent_id = self.find_operator(id)?.parent_id?;
        self.find_operator(parent_id)
    }

    /// The `n` operators with the highest own cost, most expensive first.
    pub fn most_expensive(&self, n: usize) -> Vec<&PlanOperator> {
        let mut ops = self.flatten();
        ops.sort_by(|a, b| {
            b.own_cost()
                .partial_cmp(&a.own_cost())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ops.truncate(n);
        ops
    }

    /// Every warning in the document: document level first, then per operator.
    pub fn all_warnings(&self) -> Vec<&PlanWarning> {
        self.warnings
            .iter()
            .chain(self.flatten().into_iter().flat_map(|op| op.warnings.iter()))
            .collect()
    }

    pub fn has_spills(&self) -> bool {
        self.flatten().iter().any(|op| op.spills_to_temp)
    }

    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> Result<String, PlanError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for PlanDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PlanDocument(type={}, operators={}, cost={:.4}, warnings={}, missing_indexes={})",
            self.metadata.statement_type.as_deref().unwrap_or("?"),
            self.operator_count(),
            self.total_cost,
            self.warnings.len(),
            self.missing_indexes.len()
        )
    }
}
