// SPDX-License-Identifier: PMPL-1.0-or-later
//! PlanScope Plan
//!
//! Execution plan parsing for PlanScope.
//! Turns showplan XML documents into an owned operator tree with derived
//! cost shares, warnings and missing-index recommendations.

pub mod cache;
pub mod error;
pub mod model;
pub mod parser;
pub mod render;

pub use cache::{CacheInfo, ParseCache, DEFAULT_PARSE_CACHE_SIZE};
pub use error::PlanError;
pub use model::{
    MissingIndexRecommendation, PlanDocument, PlanMetadata, PlanOperator, PlanWarning, Severity,
    WarningKind,
};
pub use parser::{
    cost_percent, parse_document, ExecutionPlanParser, ParserConfig, MAX_OPERATOR_DEPTH,
    SHOWPLAN_NAMESPACE,
};

/// Parse a plan document without caching.
pub fn parse(document: &str) -> Result<PlanDocument, PlanError> {
    parse_document(document, &ParserConfig::default())
}

/// Check that a document is well-formed XML without building a plan.
pub fn is_well_formed(document: &str) -> bool {
    roxmltree::Document::parse(document).is_ok()
}
