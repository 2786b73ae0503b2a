// SPDX-License-Identifier: PMPL-1.0-or-later
//! Plan parsing error types.

use thiserror::Error;

/// Errors that can occur while parsing an execution plan document.
///
/// Absence of diagnostic data (no statement, no operator tree) is not an
/// error; only documents that cannot be read at all end up here.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("malformed plan document: {0}")]
    Malformed(#[from] roxmltree::Error),

    #[error("operator tree exceeds maximum depth of {0}")]
    TooDeep(u32),

    #[error("unknown warning kind: {0}")]
    UnknownWarningKind(String),

    #[error("unknown severity: {0}")]
    UnknownSeverity(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
