// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Error types and failure classification for the performance data service.
//
// Every failure coming back from the transport is mapped to one ErrorKind.
// The kind decides whether a fetch is retried and which fixed sentence the
// user sees. Raw error text only ever reaches the logs.

use std::fmt;

use planscope_plan::PlanError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by the transport collaborator.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("query timed out: {0}")]
    Timeout(String),

    #[error("connection failure: {0}")]
    Connection(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("query cancelled")]
    Cancelled,

    /// Error raised by the engine while running the statement.
    #[error("engine error {code:?}: {message}")]
    Engine { code: Option<i32>, message: String },

    #[error("{0}")]
    Other(String),
}

/// Classified failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Cancelled,
    Timeout,
    Connection,
    Deadlock,
    Permission,
    SourceQuery,
    Unknown,
}

impl ErrorKind {
    /// Whether another attempt may succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Deadlock
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Deadlock => "deadlock",
            ErrorKind::Permission => "permission",
            ErrorKind::SourceQuery => "source-query-error",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// The one sentence shown to a user for this kind.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::Cancelled => "The request was cancelled.",
            ErrorKind::Timeout => {
                "The server took too long to respond. Try a shorter time window or fewer rows."
            }
            ErrorKind::Connection => {
                "The connection to the server was lost. Reconnect and try again."
            }
            ErrorKind::Deadlock => {
                "The request was chosen as a deadlock victim. Try again in a moment."
            }
            ErrorKind::Permission => {
                "You do not have permission to view performance data. VIEW SERVER STATE or VIEW DATABASE STATE is required."
            }
            ErrorKind::SourceQuery => {
                "The performance data source could not be read. The query store may be disabled or unavailable."
            }
            ErrorKind::Unknown => "An unexpected error occurred.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine error numbers with a known category.
const DEADLOCK_CODES: &[i32] = &[1205];
const PERMISSION_CODES: &[i32] = &[229, 230, 262, 297, 300, 916, 18456];
const TIMEOUT_CODES: &[i32] = &[-2, 1222];
const CONNECTION_CODES: &[i32] = &[-1, 53, 233, 10053, 10054, 10060];

/// Message fragments checked, in order, when the structure says nothing.
const MESSAGE_PATTERNS: &[(&str, ErrorKind)] = &[
    ("operation cancelled", ErrorKind::Cancelled),
    ("operation canceled", ErrorKind::Cancelled),
    ("cancelled by user", ErrorKind::Cancelled),
    ("deadlock victim", ErrorKind::Deadlock),
    ("deadlocked", ErrorKind::Deadlock),
    ("login failed", ErrorKind::Permission),
    ("permission denied", ErrorKind::Permission),
    ("permission was denied", ErrorKind::Permission),
    ("view server state", ErrorKind::Permission),
    ("view database state", ErrorKind::Permission),
    ("timeout expired", ErrorKind::Timeout),
    ("timed out", ErrorKind::Timeout),
    ("lock request time out", ErrorKind::Timeout),
    ("connection reset", ErrorKind::Connection),
    ("connection refused", ErrorKind::Connection),
    ("connection was closed", ErrorKind::Connection),
    ("broken pipe", ErrorKind::Connection),
    ("transport-level error", ErrorKind::Connection),
    ("network-related", ErrorKind::Connection),
    ("invalid object name", ErrorKind::SourceQuery),
    ("invalid column name", ErrorKind::SourceQuery),
    ("query store", ErrorKind::SourceQuery),
    ("incorrect syntax", ErrorKind::SourceQuery),
];

/// Map a transport failure to its kind.
///
/// The error variant decides first, then a known engine error number, then
/// the message text.
pub fn classify(error: &TransportError) -> ErrorKind {
    match error {
        TransportError::NotConnected | TransportError::Connection(_) => ErrorKind::Connection,
        TransportError::Timeout(_) => ErrorKind::Timeout,
        TransportError::PermissionDenied(_) => ErrorKind::Permission,
        TransportError::Cancelled => ErrorKind::Cancelled,
        TransportError::Engine { code, message } => code
            .and_then(classify_code)
            .or_else(|| classify_message(message))
            .unwrap_or(ErrorKind::SourceQuery),
        TransportError::Other(message) => {
            classify_message(message).unwrap_or(ErrorKind::Unknown)
        }
    }
}

fn classify_code(code: i32) -> Option<ErrorKind> {
    if DEADLOCK_CODES.contains(&code) {
        Some(ErrorKind::Deadlock)
    } else if PERMISSION_CODES.contains(&code) {
        Some(ErrorKind::Permission)
    } else if TIMEOUT_CODES.contains(&code) {
        Some(ErrorKind::Timeout)
    } else if CONNECTION_CODES.contains(&code) {
        Some(ErrorKind::Connection)
    } else {
        None
    }
}

fn classify_message(message: &str) -> Option<ErrorKind> {
    let lower = message.to_lowercase();
    MESSAGE_PATTERNS
        .iter()
        .find(|(fragment, _)| lower.contains(fragment))
        .map(|(_, kind)| *kind)
}

/// Errors returned by the performance data service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not connected to a server")]
    NotConnected,

    #[error("request cancelled")]
    Cancelled,

    #[error("{kind} failure after {attempts} attempt(s): {source}")]
    Fetch {
        kind: ErrorKind,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("plan document is not well-formed: {0}")]
    InvalidPlanDocument(String),

    #[error("no plan found for {0}")]
    PlanNotFound(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ServiceError {
    /// Classified kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::NotConnected => ErrorKind::Connection,
            ServiceError::Cancelled => ErrorKind::Cancelled,
            ServiceError::Fetch { kind, .. } => *kind,
            ServiceError::PlanNotFound(_) => ErrorKind::SourceQuery,
            ServiceError::InvalidRequest(_)
            | ServiceError::InvalidPlanDocument(_)
            | ServiceError::Plan(_)
            | ServiceError::Serialization(_) => ErrorKind::Unknown,
        }
    }

    /// A stable, non-technical message for display.
    ///
    /// Only the unknown kind carries the underlying text, since there is no
    /// better guidance to give.
    pub fn user_message(&self) -> String {
        match self {
            ServiceError::NotConnected => {
                "Not connected to a server. Connect and try again.".to_string()
            }
            ServiceError::PlanNotFound(_) => {
                "No execution plan is available for this query. It may have been evicted from the plan cache."
                    .to_string()
            }
            ServiceError::InvalidPlanDocument(_) | ServiceError::Plan(_) => {
                "The execution plan could not be read.".to_string()
            }
            other => match other.kind() {
                ErrorKind::Unknown => format!("{} ({})", ErrorKind::Unknown.user_message(), other),
                kind => kind.user_message().to_string(),
            },
        }
    }
}
