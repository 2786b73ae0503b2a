// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Transport seam for the performance data service.
//
// The service never speaks a wire protocol. It hands parameterized SQL text
// to a `QueryTransport` and reads rows back as loosely typed maps, which are
// turned into typed records at the sanitation boundary.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// One result row, keyed by column name.
pub type Row = HashMap<String, serde_json::Value>;

/// Named statement parameters, in stable order.
pub type Params = BTreeMap<String, ParamValue>;

/// A value bound to a named statement parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::Int(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ParamValue::Null)
    }
}

/// Connection to the database engine.
///
/// Implementations must be safe to share across threads and tokio tasks.
/// Each call is bounded by the implementation's own timeout.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    /// Whether a live connection exists right now.
    fn is_connected(&self) -> bool;

    /// Identity of the current connection (server, database, login).
    ///
    /// Connection-scoped caches are keyed by this value.
    fn connection_id(&self) -> String;

    /// Run a parameterized statement and return every row.
    async fn execute_query(&self, sql: &str, params: &Params) -> Result<Vec<Row>, TransportError>;

    /// Major version of the connected engine.
    async fn engine_major_version(&self) -> Result<u32, TransportError>;

    /// Ask the engine to cancel the statement in flight.
    ///
    /// Returns `true` if a statement was cancelled.
    async fn cancel_active_query(&self) -> bool;
}
