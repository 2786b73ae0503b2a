// SPDX-License-Identifier: PMPL-1.0-or-later
//! Row sanitation and sensitive-data redaction.
//!
//! Rows arrive as loosely typed maps. This is the only place that reads
//! them: every later stage works on [`QueryStats`]. Bad values never fail a
//! page. They are clamped, skipped or truncated, and each repair adds a
//! warning to the page.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::{DataSource, Priority, QueryStats};
use crate::transport::Row;

/// Appended to text cut at the length limit.
pub const TRUNCATION_MARKER: &str = " ...[truncated]";

/// Replaces parameter values in redacted plan documents.
pub const REDACTED: &str = "[REDACTED]";

/// Replaces string literals in masked query text.
const MASKED_LITERAL: &str = "'?'";

/// Rows turned into records, plus what had to be repaired on the way.
#[derive(Debug, Clone, Default)]
pub struct SanitizedRows {
    pub queries: Vec<QueryStats>,
    pub warnings: Vec<String>,
    /// `total_count` reported by the source, if any row carried one.
    pub reported_total: Option<u64>,
}

/// Turn raw rows into records.
///
/// `max_text_len` bounds the query text in characters, marker included.
/// With `include_sensitive` false, string literals in the text are masked.
pub fn sanitize_rows(
    rows: &[Row],
    source: DataSource,
    max_text_len: usize,
    include_sensitive: bool,
) -> SanitizedRows {
    let mut out = SanitizedRows::default();

    for (index, row) in rows.iter().enumerate() {
        if out.reported_total.is_none() {
            out.reported_total = read_u64(row, "total_count");
        }

        let query_id = read_i64(row, "query_id");
        let reported_hash = read_string(row, "query_hash");
        if query_id.is_none() && reported_hash.is_none() {
            out.warnings
                .push(format!("Row {}: skipped, no query id or query hash", index));
            continue;
        }
        let label = match (&query_id, &reported_hash) {
            (Some(id), _) => format!("query {}", id),
            (None, Some(hash)) => format!("query {}", hash),
            (None, None) => format!("row {}", index),
        };

        let raw_text = read_string(row, "query_text").unwrap_or_default();
        let (query_hash, hash_is_synthetic) = match reported_hash {
            Some(hash) => (hash, false),
            None => {
                let basis = if raw_text.is_empty() {
                    query_id.map(|id| id.to_string()).unwrap_or_default()
                } else {
                    raw_text.clone()
                };
                (synthetic_hash(&basis), true)
            }
        };

        let text = if include_sensitive {
            raw_text
        } else {
            mask_literals(&raw_text)
        };
        let (query_text, text_truncated) = truncate_text(&text, max_text_len);
        if text_truncated {
            out.warnings.push(format!(
                "{}: query text truncated to {} characters",
                label, max_text_len
            ));
        }

        let mut number = |field: &str| non_negative(row, field, &label, &mut out.warnings);
        let execution_count = number("execution_count").round() as u64;
        let avg_duration_ms = number("avg_duration_ms");
        let total_duration_ms = number("total_duration_ms");
        let avg_cpu_ms = number("avg_cpu_ms");
        let avg_logical_reads = number("avg_logical_reads");
        let avg_memory_grant_kb = number("avg_memory_grant_kb");

        out.queries.push(QueryStats {
            query_id,
            query_hash,
            hash_is_synthetic,
            plan_hash: read_string(row, "plan_hash"),
            plan_id: read_i64(row, "plan_id"),
            query_text,
            text_truncated,
            execution_count,
            avg_duration_ms,
            total_duration_ms,
            avg_cpu_ms,
            avg_logical_reads,
            avg_memory_grant_kb,
            last_execution_time: read_timestamp(row, "last_execution_time"),
            priority: Priority::from_avg_duration_ms(avg_duration_ms),
            source,
        });
    }

    out
}

/// Read a numeric field as a non-negative finite number.
///
/// Missing and null values read as zero silently; negative or unreadable
/// values read as zero with a warning.
fn non_negative(row: &Row, field: &str, label: &str, warnings: &mut Vec<String>) -> f64 {
    let value = match row.get(field) {
        None | Some(Value::Null) => return 0.0,
        Some(value) => value,
    };
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() && v >= 0.0 => v,
        Some(v) => {
            warnings.push(format!("{}: {} was {}, clamped to 0", label, field, v));
            0.0
        }
        None => {
            warnings.push(format!(
                "{}: {} could not be read ({}), set to 0",
                label, field, value
            ));
            0.0
        }
    }
}

pub(crate) fn read_string(row: &Row, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn read_i64(row: &Row, field: &str) -> Option<i64> {
    match row.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn read_u64(row: &Row, field: &str) -> Option<u64> {
    match row.get(field)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn read_timestamp(row: &Row, field: &str) -> Option<DateTime<Utc>> {
    let Value::String(s) = row.get(field)? else {
        return None;
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Stable stand-in for a missing query hash.
pub fn synthetic_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{:02X}", b)).collect();
    format!("0x{}", hex)
}

/// Cut `text` to `max_len` characters, marker included.
pub fn truncate_text(text: &str, max_len: usize) -> (String, bool) {
    if text.chars().count() <= max_len {
        return (text.to_string(), false);
    }
    let keep = max_len.saturating_sub(TRUNCATION_MARKER.chars().count());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    (out, true)
}

/// Replace every quoted string literal in SQL text with `'?'`.
///
/// Handles doubled quotes inside a literal and the `N` prefix.
pub fn mask_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\'' {
            out.push(c);
            continue;
        }
        if out.ends_with(['N', 'n']) {
            let before = out[..out.len() - 1].chars().last();
            if !before.is_some_and(|b| b.is_alphanumeric() || b == '_') {
                out.pop();
            }
        }
        // Consume up to the closing quote; '' is an escaped quote.
        loop {
            match chars.next() {
                Some('\'') if chars.peek() == Some(&'\'') => {
                    chars.next();
                }
                Some('\'') | None => break,
                Some(_) => {}
            }
        }
        out.push_str(MASKED_LITERAL);
    }
    out
}

fn parameter_value_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"\b(ParameterCompiledValue|ParameterRuntimeValue)="[^"]*""#)
            .expect("parameter value pattern is valid")
    })
}

/// Replace sniffed and runtime parameter values in a plan document.
pub fn redact_plan_parameters(xml: &str) -> String {
    parameter_value_pattern()
        .replace_all(xml, format!(r#"$1="{}""#, REDACTED).as_str())
        .into_owned()
}
