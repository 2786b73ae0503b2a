// SPDX-License-Identifier: PMPL-1.0-or-later
//! Human-readable rendering of a parsed plan.

use crate::model::{PlanDocument, PlanOperator};

impl PlanDocument {
    /// Render the plan as an indented EXPLAIN-style text block.
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        out.push_str("=== PlanScope Execution Plan ===\n\n");
        if let Some(text) = &self.metadata.statement_text {
            out.push_str(&format!("Statement: {}\n", text.trim()));
        }
        if let Some(kind) = &self.metadata.statement_type {
            out.push_str(&format!("Type: {}\n", kind));
        }
        out.push_str(&format!(
            "Total Cost: {:.4} | Est. Rows: {:.0} | DOP: {}\n",
            self.total_cost, self.total_estimated_rows, self.degree_of_parallelism
        ));
        if let Some(grant) = self.memory_grant_kb {
            out.push_str(&format!("Memory Grant: {} KB\n", grant));
        }

        match &self.root {
            Some(root) => {
                out.push_str("\n--- Operators ---\n");
                for op in root.flatten() {
                    render_operator(&mut out, op);
                }
            }
            None => out.push_str("\n(no operator tree)\n"),
        }

        let warnings = self.all_warnings();
        if !warnings.is_empty() {
            out.push_str("\n--- Warnings ---\n");
            for warning in warnings {
                out.push_str(&format!("  * {}\n", warning));
            }
        }

        if !self.missing_indexes.is_empty() {
            out.push_str("\n--- Missing Indexes ---\n");
            for index in &self.missing_indexes {
                out.push_str(&format!(
                    "  * (impact {:.1}%) {}\n",
                    index.impact, index.create_statement
                ));
            }
        }

        out
    }
}

fn render_operator(out: &mut String, op: &PlanOperator) {
    let indent = "  ".repeat(op.depth as usize + 1);
    out.push_str(&format!("{}[{}] {}", indent, op.id, op.physical_op));
    if !op.logical_op.is_empty() && op.logical_op != op.physical_op {
        out.push_str(&format!(" ({})", op.logical_op));
    }
    if let Some(object) = op.object_name() {
        out.push_str(&format!(" on {}", object));
    }
    out.push_str(&format!(
        "  cost={:.1}% rows={:.0}",
        op.cost_percent, op.estimated_rows
    ));
    if let Some(actual) = op.actual_rows {
        out.push_str(&format!(" actual={}", actual));
    }
    if op.parallel {
        out.push_str(&format!(" dop={}", op.degree_of_parallelism));
    }
    if op.spills_to_temp {
        out.push_str(" SPILL");
    }
    out.push('\n');

    if let Some(seek) = &op.seek_predicate {
        out.push_str(&format!("{}    seek: {}\n", indent, seek));
    }
    if let Some(filter) = &op.filter_predicate {
        out.push_str(&format!("{}    filter: {}\n", indent, filter));
    }
}
