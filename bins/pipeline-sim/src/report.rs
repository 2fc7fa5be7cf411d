// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Report rendering: human-readable tables or JSON.

use std::io::Write;

use anyhow::Result;
use clap::ValueEnum;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use echo_pipeline::Timestamp;

use crate::workload::Report;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Tables for humans.
    Table,
    /// One JSON document per report.
    Json,
}

fn ms(at: Option<Timestamp>) -> String {
    at.map_or_else(|| "-".to_owned(), |t| format!("{t}ms"))
}

/// Writes `report` to `out` in `format`.
pub fn emit(out: &mut impl Write, report: &Report, format: Format) -> Result<()> {
    match format {
        Format::Json => {
            serde_json::to_writer_pretty(&mut *out, report)?;
            writeln!(out)?;
        }
        Format::Table => {
            writeln!(
                out,
                "== {} (cap {}) ==",
                report.name, report.concurrency_cap
            )?;
            writeln!(out, "{}", instruction_table(report))?;
            if !report.batches.is_empty() {
                writeln!(out, "{}", batch_table(report))?;
            }
            let s = &report.status;
            writeln!(
                out,
                "committed: {}  failed: {}  pending: {}  active: {}  parked: {}",
                s.committed_total, s.failed_total, s.pending_count, s.active_count, s.parked_count
            )?;
        }
    }
    Ok(())
}

fn instruction_table(report: &Report) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Label", "Id", "Type", "Batch", "Status", "Issued", "Responded", "Final", "Detail",
        ]);
    for row in &report.rows {
        table.add_row(vec![
            row.label.clone(),
            row.id.map_or_else(|| "-".to_owned(), |id| id.to_string()),
            row.kind.clone(),
            row.batch.clone().unwrap_or_else(|| "-".to_owned()),
            row.status
                .map_or_else(|| "REFUSED".to_owned(), |s| s.to_string()),
            ms(row.issued_at),
            ms(row.responded_at),
            ms(row.finalized_at),
            row.detail.clone(),
        ]);
    }
    table
}

fn batch_table(report: &Report) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Batch", "Mode", "Outcome"]);
    for batch in &report.batches {
        table.add_row(vec![
            batch.label.clone(),
            format!("{:?}", batch.mode).to_uppercase(),
            batch.outcome.clone(),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{BatchRow, Row};
    use echo_pipeline::{BatchMode, InstructionId, InstructionStatus, PipelineStatus};

    fn report() -> Report {
        Report {
            name: "sample".into(),
            concurrency_cap: 2,
            rows: vec![Row {
                label: "a".into(),
                id: Some(InstructionId::from_raw(1)),
                kind: "sim".into(),
                batch: None,
                status: Some(InstructionStatus::Committed),
                issued_at: Some(0),
                responded_at: Some(10),
                finalized_at: Some(10),
                detail: "null".into(),
            }],
            batches: vec![BatchRow {
                label: "tx".into(),
                mode: BatchMode::Atomic,
                outcome: "ok (0 outcomes)".into(),
            }],
            status: PipelineStatus {
                committed_total: 1,
                ..PipelineStatus::default()
            },
        }
    }

    #[test]
    fn table_lists_rows_and_counters() {
        let mut out = Vec::new();
        emit(&mut out, &report(), Format::Table).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("== sample (cap 2) =="));
        assert!(text.contains("COMMITTED"));
        assert!(text.contains("ATOMIC"));
        assert!(text.contains("committed: 1"));
    }

    #[test]
    fn json_is_machine_readable() {
        let mut out = Vec::new();
        emit(&mut out, &report(), Format::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["rows"][0]["status"], "COMMITTED");
        assert_eq!(value["status"]["committed_total"], 1);
    }
}
