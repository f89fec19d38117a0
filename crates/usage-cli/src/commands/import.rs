//! Import command for loading upstream records into the local `SQLite` store.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use usage_core::record::{AllocationChangeRecord, StatusHistoryRecord};
use usage_db::Database;

use crate::ImportKind;

/// Rows read from the input and rows actually stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub read: usize,
    pub inserted: usize,
}

pub fn run<R: BufRead, W: Write>(
    reader: R,
    writer: &mut W,
    db: &mut Database,
    kind: ImportKind,
) -> Result<ImportSummary> {
    let summary = match kind {
        ImportKind::StatusHistory => {
            let records: Vec<StatusHistoryRecord> = parse_lines(reader)?;
            ImportSummary {
                read: records.len(),
                inserted: db.insert_status_history(&records)?,
            }
        }
        ImportKind::AllocationChanges => {
            let records: Vec<AllocationChangeRecord> = parse_lines(reader)?;
            ImportSummary {
                read: records.len(),
                inserted: db.insert_allocation_changes(&records)?,
            }
        }
    };

    let skipped = summary.read - summary.inserted;
    writeln!(
        writer,
        "Imported {} {} records ({skipped} duplicates skipped)",
        summary.inserted,
        kind.label()
    )?;
    Ok(summary)
}

/// Parses JSON Lines, skipping blank lines.
fn parse_lines<T: DeserializeOwned, R: BufRead>(reader: R) -> Result<Vec<T>> {
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid record on line {}", idx + 1))?;
        records.push(record);
    }
    Ok(records)
}
