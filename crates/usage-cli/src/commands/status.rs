//! Status command for showing what the database holds.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use usage_core::record::format_timestamp;
use usage_db::Database;

pub fn run<W: Write>(writer: &mut W, db: &Database, database_path: &Path) -> Result<()> {
    let counts = db.record_counts()?;

    writeln!(writer, "Usage accounting status")?;
    writeln!(writer, "Database: {}", database_path.display())?;

    if counts.status_history == 0 && counts.allocation_changes == 0 {
        writeln!(writer, "No records stored.")?;
        return Ok(());
    }

    writeln!(writer, "Status history rows: {}", counts.status_history)?;
    writeln!(writer, "Allocation changes: {}", counts.allocation_changes)?;
    if counts.other_events > 0 {
        writeln!(writer, "Other events (ignored): {}", counts.other_events)?;
    }
    if let (Some(earliest), Some(latest)) = (counts.earliest, counts.latest) {
        writeln!(
            writer,
            "Span: {} .. {}",
            format_timestamp(earliest),
            format_timestamp(latest)
        )?;
    }

    Ok(())
}
