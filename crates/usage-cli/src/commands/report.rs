//! Report command: replay stored records up to a cutoff and print usage.

use std::io::Write;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Args;
use usage_core::record::{format_timestamp, parse_timestamp};
use usage_core::report::{Hours, MAX_PRECISION};
use usage_core::{
    Accumulator, CancelFlag, CausalityPolicy, ReplayOptions, RollupPolicy, UsageReport, Username,
    batch_calculate, materialize, merge_sources, replay_sharded,
};
use usage_db::Database;

use crate::Config;

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Report cutoff; records after it are ignored. RFC 3339 or YYYY-MM-DD (UTC midnight).
    #[arg(long, value_parser = parse_end_date)]
    pub end_date: DateTime<Utc>,

    /// Only report this user's instances.
    #[arg(long)]
    pub username: Option<String>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,

    /// Decimal places, at most 15 (overrides config).
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=15))]
    pub precision: Option<u32>,

    /// Out-of-order allocation changes: fail or `count_and_skip` (overrides config).
    #[arg(long)]
    pub causality: Option<CausalityPolicy>,

    /// User roll-up policy: delta or `cumulative_legacy` (overrides config).
    #[arg(long)]
    pub rollup: Option<RollupPolicy>,

    /// Replay on this many parallel shards.
    #[arg(long)]
    pub shards: Option<usize>,

    /// Abort the replay after this many seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

fn parse_end_date(value: &str) -> Result<DateTime<Utc>, String> {
    if let Some(at) = parse_timestamp(value) {
        return Ok(at);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .ok_or_else(|| format!("invalid end date: {value}"))
}

/// Cancels `cancel` unless the returned sender is dropped within `timeout`.
fn spawn_watchdog(timeout: Duration, cancel: CancelFlag) -> mpsc::Sender<()> {
    let (done, finished) = mpsc::channel::<()>();
    thread::spawn(move || {
        if matches!(
            finished.recv_timeout(timeout),
            Err(mpsc::RecvTimeoutError::Timeout)
        ) {
            tracing::warn!(timeout_secs = timeout.as_secs(), "replay time limit reached");
            cancel.cancel();
        }
    });
    done
}

fn replay(db: &Database, args: &ReportArgs, config: &Config) -> Result<Accumulator> {
    let cancel = CancelFlag::new();
    let options = ReplayOptions {
        causality: args.causality.unwrap_or(config.causality),
        rollup: args.rollup.unwrap_or(config.rollup),
        cancel: Some(cancel.clone()),
    };
    let _watchdog = args
        .timeout_secs
        .map(|secs| spawn_watchdog(Duration::from_secs(secs), cancel));

    let end = args.end_date;
    let page_size = config.page_size;
    let acc = match args.shards.filter(|&shards| shards > 1) {
        Some(shards) => {
            let merged = merge_sources(
                db.allocation_changes_source(end, page_size),
                db.status_history_source(end, page_size),
                end,
            );
            let events = materialize(merged, &options).context("failed to read records")?;
            replay_sharded(&events, shards, &options)
        }
        None => batch_calculate(
            db.allocation_changes_source(end, page_size),
            db.status_history_source(end, page_size),
            end,
            &options,
        ),
    }
    .context("replay failed")?;
    Ok(acc)
}

/// Replays the database and builds the unrounded report.
pub fn generate_report(db: &Database, args: &ReportArgs, config: &Config) -> Result<UsageReport> {
    let username = args
        .username
        .as_deref()
        .map(Username::new)
        .transpose()
        .context("invalid username")?;
    let acc = replay(db, args, config)?;
    Ok(UsageReport::from_accumulator(&acc, username.as_ref()))
}

fn usage_columns(usage: Hours, precision: usize) -> String {
    let hours = usage.hours;
    let cpu_hours = usage.cpu_hours;
    format!("{hours:>10.precision$} h{cpu_hours:>12.precision$} CPU-h")
}

fn join_counts<K: std::fmt::Display>(counts: &std::collections::BTreeMap<K, u64>) -> String {
    if counts.is_empty() {
        return "(none)".to_string();
    }
    counts
        .iter()
        .map(|(key, count)| {
            let key = key.to_string();
            if key.is_empty() {
                format!("(empty)={count}")
            } else {
                format!("{key}={count}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Formats the human-readable report; `report` should already be rounded.
pub fn format_report(report: &UsageReport, precision: u32) -> String {
    let precision = usize::try_from(precision).unwrap_or(usize::MAX);
    let mut lines = Vec::new();

    let through = report
        .end_date
        .map_or_else(|| "(no events)".to_string(), format_timestamp);
    lines.push(format!("USAGE REPORT through {through}"));

    lines.push(String::new());
    lines.push("BY USER".to_string());
    lines.push("───────".to_string());
    if report.users.is_empty() {
        lines.push("No usage recorded.".to_string());
    }
    for (username, user) in &report.users {
        let burn = user.burn_rate;
        lines.push(format!(
            "{:<24}{}  burn {burn:.precision$} CPU-h/h",
            username.as_str(),
            usage_columns(user.total, precision)
        ));
        for (source, usage) in &user.allocation_sources {
            lines.push(format!(
                "  {:<22}{}",
                source.as_str(),
                usage_columns(*usage, precision)
            ));
        }
    }

    lines.push(String::new());
    lines.push("BY ALLOCATION SOURCE".to_string());
    lines.push("────────────────────".to_string());
    if report.allocation_sources.is_empty() {
        lines.push("No allocation sources charged.".to_string());
    }
    for (source, entry) in &report.allocation_sources {
        let users = entry
            .users
            .iter()
            .map(Username::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!(
            "{:<24}{}  users: {users}",
            source.as_str(),
            usage_columns(entry.usage, precision)
        ));
    }

    lines.push(String::new());
    lines.push("TOTALS".to_string());
    lines.push("──────".to_string());
    lines.push(format!(
        "{:<24}{}",
        "All sources",
        usage_columns(report.totals.all, precision)
    ));
    lines.push(format!(
        "{:<24}{}",
        "Excluding unattributed",
        usage_columns(report.totals.attributed, precision)
    ));

    let diagnostics = &report.diagnostics;
    let missing: u64 = diagnostics.instances_missing.values().sum();
    let skipped: u64 = diagnostics.causality_skipped.values().sum();
    lines.push(String::new());
    lines.push("DIAGNOSTICS".to_string());
    lines.push("───────────".to_string());
    lines.push(format!("Missing instance references: {missing}"));
    lines.push(format!("Skipped causality violations: {skipped}"));
    lines.push(format!("Statuses: {}", join_counts(&diagnostics.statuses)));
    lines.push(format!("Activities: {}", join_counts(&diagnostics.activities)));

    let mut output = lines.join("\n");
    output.push('\n');
    output
}

/// Formats the report as pretty JSON.
pub fn format_report_json(report: &UsageReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &Database,
    args: &ReportArgs,
    config: &Config,
) -> Result<()> {
    let precision = args
        .precision
        .unwrap_or(config.precision)
        .min(MAX_PRECISION);
    let report = generate_report(db, args, config)?.rounded(precision);
    let output = if args.json {
        let mut json = format_report_json(&report)?;
        json.push('\n');
        json
    } else {
        format_report(&report, precision)
    };
    writer.write_all(output.as_bytes())?;
    Ok(())
}
