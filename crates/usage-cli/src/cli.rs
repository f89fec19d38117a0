//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::report::ReportArgs;

/// Compute usage accounting.
///
/// Replays instance status history and allocation-source changes to report
/// active hours per user and allocation source.
#[derive(Debug, Parser)]
#[command(name = "usage", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show what is stored in the database.
    Status,

    /// Import records from JSON Lines on stdin.
    Import {
        #[command(subcommand)]
        kind: ImportKind,
    },

    /// Replay stored records and report usage.
    Report(ReportArgs),
}

/// Record tables that can be imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum ImportKind {
    /// Instance status history rows.
    StatusHistory,
    /// Event-table rows (allocation-source changes).
    AllocationChanges,
}

impl ImportKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::StatusHistory => "status history",
            Self::AllocationChanges => "allocation change",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_report_arguments() {
        let cli = Cli::try_parse_from([
            "usage",
            "report",
            "--end-date",
            "2016-12-01T05:00:00Z",
            "--username",
            "alice",
            "--causality",
            "count_and_skip",
            "--json",
        ])
        .unwrap();

        let Some(Commands::Report(args)) = cli.command else {
            panic!("expected report command");
        };
        assert_eq!(args.username.as_deref(), Some("alice"));
        assert!(args.json);
        assert_eq!(
            args.causality,
            Some(usage_core::CausalityPolicy::CountAndSkip)
        );
        assert_eq!(args.end_date.to_rfc3339(), "2016-12-01T05:00:00+00:00");
    }

    #[test]
    fn parses_import_kind() {
        let cli = Cli::try_parse_from(["usage", "import", "allocation-changes"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Import {
                kind: ImportKind::AllocationChanges
            })
        ));
    }

    #[test]
    fn rejects_unknown_rollup() {
        let result = Cli::try_parse_from([
            "usage",
            "report",
            "--end-date",
            "2016-12-01",
            "--rollup",
            "sum",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_precision_beyond_f64() {
        let parse = |precision: &str| {
            Cli::try_parse_from([
                "usage",
                "report",
                "--end-date",
                "2016-12-01",
                "--precision",
                precision,
            ])
        };
        assert!(parse("15").is_ok());
        assert!(parse("400").is_err());
    }
}
