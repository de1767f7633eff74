//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// completion-aggregator - hierarchical completion aggregation for courses
///
/// Recalculates per-user aggregate completion (earned/possible/percent) for
/// every grouping block of a course tree from raw leaf completion events.
///
/// Examples:
///   completion-aggregator --course course.json --completions events.json
///   completion-aggregator --course course.json --completions events.json --store aggregates.json
///   completion-aggregator --course course.json --completions events.json --user ada --force
///   completion-aggregator --course course.json --dry-run
///   completion-aggregator --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Course structure JSON file
    ///
    /// Describes the content tree: every block with its type, completion
    /// mode, and children. Not required when using --init-config.
    #[arg(long, value_name = "FILE", required_unless_present = "init_config")]
    pub course: Option<PathBuf>,

    /// Completion events JSON file
    ///
    /// An array of recorded completion values, one entry per user and block.
    /// Not required for --dry-run or --init-config.
    #[arg(
        long,
        value_name = "FILE",
        required_unless_present_any = ["init_config", "dry_run"]
    )]
    pub completions: Option<PathBuf>,

    /// Aggregate store snapshot JSON file
    ///
    /// Loaded before the run when it exists, saved (atomically replaced)
    /// after. Without it the run starts from an empty store.
    /// Can also be set via AGGREGATOR_STORE env var.
    #[arg(short, long, value_name = "FILE", env = "AGGREGATOR_STORE")]
    pub store: Option<PathBuf>,

    /// Only update this user
    ///
    /// Defaults to every user present in the completion events.
    #[arg(short, long, value_name = "USER")]
    pub user: Option<String>,

    /// Rewrite every registered aggregator regardless of timestamps
    #[arg(short, long)]
    pub force: bool,

    /// Blocks whose completions recently changed (comma-separated)
    ///
    /// Accepted for forward compatibility with incremental recalculation;
    /// the current algorithm always walks the full tree.
    #[arg(long, value_name = "BLOCKS", value_delimiter = ',')]
    pub changed: Option<Vec<String>>,

    /// Aggregation names to persist (comma-separated)
    ///
    /// Example: --aggregators course,chapter. Overrides the config file.
    #[arg(long, value_name = "NAMES", value_delimiter = ',')]
    pub aggregators: Option<Vec<String>>,

    /// Output file path for the report
    ///
    /// Defaults to the config file setting, or aggregation_report.md.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Path to configuration file
    ///
    /// If not specified, looks for .aggregator.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Dry run: load the course, print structure stats, write nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .aggregator.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if let Some(ref course) = self.course {
            if !course.exists() {
                return Err(format!("Course file does not exist: {}", course.display()));
            }
        }

        if let Some(ref completions) = self.completions {
            if !completions.exists() {
                return Err(format!(
                    "Completion file does not exist: {}",
                    completions.display()
                ));
            }
        }

        if let Some(ref user) = self.user {
            if user.trim().is_empty() {
                return Err("User must not be empty".to_string());
            }
        }

        if let Some(ref changed) = self.changed {
            if changed.iter().any(|block| block.trim().is_empty()) {
                return Err("Changed block keys must not be empty".to_string());
            }
        }

        if let Some(ref aggregators) = self.aggregators {
            if aggregators.iter().any(|name| name.trim().is_empty()) {
                return Err("Aggregation names must not be empty".to_string());
            }
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
