//! Markdown and JSON report generation.
//!
//! Reports summarize one aggregation run: run metadata, per-user aggregate
//! tables, and the course-level completion rollup.

use crate::models::{Aggregator, CourseKey};
use crate::store::{AggregateStore, InMemoryStore, StoreError};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Metadata about one aggregation run.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    /// The course that was aggregated.
    pub course_key: CourseKey,
    /// When the report was generated.
    pub generated_at: DateTime<Utc>,
    /// Number of users whose update completed.
    pub users_updated: usize,
    /// Number of users whose update failed.
    pub users_failed: usize,
    /// Total aggregate records in the store after the run.
    pub records_stored: usize,
    /// Duration of the run in seconds.
    pub duration_seconds: f64,
    /// Whether the run was forced.
    pub forced: bool,
}

/// Stored aggregates for one user.
#[derive(Debug, Clone, Serialize)]
pub struct UserAggregates {
    /// The user.
    pub user: String,
    /// Course-level completion percent, when a course record exists.
    pub course_percent: Option<f64>,
    /// The user's aggregate records, sorted by aggregation name and block.
    pub records: Vec<Aggregator>,
}

/// The complete report for an aggregation run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Metadata about the run.
    pub metadata: RunMetadata,
    /// Per-user aggregates.
    pub users: Vec<UserAggregates>,
}

/// Assemble a report from the store's contents.
///
/// Records with a percent below `min_percent` are left out of the per-user
/// tables; the course rollup always shows when a course record exists.
pub fn build_report(
    store: &InMemoryStore,
    course_key: &CourseKey,
    users: &[String],
    min_percent: f64,
    metadata: RunMetadata,
) -> Result<RunReport, StoreError> {
    let mut sections = Vec::with_capacity(users.len());

    for user in users {
        let records = store.query(user, course_key)?;
        let course_percent = records
            .iter()
            .find(|r| r.aggregation_name == "course")
            .map(|r| r.percent);
        let records = records
            .into_iter()
            .filter(|r| r.percent >= min_percent)
            .collect();
        sections.push(UserAggregates {
            user: user.clone(),
            course_percent,
            records,
        });
    }

    Ok(RunReport {
        metadata,
        users: sections,
    })
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &RunReport) -> String {
    let mut output = String::new();

    output.push_str("# Completion Aggregation Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_users_section(&report.users));
    output.push_str(&generate_footer());

    output
}

/// Generate a JSON report.
pub fn generate_json_report(report: &RunReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &RunMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Course:** {}\n", metadata.course_key));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Users Updated:** {}\n", metadata.users_updated));
    if metadata.users_failed > 0 {
        section.push_str(&format!("- **Users Failed:** {}\n", metadata.users_failed));
    }
    section.push_str(&format!(
        "- **Records Stored:** {}\n",
        metadata.records_stored
    ));
    section.push_str(&format!(
        "- **Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    if metadata.forced {
        section.push_str("- **Forced:** yes\n");
    }
    section.push('\n');

    section
}

/// Generate the per-user aggregate tables.
fn generate_users_section(users: &[UserAggregates]) -> String {
    let mut section = String::new();

    section.push_str("## Completion by User\n\n");

    if users.is_empty() {
        section.push_str("_No users were updated._\n\n");
        return section;
    }

    for aggregates in users {
        section.push_str(&format!("### {}\n\n", aggregates.user));

        if let Some(percent) = aggregates.course_percent {
            section.push_str(&format!(
                "- **Course Completion:** {:.1}%\n\n",
                percent * 100.0
            ));
        }

        if aggregates.records.is_empty() {
            section.push_str("_No aggregate records._\n\n");
            continue;
        }

        section.push_str("| Block | Aggregation | Earned | Possible | Percent |\n");
        section.push_str("|-------|-------------|--------|----------|--------|\n");
        for record in &aggregates.records {
            section.push_str(&format!(
                "| {} | {} | {:.2} | {:.2} | {:.1}% |\n",
                record.block_key,
                record.aggregation_name,
                record.earned,
                record.possible,
                record.percent * 100.0
            ));
        }
        section.push('\n');
    }

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    format!(
        "---\n\n*Generated by completion-aggregator v{}*\n",
        env!("CARGO_PKG_VERSION")
    )
}
