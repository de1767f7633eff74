//! Raw completion-value provider.
//!
//! This module supplies the per-user leaf completion values the aggregation
//! walk consumes. Values come from an append-style log of completion events;
//! only the latest value per block matters to the aggregator.

use crate::models::{BlockCompletion, BlockKey, CourseKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from reading completion values.
#[derive(Error, Debug)]
pub enum CompletionError {
    /// A recorded value fell outside the unit interval.
    #[error("completion value for block {block} out of range: {value}")]
    OutOfRange { block: BlockKey, value: f64 },
    /// Reading a completion file from disk failed.
    #[error("failed to read completion file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Parsing a completion file failed.
    #[error("failed to parse completion file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Read-only provider of raw completion values.
pub trait CompletionSource {
    /// All recorded completions for a user in a course.
    fn completions(
        &self,
        user: &str,
        course_key: &CourseKey,
    ) -> Result<Vec<BlockCompletion>, CompletionError>;
}

/// One recorded completion event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEntry {
    /// User who earned the completion.
    pub user: String,
    /// Course the block belongs to.
    pub course_key: CourseKey,
    /// The completable block.
    pub block_key: BlockKey,
    /// Completion value in [0.0, 1.0].
    pub completion: f64,
    /// When the value was recorded.
    pub modified: DateTime<Utc>,
}

/// Completion provider backed by a JSON event log.
#[derive(Debug, Clone, Default)]
pub struct CompletionLog {
    entries: Vec<CompletionEntry>,
}

impl CompletionLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completion event.
    ///
    /// Rejects values outside the unit interval; the providers upstream of
    /// the aggregator only ever emit normalized completion.
    pub fn record(&mut self, entry: CompletionEntry) -> Result<(), CompletionError> {
        if !entry.completion.is_finite() || !(0.0..=1.0).contains(&entry.completion) {
            return Err(CompletionError::OutOfRange {
                block: entry.block_key,
                value: entry.completion,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Load completion events from a JSON file (an array of entries).
    pub fn load_file(&mut self, path: &Path) -> Result<usize, CompletionError> {
        let content = std::fs::read_to_string(path).map_err(|source| CompletionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_str(&content, path)
    }

    /// Parse completion events from a JSON string.
    pub fn load_str(&mut self, content: &str, path: &Path) -> Result<usize, CompletionError> {
        let entries: Vec<CompletionEntry> =
            serde_json::from_str(content).map_err(|source| CompletionError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let count = entries.len();
        for entry in entries {
            self.record(entry)?;
        }
        info!("Loaded {} completion events", count);
        Ok(count)
    }

    /// Every user with at least one event in the given course, sorted.
    pub fn users(&self, course_key: &CourseKey) -> Vec<String> {
        let users: BTreeSet<&str> = self
            .entries
            .iter()
            .filter(|e| &e.course_key == course_key)
            .map(|e| e.user.as_str())
            .collect();
        users.into_iter().map(String::from).collect()
    }

    /// Total number of recorded events.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log holds no events.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CompletionSource for CompletionLog {
    fn completions(
        &self,
        user: &str,
        course_key: &CourseKey,
    ) -> Result<Vec<BlockCompletion>, CompletionError> {
        let matched: Vec<BlockCompletion> = self
            .entries
            .iter()
            .filter(|e| e.user == user && &e.course_key == course_key)
            .map(|e| BlockCompletion {
                block_key: e.block_key.clone(),
                completion: e.completion,
                modified: e.modified,
            })
            .collect();
        debug!(
            "Found {} completions for {} in {}",
            matched.len(),
            user,
            course_key
        );
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(user: &str, block: &str, completion: f64) -> CompletionEntry {
        CompletionEntry {
            user: user.to_string(),
            course_key: CourseKey::from("course-v1:demo"),
            block_key: BlockKey::from(block),
            completion,
            modified: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_record_and_query() {
        let mut log = CompletionLog::new();
        log.record(entry("ada", "html-1", 0.5)).unwrap();
        log.record(entry("ada", "html-2", 1.0)).unwrap();
        log.record(entry("brian", "html-1", 0.25)).unwrap();

        let course = CourseKey::from("course-v1:demo");
        let ada = log.completions("ada", &course).unwrap();
        assert_eq!(ada.len(), 2);

        let other = log
            .completions("ada", &CourseKey::from("course-v1:other"))
            .unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_out_of_range_value_rejected() {
        let mut log = CompletionLog::new();
        assert!(log.record(entry("ada", "html-1", 1.5)).is_err());
        assert!(log.record(entry("ada", "html-1", -0.1)).is_err());
        assert!(log.record(entry("ada", "html-1", f64::NAN)).is_err());
        assert!(log.is_empty());
    }

    #[test]
    fn test_users_are_unique_and_sorted() {
        let mut log = CompletionLog::new();
        log.record(entry("zoe", "html-1", 1.0)).unwrap();
        log.record(entry("ada", "html-1", 0.5)).unwrap();
        log.record(entry("ada", "html-2", 0.5)).unwrap();

        let users = log.users(&CourseKey::from("course-v1:demo"));
        assert_eq!(users, vec!["ada".to_string(), "zoe".to_string()]);
    }

    #[test]
    fn test_demo_fixture_loads() {
        let mut log = CompletionLog::new();
        let count = log
            .load_str(
                include_str!("../../fixtures/demo_completions.json"),
                Path::new("fixtures/demo_completions.json"),
            )
            .unwrap();
        assert_eq!(count, 4);

        let users = log.users(&CourseKey::from("course-v1:edX+DemoX+2024"));
        assert_eq!(users, vec!["ada".to_string(), "brian".to_string()]);
    }

    #[test]
    fn test_load_str_parses_event_array() {
        let content = r#"[
            {
                "user": "ada",
                "course_key": "course-v1:demo",
                "block_key": "html-1",
                "completion": 0.5,
                "modified": "2024-03-01T12:00:00Z"
            }
        ]"#;

        let mut log = CompletionLog::new();
        let count = log.load_str(content, Path::new("inline.json")).unwrap();
        assert_eq!(count, 1);
        assert_eq!(log.len(), 1);
    }
}
