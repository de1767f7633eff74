//! Aggregate record store.
//!
//! This module persists the output of aggregation runs: one record per
//! `(user, course, aggregation name, block)` quadruple, upserted atomically.
//! It also owns the registration policy deciding which aggregation names are
//! persistable at all.

use crate::models::{
    Aggregator, BlockKey, CourseKey, FieldValidationError, validate_percent,
    validate_positive_float,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

/// Aggregation names persisted when no explicit registry is configured.
///
/// Matches the standard course hierarchy grouping types.
pub const DEFAULT_REGISTERED: [&str; 4] = ["course", "chapter", "sequential", "vertical"];

/// Errors from the aggregate store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A record failed field validation at the store boundary.
    #[error("invalid aggregate record: {0}")]
    Validation(#[from] FieldValidationError),
    /// Reading a snapshot file from disk failed.
    #[error("failed to read store snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Parsing a snapshot file failed.
    #[error("failed to parse store snapshot {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// Encoding records for a snapshot file failed.
    #[error("failed to encode store snapshot {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// Writing a snapshot file failed.
    #[error("failed to write store snapshot {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The record table lock was poisoned by a panicking writer.
    #[error("aggregate store lock poisoned")]
    Poisoned,
}

/// Request to upsert one aggregate record.
#[derive(Debug, Clone)]
pub struct SubmitCompletion {
    /// User the aggregate belongs to.
    pub user: String,
    /// Course containing the block.
    pub course_key: CourseKey,
    /// The aggregator block.
    pub block_key: BlockKey,
    /// The block's aggregation name.
    pub aggregation_name: String,
    /// Summed completion earned.
    pub earned: f64,
    /// Summed completion possible.
    pub possible: f64,
    /// Newest contributing completion event.
    pub last_modified: DateTime<Utc>,
}

/// Read/write collaborator persisting aggregate records.
pub trait AggregateStore {
    /// All existing records for a user in a course.
    fn query(&self, user: &str, course_key: &CourseKey) -> Result<Vec<Aggregator>, StoreError>;

    /// Atomically create or update the record for the submission's quadruple.
    ///
    /// `created` is set on first insert only; subsequent submissions update
    /// the remaining fields in place. Returns the stored record.
    fn submit_completion(&self, submission: SubmitCompletion) -> Result<Aggregator, StoreError>;

    /// Whether records for this aggregation name should be persisted.
    fn is_registered_aggregator(&self, aggregation_name: &str) -> bool;
}

/// Unique identity of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecordKey {
    user: String,
    course_key: CourseKey,
    aggregation_name: String,
    block_key: BlockKey,
}

impl RecordKey {
    fn of(record: &Aggregator) -> Self {
        Self {
            user: record.user.clone(),
            course_key: record.course_key.clone(),
            aggregation_name: record.aggregation_name.clone(),
            block_key: record.block_key.clone(),
        }
    }
}

/// In-process aggregate store with an optional JSON snapshot on disk.
///
/// Every upsert runs as a single read-modify-write under one lock, so
/// concurrent submissions for the same quadruple cannot produce duplicate
/// records; the last writer wins on the fields.
#[derive(Debug)]
pub struct InMemoryStore {
    registered: HashSet<String>,
    records: Mutex<HashMap<RecordKey, Aggregator>>,
}

impl InMemoryStore {
    /// Create a store persisting the given aggregation names.
    pub fn new(registered: impl IntoIterator<Item = String>) -> Self {
        Self {
            registered: registered.into_iter().collect(),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Create a store with the default registered aggregation names.
    pub fn with_default_registry() -> Self {
        Self::new(DEFAULT_REGISTERED.iter().map(|s| s.to_string()))
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored record, sorted for deterministic output.
    pub fn all_records(&self) -> Result<Vec<Aggregator>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let mut all: Vec<Aggregator> = records.values().cloned().collect();
        all.sort_by(|a, b| {
            (&a.user, &a.course_key, &a.aggregation_name, &a.block_key).cmp(&(
                &b.user,
                &b.course_key,
                &b.aggregation_name,
                &b.block_key,
            ))
        });
        Ok(all)
    }

    /// Records for one user and aggregation name within a course.
    ///
    /// Mirrors the `(user, aggregation_name, course_key)` lookup index of the
    /// persisted schema.
    pub fn query_aggregation(
        &self,
        user: &str,
        aggregation_name: &str,
        course_key: &CourseKey,
    ) -> Result<Vec<Aggregator>, StoreError> {
        let mut matched: Vec<Aggregator> = self
            .all_records()?
            .into_iter()
            .filter(|r| {
                r.user == user
                    && r.aggregation_name == aggregation_name
                    && &r.course_key == course_key
            })
            .collect();
        matched.sort_by(|a, b| a.block_key.cmp(&b.block_key));
        Ok(matched)
    }

    /// Records in a course at or above a completion percent.
    ///
    /// Mirrors the `(course_key, aggregation_name, block_key, percent)`
    /// lookup index of the persisted schema.
    pub fn query_by_percent(
        &self,
        course_key: &CourseKey,
        aggregation_name: &str,
        min_percent: f64,
    ) -> Result<Vec<Aggregator>, StoreError> {
        Ok(self
            .all_records()?
            .into_iter()
            .filter(|r| {
                &r.course_key == course_key
                    && r.aggregation_name == aggregation_name
                    && r.percent >= min_percent
            })
            .collect())
    }

    /// Load previously persisted records from a JSON snapshot.
    ///
    /// Each record is validated before it enters the table.
    pub fn load_snapshot(&self, path: &Path) -> Result<usize, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let loaded: Vec<Aggregator> =
            serde_json::from_str(&content).map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let count = loaded.len();
        for record in loaded {
            record.validate()?;
            records.insert(RecordKey::of(&record), record);
        }
        info!("Loaded {} aggregate records from {}", count, path.display());
        Ok(count)
    }

    /// Write all records to a JSON snapshot, replacing the file atomically.
    pub fn save_snapshot(&self, path: &Path) -> Result<usize, StoreError> {
        let all = self.all_records()?;
        let content =
            serde_json::to_string_pretty(&all).map_err(|source| StoreError::Encode {
                path: path.to_path_buf(),
                source,
            })?;

        // Write next to the target so the rename stays on one filesystem.
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp = NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))
            .map_err(|source| StoreError::Persist {
                path: path.to_path_buf(),
                source,
            })?;
        tmp.write_all(content.as_bytes())
            .map_err(|source| StoreError::Persist {
                path: path.to_path_buf(),
                source,
            })?;
        tmp.persist(path).map_err(|e| StoreError::Persist {
            path: path.to_path_buf(),
            source: e.error,
        })?;

        debug!("Saved {} aggregate records to {}", all.len(), path.display());
        Ok(all.len())
    }
}

impl AggregateStore for InMemoryStore {
    fn query(&self, user: &str, course_key: &CourseKey) -> Result<Vec<Aggregator>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let mut matched: Vec<Aggregator> = records
            .values()
            .filter(|r| r.user == user && &r.course_key == course_key)
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            (&a.aggregation_name, &a.block_key).cmp(&(&b.aggregation_name, &b.block_key))
        });
        Ok(matched)
    }

    fn submit_completion(&self, submission: SubmitCompletion) -> Result<Aggregator, StoreError> {
        let percent = Aggregator::calculate_percent(submission.earned, submission.possible);

        // Defensive boundary check; the walk cannot produce invalid sums.
        validate_positive_float("earned", submission.earned)?;
        validate_positive_float("possible", submission.possible)?;
        validate_percent(percent)?;

        let key = RecordKey {
            user: submission.user.clone(),
            course_key: submission.course_key.clone(),
            aggregation_name: submission.aggregation_name.clone(),
            block_key: submission.block_key.clone(),
        };

        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let record = records
            .entry(key)
            .and_modify(|existing| {
                existing.earned = submission.earned;
                existing.possible = submission.possible;
                existing.percent = percent;
                existing.last_modified = submission.last_modified;
            })
            .or_insert_with(|| Aggregator {
                user: submission.user,
                course_key: submission.course_key,
                block_key: submission.block_key,
                aggregation_name: submission.aggregation_name,
                earned: submission.earned,
                possible: submission.possible,
                percent,
                last_modified: submission.last_modified,
                created: Utc::now(),
            });
        Ok(record.clone())
    }

    fn is_registered_aggregator(&self, aggregation_name: &str) -> bool {
        self.registered.contains(aggregation_name)
    }
}
