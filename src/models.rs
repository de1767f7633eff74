//! Data models for the completion aggregator.
//!
//! This module contains the core data structures used throughout the
//! application for identifying blocks, carrying completion values, and
//! representing persisted aggregate records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Timestamp older than any real completion event.
///
/// Used as the identity element when reducing child timestamps with `max`,
/// and as the prior `last_modified` for blocks that have never been computed
/// or recorded. A real event timestamp always compares greater.
pub const OLD_DATETIME: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

/// Identifies a course (the aggregation container).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CourseKey(String);

impl CourseKey {
    /// Create a course key from any string-like value.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CourseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CourseKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifies a single content block within a course.
///
/// Block keys are opaque to the aggregator; the course structure resolves
/// their completion mode and children. Interpreted within the scope of a
/// [`CourseKey`], a block key names one position in the content tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockKey(String);

impl BlockKey {
    /// Create a block key from any string-like value.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlockKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Completion values computed for one block during the aggregation walk.
///
/// Every step of the recursive walk returns one of these. Only aggregator
/// blocks ever get persisted; for completable and excluded blocks the stats
/// exist purely in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionStats {
    /// Completion earned across the subtree rooted at this block.
    pub earned: f64,
    /// Maximum completion possible across the subtree.
    pub possible: f64,
    /// Newest completion event among reachable descendants, or
    /// [`OLD_DATETIME`] when no event has ever been recorded.
    pub last_modified: DateTime<Utc>,
}

/// A raw completion value recorded for a single completable block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockCompletion {
    /// The completable block this value belongs to.
    pub block_key: BlockKey,
    /// Recorded completion in the range [0.0, 1.0].
    pub completion: f64,
    /// When the value was last recorded.
    pub modified: DateTime<Utc>,
}

/// A persisted aggregate completion record.
///
/// Exactly one record exists per `(user, course_key, aggregation_name,
/// block_key)` quadruple. Records are created on first write and updated in
/// place afterwards; this component never deletes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregator {
    /// User the aggregate belongs to.
    pub user: String,
    /// Course containing the aggregated block.
    pub course_key: CourseKey,
    /// The aggregator block itself.
    pub block_key: BlockKey,
    /// Which aggregation this record represents (the block's grouping type,
    /// e.g. "chapter").
    pub aggregation_name: String,
    /// Sum of completion earned across the block's subtree.
    pub earned: f64,
    /// Sum of completion possible across the block's subtree.
    pub possible: f64,
    /// Derived ratio: `earned / possible`, or 0.0 when nothing is possible.
    pub percent: f64,
    /// Newest completion event that contributed to this aggregate.
    pub last_modified: DateTime<Utc>,
    /// When this record was first written. Never updated afterwards.
    pub created: DateTime<Utc>,
}

impl Aggregator {
    /// Derive the percent value for an earned/possible pair.
    pub fn calculate_percent(earned: f64, possible: f64) -> f64 {
        if possible > 0.0 {
            earned / possible
        } else {
            0.0
        }
    }

    /// Validate the numeric fields of this record.
    ///
    /// The aggregation walk cannot produce invalid values, but the store
    /// checks anyway before persisting.
    pub fn validate(&self) -> Result<(), FieldValidationError> {
        validate_positive_float("earned", self.earned)?;
        validate_positive_float("possible", self.possible)?;
        validate_percent(self.percent)?;
        Ok(())
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} for {} in {} ({:.1}%)",
            self.aggregation_name,
            self.earned,
            self.possible,
            self.user,
            self.block_key,
            self.percent * 100.0
        )
    }
}

/// Rejection of an out-of-range numeric field at the store boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldValidationError {
    /// A field that must be a non-negative finite float was not.
    #[error("{field} must be a non-negative float, got {value}")]
    NotPositive { field: &'static str, value: f64 },
    /// A percent outside [0.0, 1.0].
    #[error("percent must be between 0.0 and 1.0, got {value}")]
    PercentOutOfRange { value: f64 },
}

/// Check that a value is a finite, non-negative float.
pub fn validate_positive_float(
    field: &'static str,
    value: f64,
) -> Result<(), FieldValidationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(FieldValidationError::NotPositive { field, value })
    }
}

/// Check that a percent lies within [0.0, 1.0].
pub fn validate_percent(value: f64) -> Result<(), FieldValidationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(FieldValidationError::PercentOutOfRange { value })
    }
}
