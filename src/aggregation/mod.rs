//! Aggregation engine.
//!
//! This module owns the recursive walk that turns raw leaf completions into
//! persisted aggregate records.

pub mod updater;

pub use updater::{AggregationUpdater, UpdateError};
