//! Recursive aggregation updater.
//!
//! One updater instance recalculates aggregate completion for a single user
//! in a single course. Construction performs the whole read phase (tree
//! shape, prior records, raw completions); the walk itself then runs against
//! those caches, writing refreshed records through the store as it returns
//! up the tree.

use crate::completion::{CompletionError, CompletionSource};
use crate::course::{CompletionMode, CourseBlocks, CourseStore, StructureError};
use crate::models::{
    Aggregator, BlockCompletion, BlockKey, CompletionStats, CourseKey, OLD_DATETIME,
};
use crate::store::{AggregateStore, StoreError, SubmitCompletion};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info};

/// A fatal failure while updating aggregators.
///
/// Provider and store errors propagate uncaught; no partial-tree fallback is
/// attempted. Records already upserted before the failure remain in place
/// and a later run corrects any inconsistency.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// The course structure could not be resolved.
    #[error(transparent)]
    Structure(#[from] StructureError),
    /// Raw completion values could not be read.
    #[error(transparent)]
    Completion(#[from] CompletionError),
    /// The aggregate store rejected a read or write.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Recalculates aggregate completion records for one user and course.
pub struct AggregationUpdater<'a> {
    user: String,
    course_key: CourseKey,
    store: &'a dyn AggregateStore,
    course_block_key: BlockKey,
    course_blocks: CourseBlocks,
    aggregators: HashMap<BlockKey, Aggregator>,
    block_completions: HashMap<BlockKey, BlockCompletion>,
}

impl<'a> AggregationUpdater<'a> {
    /// Create an updater, performing the full read phase.
    ///
    /// Resolves the course root, materializes the content tree, and loads
    /// prior aggregate records and raw completions into maps keyed by block
    /// so the walk does constant-time lookups.
    pub fn new(
        user: impl Into<String>,
        course_key: CourseKey,
        course_store: &dyn CourseStore,
        completion_source: &dyn CompletionSource,
        store: &'a dyn AggregateStore,
    ) -> Result<Self, UpdateError> {
        let user = user.into();

        let course_block_key = course_store.resolve_root(&course_key)?;
        let course_blocks = course_store.load_structure(&course_key)?;

        let aggregators: HashMap<BlockKey, Aggregator> = store
            .query(&user, &course_key)?
            .into_iter()
            .map(|record| (record.block_key.clone(), record))
            .collect();

        let block_completions: HashMap<BlockKey, BlockCompletion> = completion_source
            .completions(&user, &course_key)?
            .into_iter()
            .map(|completion| (completion.block_key.clone(), completion))
            .collect();

        debug!(
            "Updater ready for {} in {}: {} blocks, {} prior records, {} completions",
            user,
            course_key,
            course_blocks.block_count(),
            aggregators.len(),
            block_completions.len(),
        );

        Ok(Self {
            user,
            course_key,
            store,
            course_block_key,
            course_blocks,
            aggregators,
            block_completions,
        })
    }

    /// Update the aggregators for the course.
    ///
    /// `changed_blocks` names blocks whose completions were recently
    /// recorded. The current algorithm walks the full tree regardless; the
    /// parameter keeps the call contract stable for future incremental
    /// recalculation.
    pub fn update(
        &self,
        changed_blocks: &HashSet<BlockKey>,
        force: bool,
    ) -> Result<(), UpdateError> {
        info!(
            "Updating aggregators in {} for {}",
            self.course_key, self.user
        );
        self.update_for_block(&self.course_block_key, changed_blocks, force)?;
        Ok(())
    }

    /// Recursive step: dispatch on the block's completion mode.
    fn update_for_block(
        &self,
        block: &BlockKey,
        changed_blocks: &HashSet<BlockKey>,
        force: bool,
    ) -> Result<CompletionStats, UpdateError> {
        match self.course_blocks.mode_of(block)? {
            CompletionMode::Excluded => Ok(self.update_for_excluded()),
            CompletionMode::Completable => Ok(self.update_for_completable(block)),
            CompletionMode::Aggregator => {
                self.update_for_aggregator(block, changed_blocks, force)
            }
        }
    }

    /// Calculate the new completion values for an aggregator block.
    ///
    /// Sums earned/possible over the children and takes the newest child
    /// timestamp, then refreshes the stored record when the staleness rule
    /// says so. The returned stats always reflect the fresh sums, whether or
    /// not a write happened.
    fn update_for_aggregator(
        &self,
        block: &BlockKey,
        changed_blocks: &HashSet<BlockKey>,
        force: bool,
    ) -> Result<CompletionStats, UpdateError> {
        let mut total_earned = 0.0;
        let mut total_possible = 0.0;
        let mut last_modified = OLD_DATETIME;

        for child in self.course_blocks.children(block)? {
            let stats = self.update_for_block(child, changed_blocks, force)?;
            total_earned += stats.earned;
            total_possible += stats.possible;
            last_modified = last_modified.max(stats.last_modified);
        }

        if self.aggregator_needs_update(block, last_modified, force)? {
            let aggregation_name = self.course_blocks.aggregation_name(block)?;
            info!("Updating aggregator {}", block);
            self.store.submit_completion(SubmitCompletion {
                user: self.user.clone(),
                course_key: self.course_key.clone(),
                block_key: block.clone(),
                aggregation_name: aggregation_name.to_string(),
                earned: total_earned,
                possible: total_possible,
                last_modified,
            })?;
        }

        Ok(CompletionStats {
            earned: total_earned,
            possible: total_possible,
            last_modified,
        })
    }

    /// Sentinel stats for excluded blocks: no contribution, no recursion.
    fn update_for_excluded(&self) -> CompletionStats {
        CompletionStats {
            earned: 0.0,
            possible: 0.0,
            last_modified: OLD_DATETIME,
        }
    }

    /// Stats for a completable block from the preloaded completion map.
    ///
    /// Each completable leaf contributes exactly one unit of possible
    /// completion; an unseen leaf earns nothing and carries the sentinel.
    fn update_for_completable(&self, block: &BlockKey) -> CompletionStats {
        let (earned, last_modified) = match self.block_completions.get(block) {
            Some(completion) => (completion.completion, completion.modified),
            None => (0.0, OLD_DATETIME),
        };
        CompletionStats {
            earned,
            possible: 1.0,
            last_modified,
        }
    }

    /// Whether the given aggregator block's record needs a refresh.
    ///
    /// Assumes the block has already been determined to be an aggregator.
    /// Unregistered aggregation names never persist. Otherwise `force` wins,
    /// and the stored timestamp must be strictly older than the computed one
    /// for a rewrite; equality means the record is already current.
    fn aggregator_needs_update(
        &self,
        block: &BlockKey,
        modified: DateTime<Utc>,
        force: bool,
    ) -> Result<bool, UpdateError> {
        let aggregation_name = self.course_blocks.aggregation_name(block)?;
        if !self.store.is_registered_aggregator(aggregation_name) {
            return Ok(false);
        }
        if force {
            return Ok(true);
        }
        let prior = self
            .aggregators
            .get(block)
            .map(|record| record.last_modified)
            .unwrap_or(OLD_DATETIME);
        Ok(prior < modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{CompletionEntry, CompletionLog};
    use crate::course::{BlockNode, CourseCatalog};
    use crate::store::InMemoryStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store wrapper counting writes, to observe staleness decisions.
    struct CountingStore {
        inner: InMemoryStore,
        submits: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: InMemoryStore::with_default_registry(),
                submits: AtomicUsize::new(0),
            }
        }

        fn submit_count(&self) -> usize {
            self.submits.load(Ordering::SeqCst)
        }
    }

    impl AggregateStore for CountingStore {
        fn query(
            &self,
            user: &str,
            course_key: &CourseKey,
        ) -> Result<Vec<Aggregator>, StoreError> {
            self.inner.query(user, course_key)
        }

        fn submit_completion(
            &self,
            submission: SubmitCompletion,
        ) -> Result<Aggregator, StoreError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            self.inner.submit_completion(submission)
        }

        fn is_registered_aggregator(&self, aggregation_name: &str) -> bool {
            self.inner.is_registered_aggregator(aggregation_name)
        }
    }

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn course_key() -> CourseKey {
        CourseKey::from("course-v1:demo")
    }

    fn node(block_type: &str, mode: CompletionMode, children: &[&str]) -> BlockNode {
        BlockNode {
            block_type: block_type.to_string(),
            mode,
            children: children.iter().map(|c| BlockKey::from(*c)).collect(),
        }
    }

    fn catalog_from(root: &str, entries: Vec<(&str, BlockNode)>) -> CourseCatalog {
        let blocks = entries
            .into_iter()
            .map(|(key, node)| (BlockKey::from(key), node))
            .collect();
        let structure =
            crate::course::CourseBlocks::new(BlockKey::from(root), blocks).unwrap();
        let mut catalog = CourseCatalog::new();
        catalog.insert(course_key(), structure);
        catalog
    }

    /// Root chapter with one recorded leaf and one unseen leaf.
    fn chapter_catalog() -> CourseCatalog {
        catalog_from(
            "chapter-1",
            vec![
                (
                    "chapter-1",
                    node("chapter", CompletionMode::Aggregator, &["html-1", "html-2"]),
                ),
                ("html-1", node("html", CompletionMode::Completable, &[])),
                ("html-2", node("html", CompletionMode::Completable, &[])),
            ],
        )
    }

    fn completion_log(entries: &[(&str, f64, u32)]) -> CompletionLog {
        let mut log = CompletionLog::new();
        for (block, value, hour) in entries {
            log.record(CompletionEntry {
                user: "ada".to_string(),
                course_key: course_key(),
                block_key: BlockKey::from(*block),
                completion: *value,
                modified: ts(*hour),
            })
            .unwrap();
        }
        log
    }

    fn run_update(
        catalog: &CourseCatalog,
        log: &CompletionLog,
        store: &dyn AggregateStore,
        force: bool,
    ) {
        let updater =
            AggregationUpdater::new("ada", course_key(), catalog, log, store).unwrap();
        updater.update(&HashSet::new(), force).unwrap();
    }

    #[test]
    fn test_chapter_with_recorded_and_unseen_leaves() {
        let catalog = chapter_catalog();
        let log = completion_log(&[("html-1", 0.5, 12)]);
        let store = InMemoryStore::with_default_registry();

        run_update(&catalog, &log, &store, false);

        let records = store.query("ada", &course_key()).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.block_key, BlockKey::from("chapter-1"));
        assert_eq!(record.aggregation_name, "chapter");
        assert_eq!(record.earned, 0.5);
        assert_eq!(record.possible, 2.0);
        assert_eq!(record.percent, 0.25);
        assert_eq!(record.last_modified, ts(12));
    }

    #[test]
    fn test_update_is_idempotent_without_force() {
        let catalog = chapter_catalog();
        let log = completion_log(&[("html-1", 0.5, 12)]);
        let store = CountingStore::new();

        run_update(&catalog, &log, &store, false);
        assert_eq!(store.submit_count(), 1);

        // The stored timestamp now equals the computed one; the strict
        // inequality fails and nothing is rewritten.
        run_update(&catalog, &log, &store, false);
        assert_eq!(store.submit_count(), 1);

        let records = store.inner.query("ada", &course_key()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].earned, 0.5);
    }

    #[test]
    fn test_force_always_rewrites() {
        let catalog = chapter_catalog();
        let log = completion_log(&[("html-1", 0.5, 12)]);
        let store = CountingStore::new();

        run_update(&catalog, &log, &store, false);
        run_update(&catalog, &log, &store, true);
        run_update(&catalog, &log, &store, true);

        // One initial write, then one per forced run.
        assert_eq!(store.submit_count(), 3);
    }

    #[test]
    fn test_stale_record_is_refreshed() {
        let catalog = chapter_catalog();
        let store = InMemoryStore::with_default_registry();

        let log = completion_log(&[("html-1", 0.5, 12)]);
        run_update(&catalog, &log, &store, false);

        // A newer completion event arrives for the second leaf.
        let log = completion_log(&[("html-1", 0.5, 12), ("html-2", 1.0, 13)]);
        run_update(&catalog, &log, &store, false);

        let records = store.query("ada", &course_key()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].earned, 1.5);
        assert_eq!(records[0].percent, 0.75);
        assert_eq!(records[0].last_modified, ts(13));
    }

    #[test]
    fn test_excluded_subtree_is_invisible() {
        // The excluded block hides a recorded completable with the newest
        // timestamp; neither its value nor its timestamp may surface.
        let catalog = catalog_from(
            "chapter-1",
            vec![
                (
                    "chapter-1",
                    node("chapter", CompletionMode::Aggregator, &["html-1", "notes"]),
                ),
                ("html-1", node("html", CompletionMode::Completable, &[])),
                (
                    "notes",
                    node("notes", CompletionMode::Excluded, &["hidden-1"]),
                ),
                ("hidden-1", node("html", CompletionMode::Completable, &[])),
            ],
        );
        let log = completion_log(&[("html-1", 0.5, 12), ("hidden-1", 1.0, 15)]);
        let store = InMemoryStore::with_default_registry();

        run_update(&catalog, &log, &store, false);

        let records = store.query("ada", &course_key()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].earned, 0.5);
        assert_eq!(records[0].possible, 1.0);
        assert_eq!(records[0].last_modified, ts(12));
    }

    #[test]
    fn test_aggregation_arithmetic_across_levels() {
        let catalog = catalog_from(
            "course",
            vec![
                (
                    "course",
                    node(
                        "course",
                        CompletionMode::Aggregator,
                        &["chapter-1", "chapter-2"],
                    ),
                ),
                (
                    "chapter-1",
                    node("chapter", CompletionMode::Aggregator, &["html-1", "html-2"]),
                ),
                (
                    "chapter-2",
                    node("chapter", CompletionMode::Aggregator, &["html-3"]),
                ),
                ("html-1", node("html", CompletionMode::Completable, &[])),
                ("html-2", node("html", CompletionMode::Completable, &[])),
                ("html-3", node("html", CompletionMode::Completable, &[])),
            ],
        );
        let log = completion_log(&[("html-1", 1.0, 10), ("html-3", 0.25, 14)]);
        let store = InMemoryStore::with_default_registry();

        run_update(&catalog, &log, &store, false);

        let records = store.query("ada", &course_key()).unwrap();
        assert_eq!(records.len(), 3);

        let course = records
            .iter()
            .find(|r| r.aggregation_name == "course")
            .unwrap();
        assert_eq!(course.earned, 1.25);
        assert_eq!(course.possible, 3.0);
        assert_eq!(course.last_modified, ts(14));

        let chapter_two = records
            .iter()
            .find(|r| r.block_key == BlockKey::from("chapter-2"))
            .unwrap();
        assert_eq!(chapter_two.earned, 0.25);
        assert_eq!(chapter_two.possible, 1.0);
        assert_eq!(chapter_two.last_modified, ts(14));
    }

    #[test]
    fn test_nothing_recorded_means_nothing_written() {
        // All timestamps stay at the sentinel, so the strict inequality
        // never fires and no record appears until a force.
        let catalog = chapter_catalog();
        let log = CompletionLog::new();
        let store = CountingStore::new();

        run_update(&catalog, &log, &store, false);
        assert_eq!(store.submit_count(), 0);

        run_update(&catalog, &log, &store, true);
        assert_eq!(store.submit_count(), 1);

        let records = store.inner.query("ada", &course_key()).unwrap();
        assert_eq!(records[0].earned, 0.0);
        assert_eq!(records[0].possible, 2.0);
        assert_eq!(records[0].last_modified, OLD_DATETIME);
    }

    #[test]
    fn test_unregistered_aggregation_name_is_not_persisted() {
        // "unit" is not a registered aggregation name; its sums must still
        // flow into the parent, but no record may be written for it.
        let catalog = catalog_from(
            "course",
            vec![
                (
                    "course",
                    node("course", CompletionMode::Aggregator, &["unit-1"]),
                ),
                (
                    "unit-1",
                    node("unit", CompletionMode::Aggregator, &["html-1"]),
                ),
                ("html-1", node("html", CompletionMode::Completable, &[])),
            ],
        );
        let log = completion_log(&[("html-1", 1.0, 12)]);
        let store = InMemoryStore::with_default_registry();

        run_update(&catalog, &log, &store, false);

        let records = store.query("ada", &course_key()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].aggregation_name, "course");
        assert_eq!(records[0].earned, 1.0);
        assert_eq!(records[0].possible, 1.0);
    }

    #[test]
    fn test_changed_blocks_do_not_narrow_the_walk() {
        let catalog = catalog_from(
            "course",
            vec![
                (
                    "course",
                    node(
                        "course",
                        CompletionMode::Aggregator,
                        &["chapter-1", "chapter-2"],
                    ),
                ),
                (
                    "chapter-1",
                    node("chapter", CompletionMode::Aggregator, &["html-1"]),
                ),
                (
                    "chapter-2",
                    node("chapter", CompletionMode::Aggregator, &["html-2"]),
                ),
                ("html-1", node("html", CompletionMode::Completable, &[])),
                ("html-2", node("html", CompletionMode::Completable, &[])),
            ],
        );
        let log = completion_log(&[("html-1", 1.0, 10), ("html-2", 1.0, 11)]);
        let store = InMemoryStore::with_default_registry();

        // Naming only one changed block must not keep the other chapter
        // from being recalculated.
        let changed: HashSet<BlockKey> = [BlockKey::from("html-1")].into_iter().collect();
        let updater =
            AggregationUpdater::new("ada", course_key(), &catalog, &log, &store).unwrap();
        updater.update(&changed, false).unwrap();

        let records = store.query("ada", &course_key()).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_unknown_course_fails_construction() {
        let catalog = CourseCatalog::new();
        let log = CompletionLog::new();
        let store = InMemoryStore::with_default_registry();

        let result = AggregationUpdater::new("ada", course_key(), &catalog, &log, &store);
        assert!(matches!(result, Err(UpdateError::Structure(_))));
    }
}
