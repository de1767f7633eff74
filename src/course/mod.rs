//! Course structure provider.
//!
//! This module resolves the shape of a course's content tree: which blocks
//! exist, how they nest, and how each block participates in completion
//! aggregation. The tree is materialized once per update so the recursive
//! walk never has to query the provider again.

use crate::models::{BlockKey, CourseKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// How a block participates in completion aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// Contributes nothing to any ancestor and is never persisted.
    Excluded,
    /// A leaf block with a directly recorded completion value.
    Completable,
    /// An internal block whose completion is derived from its children.
    Aggregator,
}

impl fmt::Display for CompletionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionMode::Excluded => write!(f, "excluded"),
            CompletionMode::Completable => write!(f, "completable"),
            CompletionMode::Aggregator => write!(f, "aggregator"),
        }
    }
}

/// Errors from resolving course structure.
#[derive(Error, Debug)]
pub enum StructureError {
    /// The requested course is not known to the provider.
    #[error("course not found: {0}")]
    CourseNotFound(CourseKey),
    /// A block key was referenced but has no entry in the structure.
    #[error("unknown block in course structure: {0}")]
    UnknownBlock(BlockKey),
    /// The declared root block has no entry in the structure.
    #[error("course root block is not defined: {0}")]
    MissingRoot(BlockKey),
    /// The child graph loops back on itself.
    #[error("course structure contains a cycle through block: {0}")]
    Cycle(BlockKey),
    /// Reading a course file from disk failed.
    #[error("failed to read course file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Parsing a course file failed.
    #[error("failed to parse course file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Description of a single block within a course structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockNode {
    /// The block's grouping type, e.g. "course", "chapter", "html".
    /// Doubles as the aggregation name for aggregator blocks.
    pub block_type: String,
    /// How the block participates in aggregation.
    pub mode: CompletionMode,
    /// Child blocks, in course order.
    #[serde(default)]
    pub children: Vec<BlockKey>,
}

/// Fully materialized content tree for one course.
///
/// Lookups are O(1) by block key; the aggregation walk relies on that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseBlocks {
    root: BlockKey,
    blocks: HashMap<BlockKey, BlockNode>,
}

impl CourseBlocks {
    /// Build a course structure from a root key and block map.
    ///
    /// Fails if the root is missing, any child reference dangles, or the
    /// child graph contains a cycle.
    pub fn new(
        root: BlockKey,
        blocks: HashMap<BlockKey, BlockNode>,
    ) -> Result<Self, StructureError> {
        if !blocks.contains_key(&root) {
            return Err(StructureError::MissingRoot(root));
        }
        let structure = Self { root, blocks };
        structure.check_references()?;
        structure.check_acyclic()?;
        Ok(structure)
    }

    /// The course root block.
    pub fn root(&self) -> &BlockKey {
        &self.root
    }

    /// Number of blocks in the structure.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of blocks with the given completion mode.
    pub fn count_by_mode(&self, mode: CompletionMode) -> usize {
        self.blocks.values().filter(|node| node.mode == mode).count()
    }

    /// Look up a block's node entry.
    pub fn get(&self, block: &BlockKey) -> Result<&BlockNode, StructureError> {
        self.blocks
            .get(block)
            .ok_or_else(|| StructureError::UnknownBlock(block.clone()))
    }

    /// The completion mode of a block.
    pub fn mode_of(&self, block: &BlockKey) -> Result<CompletionMode, StructureError> {
        Ok(self.get(block)?.mode)
    }

    /// The children of a block, in course order.
    pub fn children(&self, block: &BlockKey) -> Result<&[BlockKey], StructureError> {
        Ok(self.get(block)?.children.as_slice())
    }

    /// The aggregation name of a block (its block type).
    pub fn aggregation_name(&self, block: &BlockKey) -> Result<&str, StructureError> {
        Ok(self.get(block)?.block_type.as_str())
    }

    /// Verify that every child reference points at a known block.
    fn check_references(&self) -> Result<(), StructureError> {
        for node in self.blocks.values() {
            for child in &node.children {
                if !self.blocks.contains_key(child) {
                    return Err(StructureError::UnknownBlock(child.clone()));
                }
            }
        }
        Ok(())
    }

    /// Verify the child graph is acyclic so the recursive walk terminates.
    fn check_acyclic(&self) -> Result<(), StructureError> {
        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        self.visit(&self.root, &mut visiting, &mut visited)
    }

    fn visit<'a>(
        &'a self,
        block: &'a BlockKey,
        visiting: &mut HashSet<&'a BlockKey>,
        visited: &mut HashSet<&'a BlockKey>,
    ) -> Result<(), StructureError> {
        if visited.contains(block) {
            return Ok(());
        }
        if !visiting.insert(block) {
            return Err(StructureError::Cycle(block.clone()));
        }
        for child in &self.blocks[block].children {
            self.visit(child, visiting, visited)?;
        }
        visiting.remove(block);
        visited.insert(block);
        Ok(())
    }
}

/// Read-only provider of course content trees.
pub trait CourseStore {
    /// Resolve the root block for a course.
    fn resolve_root(&self, course_key: &CourseKey) -> Result<BlockKey, StructureError>;

    /// Materialize the full content tree for a course.
    fn load_structure(&self, course_key: &CourseKey) -> Result<CourseBlocks, StructureError>;
}

/// On-disk course description.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CourseFile {
    course_key: CourseKey,
    root: BlockKey,
    blocks: HashMap<BlockKey, BlockNode>,
}

/// Course provider backed by JSON course descriptions.
#[derive(Debug, Clone, Default)]
pub struct CourseCatalog {
    courses: HashMap<CourseKey, CourseBlocks>,
}

impl CourseCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a course structure to the catalog.
    pub fn insert(&mut self, course_key: CourseKey, blocks: CourseBlocks) {
        self.courses.insert(course_key, blocks);
    }

    /// Load a course description from a JSON file and add it.
    ///
    /// Returns the key of the loaded course.
    pub fn load_file(&mut self, path: &Path) -> Result<CourseKey, StructureError> {
        let content = std::fs::read_to_string(path).map_err(|source| StructureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_str(&content, path)
    }

    /// Parse a course description from a JSON string and add it.
    pub fn load_str(&mut self, content: &str, path: &Path) -> Result<CourseKey, StructureError> {
        let file: CourseFile =
            serde_json::from_str(content).map_err(|source| StructureError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let blocks = CourseBlocks::new(file.root, file.blocks)?;
        info!(
            "Loaded course {} with {} blocks",
            file.course_key,
            blocks.block_count()
        );
        debug!(
            "{} aggregators, {} completable, {} excluded",
            blocks.count_by_mode(CompletionMode::Aggregator),
            blocks.count_by_mode(CompletionMode::Completable),
            blocks.count_by_mode(CompletionMode::Excluded),
        );

        let key = file.course_key.clone();
        self.courses.insert(file.course_key, blocks);
        Ok(key)
    }

    /// Keys of every course in the catalog.
    pub fn course_keys(&self) -> impl Iterator<Item = &CourseKey> {
        self.courses.keys()
    }
}

impl CourseStore for CourseCatalog {
    fn resolve_root(&self, course_key: &CourseKey) -> Result<BlockKey, StructureError> {
        let blocks = self
            .courses
            .get(course_key)
            .ok_or_else(|| StructureError::CourseNotFound(course_key.clone()))?;
        Ok(blocks.root().clone())
    }

    fn load_structure(&self, course_key: &CourseKey) -> Result<CourseBlocks, StructureError> {
        self.courses
            .get(course_key)
            .cloned()
            .ok_or_else(|| StructureError::CourseNotFound(course_key.clone()))
    }
}
