//! The transactional dataset-graph collaborator.
//!
//! The real RDF store lives outside the overlay core; this module defines
//! the narrow interface the core drives it through (begin/commit/end with
//! an access mode) plus an in-memory implementation used by tests, demos
//! and as the default backing store of a peer.
//!
//! Discipline: `begin` must be paired with `end` on every path; `end` runs
//! on drop, `commit` is called explicitly on the write path before the
//! transaction goes out of scope.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::core::{Quadruple, QuadruplePattern};

/// Access mode requested when beginning a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Reads only; mutation attempts fail.
    ReadOnly,
    /// Reads and buffered mutations, applied on commit.
    Write,
}

/// Errors surfaced by the storage collaborator.
#[derive(Debug)]
pub enum StorageError {
    /// A mutation was attempted on a read-only transaction.
    ReadOnly,
    /// The backing store failed.
    Backend(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ReadOnly => write!(f, "mutation attempted on a read-only transaction"),
            StorageError::Backend(msg) => write!(f, "storage backend error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// One open transaction against a dataset graph.
///
/// Dropping the transaction without committing discards buffered writes
/// (the `end`-without-`commit` path of the error-handling design).
pub trait DatasetTransaction: Send {
    /// All stored quadruples matching the pattern, as visible to this
    /// transaction (committed data plus this transaction's buffered writes).
    fn find(&self, pattern: &QuadruplePattern) -> Result<Vec<Quadruple>, StorageError>;

    /// Buffer the insertion of a quadruple.
    fn add(&mut self, quad: Quadruple) -> Result<(), StorageError>;

    /// Buffer the deletion of every quadruple matching the pattern,
    /// returning how many committed quadruples currently match.
    fn delete_matching(&mut self, pattern: &QuadruplePattern) -> Result<usize, StorageError>;

    /// Apply buffered mutations.
    fn commit(&mut self) -> Result<(), StorageError>;
}

/// The dataset-graph collaborator interface.
pub trait DatasetGraph: Send + Sync {
    /// Open a transaction in the given access mode.
    fn begin(&self, mode: AccessMode) -> Result<Box<dyn DatasetTransaction>, StorageError>;
}

/// In-memory dataset graph: a `RwLock`-guarded set of quadruples.
#[derive(Clone, Default)]
pub struct MemoryDataset {
    quads: Arc<RwLock<HashSet<Quadruple>>>,
}

impl MemoryDataset {
    /// An empty dataset.
    pub fn new() -> Self {
        MemoryDataset { quads: Arc::new(RwLock::new(HashSet::new())) }
    }

    /// Number of stored quadruples; drives the stored-quadruples load
    /// criterion.
    pub fn len(&self) -> usize {
        self.quads.read().map(|g| g.len()).unwrap_or(0)
    }

    /// Whether the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct MemoryTransaction {
    quads: Arc<RwLock<HashSet<Quadruple>>>,
    mode: AccessMode,
    pending_adds: Vec<Quadruple>,
    pending_deletes: Vec<QuadruplePattern>,
}

impl DatasetTransaction for MemoryTransaction {
    fn find(&self, pattern: &QuadruplePattern) -> Result<Vec<Quadruple>, StorageError> {
        let guard = self
            .quads
            .read()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let mut found: Vec<Quadruple> = guard
            .iter()
            .filter(|q| pattern.matches(q))
            .filter(|q| !self.pending_deletes.iter().any(|p| p.matches(q)))
            .cloned()
            .collect();
        for quad in &self.pending_adds {
            if pattern.matches(quad) && !found.contains(quad) {
                found.push(quad.clone());
            }
        }
        Ok(found)
    }

    fn add(&mut self, quad: Quadruple) -> Result<(), StorageError> {
        if self.mode == AccessMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }
        self.pending_adds.push(quad);
        Ok(())
    }

    fn delete_matching(&mut self, pattern: &QuadruplePattern) -> Result<usize, StorageError> {
        if self.mode == AccessMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }
        let guard = self
            .quads
            .read()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let matching = guard.iter().filter(|q| pattern.matches(q)).count();
        drop(guard);
        self.pending_deletes.push(pattern.clone());
        self.pending_adds.retain(|q| !pattern.matches(q));
        Ok(matching)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.mode == AccessMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }
        let mut guard = self
            .quads
            .write()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        for pattern in self.pending_deletes.drain(..) {
            guard.retain(|q| !pattern.matches(q));
        }
        for quad in self.pending_adds.drain(..) {
            guard.insert(quad);
        }
        Ok(())
    }
}

impl DatasetGraph for MemoryDataset {
    fn begin(&self, mode: AccessMode) -> Result<Box<dyn DatasetTransaction>, StorageError> {
        Ok(Box::new(MemoryTransaction {
            quads: Arc::clone(&self.quads),
            mode,
            pending_adds: Vec::new(),
            pending_deletes: Vec::new(),
        }))
    }
}
