//! Locking strategies for index writers and readers.
//!
//! The tree is three levels deep: one root, `node_width²` regions, and
//! `node_width²` leaves per region. Every node carries a latch. Strategies only
//! decide which latches a writer or reader holds; leaf contents are always
//! replaced under the leaf's own writer lock.

use super::error::IndexError;
use super::tree::{Geometry, LeafId};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

/// Tree level, counted upward from the leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Leaf = 0,
    Region = 1,
    Root = 2,
}

impl Level {
    pub fn from_height(height: u8) -> Self {
        match height {
            0 => Level::Leaf,
            1 => Level::Region,
            _ => Level::Root,
        }
    }
}

/// Node latches, one per tree node.
pub struct Latches {
    geometry: Geometry,
    root: RwLock<()>,
    regions: Vec<RwLock<()>>,
    leaves: Vec<RwLock<()>>,
}

impl Latches {
    pub(crate) fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            root: RwLock::new(()),
            regions: (0..geometry.region_count()).map(|_| RwLock::new(())).collect(),
            leaves: (0..geometry.leaf_count()).map(|_| RwLock::new(())).collect(),
        }
    }

    fn latch(&self, level: Level, node: usize) -> &RwLock<()> {
        match level {
            Level::Leaf => &self.leaves[node],
            Level::Region => &self.regions[node],
            Level::Root => &self.root,
        }
    }

    /// Ancestors of `leaves` at `level`, deduplicated, in lock order.
    fn anchors(&self, leaves: &[LeafId], level: Level) -> Vec<usize> {
        let mut nodes: Vec<usize> = leaves
            .iter()
            .map(|&leaf| match level {
                Level::Leaf => leaf,
                Level::Region => self.geometry.region_of(leaf),
                Level::Root => 0,
            })
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// Try to take every anchor exclusively without blocking.
    fn try_write_anchors(&self, level: Level, nodes: &[usize]) -> Option<Vec<RwLockWriteGuard<'_, ()>>> {
        let mut guards = Vec::with_capacity(nodes.len());
        for &node in nodes {
            match self.latch(level, node).try_write() {
                Ok(guard) => guards.push(guard),
                Err(TryLockError::Poisoned(poisoned)) => guards.push(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => return None,
            }
        }
        Some(guards)
    }

    /// Exclusive latches on the full path (root, regions, leaves), blocking.
    pub(crate) fn write_path(&self, leaves: &[LeafId]) -> Vec<RwLockWriteGuard<'_, ()>> {
        let mut guards = vec![write_blocking(&self.root)];
        for level in [Level::Region, Level::Leaf] {
            for node in self.anchors(leaves, level) {
                guards.push(write_blocking(self.latch(level, node)));
            }
        }
        guards
    }

    /// Shared latches on the full path to one leaf, blocking.
    fn read_path(&self, leaf: LeafId) -> Vec<RwLockReadGuard<'_, ()>> {
        vec![
            read_blocking(&self.root),
            read_blocking(&self.regions[self.geometry.region_of(leaf)]),
            read_blocking(&self.leaves[leaf]),
        ]
    }
}

fn write_blocking(lock: &RwLock<()>) -> RwLockWriteGuard<'_, ()> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn read_blocking(lock: &RwLock<()>) -> RwLockReadGuard<'_, ()> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Latches held by a writer for the duration of one mutation.
#[derive(Debug)]
pub struct WriteLatch<'a> {
    _guards: Vec<RwLockWriteGuard<'a, ()>>,
    attempts: u32,
}

impl WriteLatch<'_> {
    /// Acquisition attempts it took (1 = uncontended).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// How a reader should access one leaf.
pub enum ReadPlan<'a> {
    /// Copy without latches, re-reading while the leaf version moves, at
    /// most `attempts` times.
    Validate { attempts: u32 },
    /// Copy while holding these shared latches.
    Locked(Vec<RwLockReadGuard<'a, ()>>),
}

/// Concurrency discipline selected when the index is built.
pub trait LockStrategy: Send + Sync + fmt::Debug {
    fn lock_for_write<'a>(
        &self,
        latches: &'a Latches,
        leaves: &[LeafId],
    ) -> Result<WriteLatch<'a>, IndexError>;

    fn lock_for_read<'a>(&self, latches: &'a Latches, leaf: LeafId) -> ReadPlan<'a>;
}

/// Writers latch only the ancestors `height` levels above the touched leaves,
/// retrying on contention up to `retry_limit` times. Readers never latch.
#[derive(Debug, Clone, Copy)]
pub struct OptimisticLocking {
    level: Level,
    retry_limit: u32,
    read_attempts: u32,
}

impl OptimisticLocking {
    pub fn new(height: u8, retry_limit: u32) -> Self {
        Self {
            level: Level::from_height(height),
            retry_limit,
            read_attempts: 8,
        }
    }
}

impl LockStrategy for OptimisticLocking {
    fn lock_for_write<'a>(
        &self,
        latches: &'a Latches,
        leaves: &[LeafId],
    ) -> Result<WriteLatch<'a>, IndexError> {
        let nodes = latches.anchors(leaves, self.level);
        let attempts = self.retry_limit + 1;
        for attempt in 1..=attempts {
            if let Some(guards) = latches.try_write_anchors(self.level, &nodes) {
                return Ok(WriteLatch {
                    _guards: guards,
                    attempts: attempt,
                });
            }
            std::thread::yield_now();
        }
        Err(IndexError::ContentionExceeded { attempts })
    }

    fn lock_for_read<'a>(&self, _latches: &'a Latches, _leaf: LeafId) -> ReadPlan<'a> {
        ReadPlan::Validate {
            attempts: self.read_attempts,
        }
    }
}

/// Writers take exclusive latches along the full path; readers take shared ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct PessimisticLocking;

impl LockStrategy for PessimisticLocking {
    fn lock_for_write<'a>(
        &self,
        latches: &'a Latches,
        leaves: &[LeafId],
    ) -> Result<WriteLatch<'a>, IndexError> {
        Ok(WriteLatch {
            _guards: latches.write_path(leaves),
            attempts: 1,
        })
    }

    fn lock_for_read<'a>(&self, latches: &'a Latches, leaf: LeafId) -> ReadPlan<'a> {
        ReadPlan::Locked(latches.read_path(leaf))
    }
}
