//! Fixed-shape spatial tree over the world's x/y plane.
//!
//! Leaves are uniform grid cells; each holds the entries whose position falls
//! inside it (positions outside the world are clamped to the edge cells). A
//! per-leaf version is bumped on every change so optimistic readers can
//! validate what they copied.

use super::codec::RecordCodec;
use super::error::IndexError;
use super::strategy::{Latches, LockStrategy, ReadPlan};
use super::IndexedShip;
use crate::entity::{EntityId, SpatialToken, TokenSlots};
use crate::math::{Aabb, DVec2, DVec3};
use crate::record::ShipState;
use arc_swap::{ArcSwap, Guard};
use dashmap::DashMap;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type LeafId = usize;

/// Widest accepted branching factor. The tree is three levels deep, so the
/// leaf count grows with the fourth power of the width.
pub const MAX_NODE_WIDTH: usize = 32;

/// Maps world positions to leaves and leaves to regions.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    bounds: Aabb,
    node_width: usize,
    leaves_per_axis: usize,
    cell: DVec2,
}

impl Geometry {
    /// `node_width` is clamped to `1..=MAX_NODE_WIDTH`.
    pub fn new(bounds: Aabb, node_width: usize) -> Self {
        let node_width = node_width.clamp(1, MAX_NODE_WIDTH);
        let leaves_per_axis = node_width * node_width;
        let extent = bounds.size().truncate().max(DVec2::splat(f64::EPSILON));
        Self {
            bounds,
            node_width,
            leaves_per_axis,
            cell: extent / leaves_per_axis as f64,
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves_per_axis * self.leaves_per_axis
    }

    pub fn region_count(&self) -> usize {
        self.node_width * self.node_width
    }

    fn axis_cell(&self, value: f64, min: f64, size: f64) -> usize {
        let cell = ((value - min) / size).floor();
        // NaN and negatives saturate to 0
        (cell as usize).min(self.leaves_per_axis - 1)
    }

    fn cell_of(&self, point: DVec3) -> (usize, usize) {
        (
            self.axis_cell(point.x, self.bounds.min.x, self.cell.x),
            self.axis_cell(point.y, self.bounds.min.y, self.cell.y),
        )
    }

    pub fn leaf_of(&self, point: DVec3) -> LeafId {
        let (x, y) = self.cell_of(point);
        y * self.leaves_per_axis + x
    }

    pub fn region_of(&self, leaf: LeafId) -> usize {
        let (x, y) = (leaf % self.leaves_per_axis, leaf / self.leaves_per_axis);
        (y / self.node_width) * self.node_width + x / self.node_width
    }

    /// Leaves whose cells overlap `region` on the x/y plane.
    pub fn leaves_overlapping(&self, region: &Aabb) -> impl Iterator<Item = LeafId> {
        let (x0, y0) = self.cell_of(region.min);
        let (x1, y1) = self.cell_of(region.max);
        let stride = self.leaves_per_axis;
        (y0..=y1).flat_map(move |y| (x0..=x1).map(move |x| y * stride + x))
    }
}

#[derive(Clone)]
struct Entry<S> {
    token: SpatialToken,
    id: EntityId,
    stored: S,
}

/// Leaf storage: an immutable snapshot that writers replace wholesale.
///
/// Writers serialize on `writer`, copy the current snapshot, edit the copy,
/// then publish it and bump the version. Readers load the snapshot without
/// taking any lock.
struct Leaf<S> {
    snapshot: ArcSwap<Vec<Entry<S>>>,
    writer: Mutex<()>,
    version: AtomicU64,
}

impl<S: Clone> Leaf<S> {
    fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(()),
            version: AtomicU64::new(0),
        }
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entries(&self) -> Guard<Arc<Vec<Entry<S>>>> {
        self.snapshot.load()
    }

    /// Working copy for a writer holding `lock_writer`.
    fn staged(&self) -> Vec<Entry<S>> {
        Vec::clone(&self.snapshot.load())
    }

    /// Called with the writer lock held.
    fn publish(&self, entries: Vec<Entry<S>>) {
        self.snapshot.store(Arc::new(entries));
        self.version.fetch_add(1, Ordering::Release);
    }
}

/// Type-erased index storage so the codec can be chosen at runtime.
pub(crate) trait IndexBackend: Send + Sync {
    fn codec_name(&self) -> &'static str;
    fn insert(&self, id: EntityId, state: &ShipState) -> Result<SpatialToken, IndexError>;
    fn update(&self, token: SpatialToken, state: &ShipState) -> Result<(), IndexError>;
    fn remove(&self, token: SpatialToken) -> Result<(), IndexError>;
    fn evict(&self, token: SpatialToken) -> bool;
    fn query(&self, region: &Aabb) -> Vec<IndexedShip>;
    fn get(&self, token: SpatialToken) -> Option<IndexedShip>;
    fn len(&self) -> usize;
}

pub(crate) struct Tree<C: RecordCodec> {
    geometry: Geometry,
    latches: Latches,
    leaves: Vec<Leaf<C::Stored>>,
    locator: DashMap<SpatialToken, LeafId>,
    slots: Mutex<TokenSlots>,
    strategy: Box<dyn LockStrategy>,
    _codec: PhantomData<fn() -> C>,
}

impl<C: RecordCodec> Tree<C> {
    pub fn new(geometry: Geometry, strategy: Box<dyn LockStrategy>) -> Self {
        Self {
            geometry,
            latches: Latches::new(geometry),
            leaves: (0..geometry.leaf_count()).map(|_| Leaf::new()).collect(),
            locator: DashMap::new(),
            slots: Mutex::new(TokenSlots::default()),
            strategy,
            _codec: PhantomData,
        }
    }

    fn locate(&self, token: SpatialToken) -> Result<LeafId, IndexError> {
        self.locator
            .get(&token)
            .map(|leaf| *leaf.value())
            .ok_or(IndexError::UnknownToken { token })
    }

    /// Removes the entry; the caller holds the write latch.
    fn detach(&self, token: SpatialToken, leaf: LeafId) -> Result<(), IndexError> {
        let cell = &self.leaves[leaf];
        let writer = cell.lock_writer();
        let mut entries = cell.staged();
        let pos = entries
            .iter()
            .position(|entry| entry.token == token)
            .ok_or(IndexError::UnknownToken { token })?;
        entries.remove(pos);
        cell.publish(entries);
        self.locator.remove(&token);
        drop(writer);
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(token);
        Ok(())
    }

    fn copy_matching(
        entries: &[Entry<C::Stored>],
        region: &Aabb,
        out: &mut Vec<Entry<C::Stored>>,
    ) {
        out.extend(
            entries
                .iter()
                .filter(|entry| region.contains(C::position(&entry.stored)))
                .cloned(),
        );
    }

    fn collect_leaf(&self, leaf: LeafId, region: &Aabb, out: &mut Vec<Entry<C::Stored>>) {
        let cell = &self.leaves[leaf];
        match self.strategy.lock_for_read(&self.latches, leaf) {
            ReadPlan::Locked(_latch) => Self::copy_matching(&cell.entries(), region, out),
            ReadPlan::Validate { attempts } => {
                // Retry while writers keep publishing; the last copy is a
                // consistent snapshot either way.
                let mark = out.len();
                for _ in 1..attempts.max(1) {
                    let stamp = cell.version.load(Ordering::Acquire);
                    Self::copy_matching(&cell.entries(), region, out);
                    if cell.version.load(Ordering::Acquire) == stamp {
                        return;
                    }
                    out.truncate(mark);
                    std::hint::spin_loop();
                }
                Self::copy_matching(&cell.entries(), region, out);
            }
        }
    }

    #[cfg(test)]
    fn leaf_version(&self, leaf: LeafId) -> u64 {
        self.leaves[leaf].version.load(Ordering::Acquire)
    }
}

impl<C: RecordCodec> IndexBackend for Tree<C> {
    fn codec_name(&self) -> &'static str {
        C::NAME
    }

    fn insert(&self, id: EntityId, state: &ShipState) -> Result<SpatialToken, IndexError> {
        let leaf = self.geometry.leaf_of(state.position);
        let _latch = self.strategy.lock_for_write(&self.latches, &[leaf])?;
        let token = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .alloc();

        let cell = &self.leaves[leaf];
        let _writer = cell.lock_writer();
        let mut entries = cell.staged();
        entries.push(Entry {
            token,
            id,
            stored: C::encode(state),
        });
        cell.publish(entries);
        self.locator.insert(token, leaf);
        Ok(token)
    }

    fn update(&self, token: SpatialToken, state: &ShipState) -> Result<(), IndexError> {
        let from = self.locate(token)?;
        let to = self.geometry.leaf_of(state.position);
        let stored = C::encode(state);
        let latch = self.strategy.lock_for_write(&self.latches, &[from, to])?;
        if latch.attempts() > 1 {
            tracing::trace!(attempts = latch.attempts(), ?token, "update latched after contention");
        }

        if from == to {
            let cell = &self.leaves[from];
            let _writer = cell.lock_writer();
            let current = cell.entries();
            let pos = current
                .iter()
                .position(|entry| entry.token == token)
                .ok_or(IndexError::UnknownToken { token })?;
            // Identical writes leave the leaf (and its version) untouched.
            if current[pos].stored == stored {
                return Ok(());
            }
            let mut entries = Vec::clone(&current);
            drop(current);
            entries[pos].stored = stored;
            cell.publish(entries);
            return Ok(());
        }

        // Writer locks are taken in leaf order.
        let (low, high) = (from.min(to), from.max(to));
        let _low = self.leaves[low].lock_writer();
        let _high = self.leaves[high].lock_writer();
        let mut source = self.leaves[from].staged();
        let pos = source
            .iter()
            .position(|entry| entry.token == token)
            .ok_or(IndexError::UnknownToken { token })?;
        let mut entry = source.remove(pos);
        entry.stored = stored;
        let mut target = self.leaves[to].staged();
        target.push(entry);
        // Target first: a concurrent query may see the record twice, never zero times.
        self.leaves[to].publish(target);
        self.leaves[from].publish(source);
        self.locator.insert(token, to);
        Ok(())
    }

    fn remove(&self, token: SpatialToken) -> Result<(), IndexError> {
        let leaf = self.locate(token)?;
        let _latch = self.strategy.lock_for_write(&self.latches, &[leaf])?;
        self.detach(token, leaf)
    }

    fn evict(&self, token: SpatialToken) -> bool {
        let Ok(leaf) = self.locate(token) else {
            return false;
        };
        let _latch = self.latches.write_path(&[leaf]);
        self.detach(token, leaf).is_ok()
    }

    fn query(&self, region: &Aabb) -> Vec<IndexedShip> {
        let mut hits = Vec::new();
        for leaf in self.geometry.leaves_overlapping(region) {
            self.collect_leaf(leaf, region, &mut hits);
        }
        // A record moving between two scanned leaves can be copied twice.
        let mut seen = HashSet::with_capacity(hits.len());
        hits.into_iter()
            .filter(|entry| seen.insert(entry.token))
            .map(|entry| IndexedShip {
                token: entry.token,
                id: entry.id,
                state: C::decode(&entry.stored),
            })
            .collect()
    }

    fn get(&self, token: SpatialToken) -> Option<IndexedShip> {
        let leaf = self.locate(token).ok()?;
        let entries = self.leaves[leaf].entries();
        entries
            .iter()
            .find(|entry| entry.token == token)
            .map(|entry| IndexedShip {
                token,
                id: entry.id,
                state: C::decode(&entry.stored),
            })
    }

    fn len(&self) -> usize {
        self.locator.len()
    }
}
