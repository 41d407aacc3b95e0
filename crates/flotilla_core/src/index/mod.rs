//! Concurrent spatial index.
//!
//! Maps every live ship to its position and answers range queries while
//! thousands of workers update their own records concurrently. The locking
//! discipline (optimistic or pessimistic) and the storage codec are chosen
//! from `IndexConfig` when the index is built; all of them share the same
//! four operations.

mod codec;
mod error;
mod queue;
mod strategy;
mod tree;

pub use codec::{
    NarrowCodec, NarrowShip, PackedCodec, PackedNarrowCodec, RecordCodec, WideCodec,
};
pub use error::IndexError;
pub use queue::DEFAULT_QUEUE_CAPACITY;

pub use tree::MAX_NODE_WIDTH;

use crate::entity::{EntityId, SpatialToken};
use crate::math::Aabb;
use crate::record::ShipState;
use std::sync::Arc;
use strategy::{LockStrategy, OptimisticLocking, PessimisticLocking};
use tokio::sync::{oneshot, Mutex};
use queue::WriteQueue;
use tree::{Geometry, IndexBackend, Tree};

/// Concurrency discipline for writers and readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingMode {
    /// Readers validate leaf versions instead of locking; writers latch the
    /// ancestor `height` levels above the leaf (0 = leaf, 1 = region, 2 = root)
    /// and give up after `retry_limit` retries.
    Optimistic { height: u8, retry_limit: u32 },
    /// Writers latch the whole path exclusively, readers share it.
    Pessimistic,
}

impl Default for LockingMode {
    fn default() -> Self {
        LockingMode::Optimistic {
            height: 1,
            retry_limit: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    pub locking: LockingMode,
    /// Branching factor per axis: `node_width²` regions of `node_width²` leaves.
    /// Capped at `MAX_NODE_WIDTH`.
    pub node_width: usize,
    pub single_precision: bool,
    pub compressed: bool,
    pub queue_capacity: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            locking: LockingMode::default(),
            node_width: 10,
            single_precision: false,
            compressed: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Snapshot of one record as returned by a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedShip {
    pub token: SpatialToken,
    pub id: EntityId,
    pub state: ShipState,
}

/// A write waiting in the queue, with the channel its result goes back on.
enum WriteOp {
    Insert {
        id: EntityId,
        state: ShipState,
        reply: oneshot::Sender<Result<SpatialToken, IndexError>>,
    },
    Update {
        token: SpatialToken,
        state: ShipState,
        reply: oneshot::Sender<Result<(), IndexError>>,
    },
}

impl WriteOp {
    /// The submitter may have given up waiting. A record inserted for a
    /// submitter that is gone is evicted again, since nobody owns its token.
    fn apply(self, backend: &dyn IndexBackend) {
        match self {
            WriteOp::Insert { id, state, reply } => {
                if let Err(Ok(orphan)) = reply.send(backend.insert(id, &state)) {
                    backend.evict(orphan);
                }
            }
            WriteOp::Update { token, state, reply } => {
                let _ = reply.send(backend.update(token, &state));
            }
        }
    }
}

pub struct SpatialIndex {
    backend: Arc<dyn IndexBackend>,
    queue: WriteQueue<WriteOp>,
}

impl SpatialIndex {
    pub fn new(bounds: Aabb, config: IndexConfig) -> Self {
        let strategy: Box<dyn LockStrategy> = match config.locking {
            LockingMode::Optimistic {
                height,
                retry_limit,
            } => Box::new(OptimisticLocking::new(height, retry_limit)),
            LockingMode::Pessimistic => Box::new(PessimisticLocking),
        };
        let geometry = Geometry::new(bounds, config.node_width);
        let backend: Arc<dyn IndexBackend> = match (config.compressed, config.single_precision) {
            (false, false) => Arc::new(Tree::<WideCodec>::new(geometry, strategy)),
            (false, true) => Arc::new(Tree::<NarrowCodec>::new(geometry, strategy)),
            (true, false) => Arc::new(Tree::<PackedCodec>::new(geometry, strategy)),
            (true, true) => Arc::new(Tree::<PackedNarrowCodec>::new(geometry, strategy)),
        };

        tracing::debug!(
            locking = ?config.locking,
            leaves = geometry.leaf_count(),
            codec = backend.codec_name(),
            "spatial index built"
        );

        Self {
            queue: WriteQueue::new(config.queue_capacity),
            backend,
        }
    }

    pub fn codec_name(&self) -> &'static str {
        self.backend.codec_name()
    }

    pub fn insert(&self, id: EntityId, state: &ShipState) -> Result<SpatialToken, IndexError> {
        self.backend.insert(id, state)
    }

    pub fn update(&self, token: SpatialToken, state: &ShipState) -> Result<(), IndexError> {
        self.backend.update(token, state)
    }

    pub fn remove(&self, token: SpatialToken) -> Result<(), IndexError> {
        self.backend.remove(token)
    }

    /// Removal that waits for latches instead of giving up on contention.
    /// Returns false if the token was already gone.
    pub fn evict(&self, token: SpatialToken) -> bool {
        self.backend.evict(token)
    }

    /// Records whose position lies inside `region`. Never fails.
    pub fn query(&self, region: &Aabb) -> Vec<IndexedShip> {
        self.backend.query(region)
    }

    pub fn get(&self, token: SpatialToken) -> Option<IndexedShip> {
        self.backend.get(token)
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes queued and not yet picked up by a drain task.
    pub fn pending_writes(&self) -> usize {
        self.queue.pending()
    }

    /// Stop accepting queued writes. Writes already queued are still
    /// applied; later submissions fail with `QueueClosed`.
    pub fn close_writes(&self) {
        if self.queue.close() {
            tracing::debug!(pending = self.queue.pending(), "index write queue closed");
        }
    }

    /// Starts the drain tasks on first use. Must run inside a tokio runtime.
    fn ensure_draining(&self) {
        let Some(receiver) = self.queue.take_receiver() else {
            return;
        };
        let receiver = Arc::new(Mutex::new(receiver));
        let drainers = std::thread::available_parallelism().map_or(1, usize::from);
        for _ in 0..drainers {
            let backend = Arc::clone(&self.backend);
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    match next {
                        Some(op) => op.apply(backend.as_ref()),
                        None => break,
                    }
                }
            });
        }
        tracing::debug!(drainers, capacity = self.queue.capacity(), "index write queue draining");
    }

    async fn submit<R>(
        &self,
        op: impl FnOnce(oneshot::Sender<Result<R, IndexError>>) -> WriteOp,
    ) -> Result<R, IndexError> {
        self.ensure_draining();
        let (reply, result) = oneshot::channel();
        self.queue.push(op(reply)).await?;
        result.await.map_err(|_| IndexError::QueueClosed)?
    }

    /// `insert` through the bounded write queue.
    pub async fn submit_insert(
        &self,
        id: EntityId,
        state: &ShipState,
    ) -> Result<SpatialToken, IndexError> {
        let state = *state;
        self.submit(|reply| WriteOp::Insert { id, state, reply })
            .await
    }

    /// `update` through the bounded write queue.
    pub async fn submit_update(
        &self,
        token: SpatialToken,
        state: &ShipState,
    ) -> Result<(), IndexError> {
        let state = *state;
        self.submit(|reply| WriteOp::Update {
            token,
            state,
            reply,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{DVec2, DVec3};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn configs() -> Vec<IndexConfig> {
        let mut configs = Vec::new();
        for locking in [
            LockingMode::Optimistic {
                height: 0,
                retry_limit: 3,
            },
            LockingMode::Optimistic {
                height: 1,
                retry_limit: 3,
            },
            LockingMode::Optimistic {
                height: 2,
                retry_limit: 3,
            },
            LockingMode::Pessimistic,
        ] {
            for (compressed, single_precision) in
                [(false, false), (false, true), (true, false), (true, true)]
            {
                configs.push(IndexConfig {
                    locking,
                    node_width: 3,
                    single_precision,
                    compressed,
                    queue_capacity: 16,
                });
            }
        }
        configs
    }

    fn ship(x: f64, y: f64) -> ShipState {
        ShipState::at(DVec3::new(x, y, 0.0), DVec2::new(1.0, 0.0), 0)
    }

    #[test]
    fn operations_behave_the_same_under_every_configuration() {
        for config in configs() {
            let index = SpatialIndex::new(Aabb::world(1000.0), config.clone());
            let a = index.insert(EntityId(1), &ship(0.0, 0.0)).unwrap();
            let b = index.insert(EntityId(2), &ship(5.0, 5.0)).unwrap();
            let _c = index.insert(EntityId(3), &ship(400.0, 300.0)).unwrap();
            assert_eq!(index.len(), 3, "{config:?}");

            let near = index.query(&Aabb::around(DVec3::ZERO, 10.0));
            let mut ids: Vec<_> = near.iter().map(|hit| hit.id).collect();
            ids.sort();
            assert_eq!(ids, vec![EntityId(1), EntityId(2)], "{config:?}");

            // move `a` far away
            index.update(a, &ship(-400.0, -300.0)).unwrap();
            let near = index.query(&Aabb::around(DVec3::ZERO, 10.0));
            assert_eq!(near.len(), 1, "{config:?}");
            assert_eq!(near[0].token, b);
            let far = index.query(&Aabb::around(DVec3::new(-400.0, -300.0, 0.0), 1.0));
            assert_eq!(far.len(), 1, "{config:?}");
            assert_eq!(far[0].id, EntityId(1));

            index.remove(b).unwrap();
            assert!(index.query(&Aabb::around(DVec3::ZERO, 10.0)).is_empty());
            assert_eq!(index.len(), 2);
        }
    }

    #[test]
    fn removed_tokens_are_rejected() {
        for config in configs() {
            let index = SpatialIndex::new(Aabb::world(1000.0), config);
            let token = index.insert(EntityId(1), &ship(0.0, 0.0)).unwrap();
            index.remove(token).unwrap();

            assert_eq!(
                index.update(token, &ship(1.0, 1.0)),
                Err(IndexError::UnknownToken { token })
            );
            assert_eq!(index.remove(token), Err(IndexError::UnknownToken { token }));
            assert!(index.get(token).is_none());

            // the slot is reused under a new generation
            let fresh = index.insert(EntityId(2), &ship(0.0, 0.0)).unwrap();
            assert_ne!(fresh, token);
            assert!(index.update(token, &ship(2.0, 2.0)).is_err());
        }
    }

    #[test]
    fn identical_update_keeps_query_order() {
        for config in configs() {
            let index = SpatialIndex::new(Aabb::world(1000.0), config);
            let tokens: Vec<_> = (0..4)
                .map(|i| index.insert(EntityId(i), &ship(i as f64, 0.0)).unwrap())
                .collect();
            let region = Aabb::around(DVec3::ZERO, 20.0);
            let before: Vec<_> = index.query(&region).iter().map(|hit| hit.token).collect();

            let current = index.get(tokens[1]).unwrap().state;
            index.update(tokens[1], &current).unwrap();

            let after: Vec<_> = index.query(&region).iter().map(|hit| hit.token).collect();
            assert_eq!(before, after);
        }
    }

    #[test]
    fn z_is_filtered_on_query() {
        let index = SpatialIndex::new(Aabb::world(1000.0), IndexConfig::default());
        let mut high = ship(0.0, 0.0);
        high.position.z = 300.0;
        index.insert(EntityId(1), &high).unwrap();

        assert!(index.query(&Aabb::around(DVec3::ZERO, 10.0)).is_empty());
        assert_eq!(
            index.query(&Aabb::around(DVec3::new(0.0, 0.0, 300.0), 10.0)).len(),
            1
        );
    }

    /// Writers keep every numeric field equal to a per-write stamp; readers
    /// must never observe a record mixing two stamps.
    #[test]
    fn concurrent_readers_never_see_torn_records() {
        for locking in [LockingMode::default(), LockingMode::Pessimistic] {
            let config = IndexConfig {
                locking,
                node_width: 2,
                queue_capacity: 16,
                ..IndexConfig::default()
            };
            let index = SpatialIndex::new(Aabb::world(1000.0), config);
            let tokens: Vec<_> = (0..8)
                .map(|i| index.insert(EntityId(i), &ship(0.0, 0.0)).unwrap())
                .collect();
            let done = AtomicBool::new(false);

            std::thread::scope(|scope| {
                for (w, &token) in tokens.iter().enumerate() {
                    let index = &index;
                    scope.spawn(move || {
                        for k in 1..400u32 {
                            let stamp = (k * 8 + w as u32) as f64;
                            let mut state = ship((k % 7) as f64, (k % 5) as f64);
                            state.velocity = DVec2::splat(stamp);
                            state.acceleration = DVec2::splat(stamp);
                            state.shot_length = stamp;
                            // contention is transient; retry the write
                            while let Err(err) = index.update(token, &state) {
                                assert!(err.is_transient());
                                std::thread::yield_now();
                            }
                        }
                    });
                }
                for _ in 0..3 {
                    let (index, done) = (&index, &done);
                    scope.spawn(move || {
                        while !done.load(Ordering::Acquire) {
                            for hit in index.query(&Aabb::around(DVec3::ZERO, 20.0)) {
                                let s = hit.state;
                                assert_eq!(s.velocity.x, s.shot_length);
                                assert_eq!(s.velocity.y, s.shot_length);
                                assert_eq!(s.acceleration, s.velocity);
                            }
                        }
                    });
                }
                std::thread::sleep(Duration::from_millis(200));
                done.store(true, Ordering::Release);
            });
            assert_eq!(index.len(), 8);
        }
    }

    #[test]
    fn removal_is_final_while_queries_are_in_flight() {
        let index = SpatialIndex::new(Aabb::world(1000.0), IndexConfig::default());
        let tokens: Vec<_> = (0..32)
            .map(|i| index.insert(EntityId(i), &ship(i as f64 % 10.0, 0.0)).unwrap())
            .collect();
        let region = Aabb::around(DVec3::ZERO, 50.0);
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let (reader_index, reader_done) = (&index, &done);
            scope.spawn(move || {
                while !reader_done.load(Ordering::Acquire) {
                    let _ = reader_index.query(&region);
                }
            });
            for &token in &tokens {
                assert!(index.evict(token));
                assert!(index
                    .query(&region)
                    .iter()
                    .all(|hit| hit.token != token));
            }
            done.store(true, Ordering::Release);
        });
        assert!(index.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queued_writes_from_many_submitters_all_land() {
        let config = IndexConfig {
            queue_capacity: 2,
            ..IndexConfig::default()
        };
        let index = Arc::new(SpatialIndex::new(Aabb::world(1000.0), config));
        let writers: Vec<_> = (0..32u64)
            .map(|i| {
                let index = Arc::clone(&index);
                tokio::spawn(async move {
                    let token = index
                        .submit_insert(EntityId(i), &ship(i as f64, 0.0))
                        .await?;
                    index.submit_update(token, &ship(i as f64, 10.0)).await?;
                    Ok::<_, IndexError>(token)
                })
            })
            .collect();
        let mut tokens = Vec::new();
        for writer in writers {
            tokens.push(writer.await.unwrap().unwrap());
        }

        assert_eq!(index.len(), 32);
        assert!(tokens
            .iter()
            .all(|&token| index.get(token).unwrap().state.position.y == 10.0));
        assert_eq!(index.pending_writes(), 0);
    }

    #[tokio::test]
    async fn closed_queue_rejects_submissions_but_keeps_direct_writes() {
        let index = SpatialIndex::new(Aabb::world(1000.0), IndexConfig::default());
        let token = index.submit_insert(EntityId(1), &ship(0.0, 0.0)).await.unwrap();
        index.close_writes();

        assert_eq!(
            index.submit_update(token, &ship(1.0, 0.0)).await,
            Err(IndexError::QueueClosed)
        );
        // eviction on shutdown does not go through the queue
        assert!(index.evict(token));
        assert!(index.is_empty());
    }

    #[test]
    fn insert_for_a_vanished_submitter_is_rolled_back() {
        let index = SpatialIndex::new(Aabb::world(1000.0), IndexConfig::default());
        let (reply, result) = oneshot::channel();
        drop(result);

        WriteOp::Insert {
            id: EntityId(1),
            state: ship(0.0, 0.0),
            reply,
        }
        .apply(index.backend.as_ref());
        assert!(index.is_empty());
    }
}
