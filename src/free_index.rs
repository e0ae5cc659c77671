//! Defines the [`FreeIndex`], the registry of free blocks.
//!
//! Every free block is registered three times:
//! - in `by_length`, bucketed by its length. The map keys double as the sorted set of
//!   distinct free lengths, which makes best-fit lookup *O*(log k).
//! - in `by_start` under `(arena, start)` and in `by_stop` under `(arena, stop)`.
//!   These let a freed block find its free neighbours in *O*(1) so that abutting free
//!   blocks are always merged.

use crate::arena::ArenaId;
use crate::block::Block;

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

type BoundaryKey = (ArenaId, usize);

#[derive(Debug, Default)]
pub struct FreeIndex {
    by_length: BTreeMap<usize, Vec<Block>>,
    by_start: HashMap<BoundaryKey, Block>,
    by_stop: HashMap<BoundaryKey, Block>,
}

impl FreeIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        FreeIndex::default()
    }

    /// Returns a free block of the smallest length that is at least `n`,
    /// or `None` if every free block is shorter.
    pub fn find_at_least(&self, n: usize) -> Option<&Block> {
        self.by_length
            .range(n..)
            .next()
            .and_then(|(_, blocks)| blocks.last())
    }

    /// Registers `block` as free without looking at its neighbours.
    ///
    /// # Panics
    /// Panics if one of the block's boundaries is already taken by a free block.
    pub fn insert(&mut self, block: Block) {
        let previous = self.by_start.insert(block.start_key(), block.clone());
        assert!(previous.is_none(), "free index already holds a block starting at {block:?}");
        let previous = self.by_stop.insert(block.stop_key(), block.clone());
        assert!(previous.is_none(), "free index already holds a block ending at {block:?}");
        self.by_length.entry(block.len()).or_default().push(block);
    }

    /// Deregisters a free block from all three structures.
    ///
    /// # Panics
    /// Panics if the block is not registered in all of them, which means the index is corrupt.
    pub fn remove(&mut self, block: &Block) {
        let by_start = self.by_start.remove(&block.start_key());
        let by_stop = self.by_stop.remove(&block.stop_key());
        assert!(
            by_start.as_ref() == Some(block) && by_stop.as_ref() == Some(block),
            "free index corrupted: boundaries of {block:?} map to {by_start:?} and {by_stop:?}"
        );

        let len = block.len();
        let Some(bucket) = self.by_length.get_mut(&len) else {
            panic!("free index corrupted: no bucket of length {len} for {block:?}");
        };
        let Some(pos) = bucket.iter().position(|b| b == block) else {
            panic!("free index corrupted: {block:?} missing from its length bucket");
        };
        bucket.swap_remove(pos);
        if bucket.is_empty() {
            self.by_length.remove(&len);
        }
    }

    /// Registers `block` as free, first merging it with the free blocks that end
    /// exactly at its start and begin exactly at its stop.
    ///
    /// Neighbours are looked up within the block's own arena only.
    /// Returns the merged block as it was inserted.
    pub fn coalesce(&mut self, block: Block) -> Block {
        let mut start = block.start();
        let mut stop = block.stop();

        if let Some(prev) = self.by_stop.get(&block.start_key()).cloned() {
            debug!(?prev, ?block, "Merging with preceding free block.");
            self.remove(&prev);
            start = prev.start();
        }

        if let Some(next) = self.by_start.get(&block.stop_key()).cloned() {
            debug!(?next, ?block, "Merging with succeeding free block.");
            self.remove(&next);
            stop = next.stop();
        }

        let merged = if (start, stop) == (block.start(), block.stop()) {
            block
        } else {
            Block::new(block.arena().clone(), start, stop)
        };
        self.insert(merged.clone());
        merged
    }

    /// Number of free blocks.
    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    /// Total number of free bytes.
    pub fn total_bytes(&self) -> usize {
        self.by_length
            .iter()
            .map(|(len, blocks)| len * blocks.len())
            .sum()
    }

    /// Iterates over all free blocks in ascending length order.
    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.by_length.values().flatten()
    }
}
