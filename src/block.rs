//! Defines the [`Block`] descriptor.

use crate::arena::{Arena, ArenaId};

use core::ptr::NonNull;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A contiguous byte range `[start, stop)` inside one [`Arena`].
///
/// Blocks are plain descriptors: cloning one does not duplicate memory, and the bytes
/// belong to the arena. Two blocks are equal when they describe the same range of the
/// same arena.
#[derive(Clone)]
pub struct Block {
    arena: Arc<Arena>,
    start: usize,
    stop: usize,
}

impl Block {
    /// # Panics
    /// Panics in debug builds if the range is empty or exceeds the arena.
    #[inline]
    pub(crate) fn new(arena: Arc<Arena>, start: usize, stop: usize) -> Self {
        debug_assert!(start < stop, "blocks can't be empty: [{start}, {stop})");
        debug_assert!(stop <= arena.size(), "block exceeds its arena");
        Block { arena, start, stop }
    }

    #[inline]
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn stop(&self) -> usize {
        self.stop
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    /// Returns the absolute address of the first byte of the block.
    #[inline]
    pub fn address(&self) -> NonNull<u8> {
        self.arena.address_of(self.start)
    }

    /// Boundary key of the block's first byte.
    #[inline]
    pub(crate) fn start_key(&self) -> (ArenaId, usize) {
        (self.arena.id(), self.start)
    }

    /// Boundary key one past the block's last byte.
    #[inline]
    pub(crate) fn stop_key(&self) -> (ArenaId, usize) {
        (self.arena.id(), self.stop)
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.arena.id() == other.arena.id() && self.start == other.start && self.stop == other.stop
    }
}

impl Eq for Block {}

impl Hash for Block {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.arena.id().hash(state);
        self.start.hash(state);
        self.stop.hash(state);
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..{}]", self.arena.id(), self.start, self.stop)
    }
}
