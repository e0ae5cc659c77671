//! The [`Heap`]: arena growth, best-fit allocation and coalescing release.
//!
// # Implementation notes
// ## Locking
// All bookkeeping (arenas, free index, allocated set) lives in a single `HeapState`
// behind one `Mutex`. Allocation and release are rare compared to accesses of the
// memory they hand out, so the coarse lock is kept over finer-grained schemes.
//
// ## Fork-safety
// Every locked section first compares the current pid with the pid that built the
// state. A mismatch means the heap was inherited through `fork`: the child gets a
// fresh state and never touches the parent's bookkeeping. The inherited arenas stay
// mapped for as long as blocks in the child still reference them.
// Forking while another thread holds the lock is not supported.

use crate::arena::Arena;
use crate::block::Block;
use crate::config::{ArenaSharing, HeapConfig};
use crate::error::{Error, Result};
use crate::free_index::FreeIndex;
use crate::util::{current_pid, page_size, roundup};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use static_assertions::const_assert;
use tracing::{debug, info, instrument, Level};

#[cfg(test)]
mod tests;

/// Every block length is a multiple of this.
pub const ALIGNMENT: usize = 8;

/// Requests must be strictly smaller than this.
pub const MAX_SIZE: usize = isize::MAX as usize;

const_assert!(ALIGNMENT.is_power_of_two());
const_assert!(ALIGNMENT >= core::mem::align_of::<u64>());

static NAMED_ARENA_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A thread-safe sub-allocator over page-backed arenas.
///
/// Blocks are served best-fit from the free index. When no free block is large
/// enough a new arena is mapped, at least as large as the current target size, which
/// doubles with every new arena. Released blocks are merged with their free
/// neighbours right away.
#[derive(Debug)]
pub struct Heap {
    config: HeapConfig,
    state: Mutex<HeapState>,
    pid: fn() -> u32,
}

#[derive(Debug)]
struct HeapState {
    owner_pid: u32,
    arenas: Vec<Arc<Arena>>,
    free: FreeIndex,
    allocated: HashSet<Block>,
    next_arena_size: usize,
}

impl HeapState {
    fn new(config: &HeapConfig, pid: u32) -> Self {
        let next_arena_size = match config.max_arena_size {
            Some(cap) => config.initial_arena_size.min(cap),
            None => config.initial_arena_size,
        };
        HeapState {
            owner_pid: pid,
            arenas: Vec::new(),
            free: FreeIndex::new(),
            allocated: HashSet::new(),
            next_arena_size,
        }
    }
}

/// A snapshot of a heap's bookkeeping.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub arenas: usize,
    pub arena_bytes: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    /// Target size of the next arena.
    pub next_arena_size: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    /// Creates a heap with the default [`HeapConfig`]. No memory is mapped until the
    /// first allocation.
    pub fn new() -> Self {
        Heap::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        Heap::with_pid_source(config, current_pid)
    }

    fn with_pid_source(config: HeapConfig, pid: fn() -> u32) -> Self {
        let state = Mutex::new(HeapState::new(&config, pid()));
        Heap { config, state, pid }
    }

    /// Returns the process-wide default heap, creating it on first use.
    pub fn global() -> &'static Heap {
        static GLOBAL: OnceLock<Heap> = OnceLock::new();
        GLOBAL.get_or_init(Heap::new)
    }

    /// Allocates a block of at least `requested_size` bytes.
    ///
    /// The block length is `requested_size` rounded up to [`ALIGNMENT`] (a request of
    /// zero bytes still yields a non-empty block).
    ///
    /// # Errors
    /// Returns [`Error::InvalidSize`] if `requested_size` is not below [`MAX_SIZE`]
    /// and [`Error::Mapping`] (or [`Error::SharingViolation`] for named arenas) if a
    /// new arena was needed but couldn't be mapped.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    pub fn allocate(&self, requested_size: usize) -> Result<Block> {
        if requested_size >= MAX_SIZE {
            return Err(Error::InvalidSize {
                size: requested_size,
                max: MAX_SIZE,
            });
        }

        let mut state = self.lock();
        let size = roundup(requested_size.max(1), ALIGNMENT);

        let (arena, start, stop) = match state.free.find_at_least(size).cloned() {
            Some(block) => {
                debug!(?block, "Found free block to accomodate request.");
                state.free.remove(&block);
                (block.arena().clone(), block.start(), block.stop())
            }
            None => {
                debug!(size, "No free block is large enough, mapping a new arena.");
                let arena = self.new_arena(&mut state, size)?;
                let stop = arena.size();
                (arena, 0, stop)
            }
        };

        let new_stop = start + size;
        if new_stop < stop {
            state.free.coalesce(Block::new(arena.clone(), new_stop, stop));
        }

        let block = Block::new(arena, start, new_stop);
        state.allocated.insert(block.clone());
        Ok(block)
    }

    /// Returns `block` to the heap and merges it with adjacent free blocks.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBlock`] if `block` is not currently allocated by this
    /// heap, i.e. on a double free, on a block of another heap, or on a block that was
    /// allocated before the process forked.
    #[instrument(level = "debug", skip(self), err(Debug, level = Level::ERROR))]
    pub fn free(&self, block: &Block) -> Result<()> {
        let mut state = self.lock();
        if !state.allocated.remove(block) {
            return Err(Error::InvalidBlock {
                arena: block.arena().id(),
                start: block.start(),
                stop: block.stop(),
            });
        }
        let merged = state.free.coalesce(block.clone());
        debug!(?merged, "Block released.");
        Ok(())
    }

    pub fn stats(&self) -> HeapStats {
        let state = self.lock();
        HeapStats {
            arenas: state.arenas.len(),
            arena_bytes: state.arenas.iter().map(|a| a.size()).sum(),
            allocated_blocks: state.allocated.len(),
            allocated_bytes: state.allocated.iter().map(Block::len).sum(),
            free_blocks: state.free.len(),
            free_bytes: state.free.total_bytes(),
            next_arena_size: state.next_arena_size,
        }
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Locks the state, resetting it first if the process changed since it was built.
    fn lock(&self) -> MutexGuard<'_, HeapState> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|_| panic!("heap state poisoned by a panic while locked"));
        let pid = (self.pid)();
        if state.owner_pid != pid {
            info!(
                parent = state.owner_pid,
                pid, "Process changed since heap initialization, discarding inherited state."
            );
            *state = HeapState::new(&self.config, pid);
        }
        state
    }

    /// Maps a new arena large enough for `size` bytes and doubles the arena target.
    fn new_arena(&self, state: &mut HeapState, size: usize) -> Result<Arc<Arena>> {
        let length = roundup(state.next_arena_size.max(size), page_size());
        let arena = match &self.config.sharing {
            ArenaSharing::Inherited => Arena::create(length)?,
            ArenaSharing::Named { prefix } => {
                let name = format!(
                    "/{prefix}-{}-{}",
                    state.owner_pid,
                    NAMED_ARENA_COUNTER.fetch_add(1, Ordering::Relaxed)
                );
                Arena::create_named(length, &name)?
            }
        };
        info!(id = %arena.id(), length, sharing = ?arena.sharing(), "Allocated a new arena.");

        let doubled = state.next_arena_size.saturating_mul(2).min(MAX_SIZE);
        state.next_arena_size = match self.config.max_arena_size {
            Some(cap) => doubled.min(cap),
            None => doubled,
        };

        let arena = Arc::new(arena);
        state.arenas.push(arena.clone());
        Ok(arena)
    }
}
