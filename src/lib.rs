//! A fork-safe sub-allocator for shareable memory.
//!
//! Mapping memory that other processes can see is expensive: every mapping is a
//! system call, a kernel object and usually at least a page of memory. This crate
//! maps memory in large page-backed [arenas](Arena) and carves them into blocks of
//! any size, so that many small shareable buffers cost only a handful of mappings.
//!
//! # Usage
//! ```
//! use mmap_heap::{Buffer, Heap};
//!
//! // Buffers from the process-wide heap are released when dropped.
//! let mut buf = Buffer::new(1000)?;
//! buf.as_mut_slice().fill(7);
//!
//! // Or manage a heap of your own.
//! let heap = Heap::new();
//! let block = heap.allocate(64)?;
//! assert_eq!(block.len(), 64);
//! heap.free(&block)?;
//! # Ok::<(), mmap_heap::Error>(())
//! ```
//!
//! # Mode of operation
//! ## Blocks
//! A [`Block`] is a `[start, stop)` byte range inside one arena. Blocks are plain
//! descriptors and never span two arenas. All block lengths are multiples of
//! [`ALIGNMENT`], so every block starts 8-byte-aligned within its page-aligned arena.
//!
//! ## Free index
//! Free blocks are indexed by length (for best-fit lookup) and by both of their
//! boundaries (for merging). An allocation takes the free block of the smallest
//! sufficient length and returns the unused tail to the index. A release merges the
//! block with the free blocks that end where it starts and start where it ends, so
//! abutting free blocks never exist.
//!
//! ## Growth
//! When no free block is large enough the heap maps a new arena of at least the
//! current target size and doubles the target. The number of mappings thus grows
//! logarithmically with the amount of memory requested. The target can be capped
//! through [`HeapConfig::max_arena_size`]. Arenas are never returned to the OS while
//! the heap lives.
//!
//! ## Sharing and fork-safety
//! Arenas are `MAP_SHARED`: a forked child sees the same bytes as its parent.
//! The *bookkeeping* is never shared. A heap notices when it is used from a process
//! other than the one that set it up and starts over with empty state, leaving the
//! inherited blocks to whoever holds them. Arenas can also be
//! [named](ArenaSharing::Named) and [reopened](Arena::reopen) by unrelated processes
//! through their [`ArenaDescriptor`].
//!
//! ## Locking
//! A [`Heap`] is a passive structure behind a single mutex. Allocations and releases
//! are serialized; use of the memory itself is not synchronized.

pub use crate::arena::{Arena, ArenaDescriptor, ArenaId, Sharing};
pub use crate::block::Block;
pub use crate::buffer::Buffer;
pub use crate::config::{ArenaSharing, HeapConfig};
pub use crate::error::{Error, Result};
pub use crate::heap::{Heap, HeapStats, ALIGNMENT, MAX_SIZE};
pub use crate::util::page_size;

pub mod arena;
mod block;
mod buffer;
mod config;
mod error;
mod free_index;
pub mod heap;
mod util;
