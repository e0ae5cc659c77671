//! Configuration of a [`Heap`](crate::Heap).

use crate::util::page_size;

/// How the arenas of a heap are shared with other processes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ArenaSharing {
    /// Anonymous arenas, visible to children forked after their creation.
    #[default]
    Inherited,
    /// Arenas registered under unique names of the form `/{prefix}-{pid}-{counter}`,
    /// reopenable by unrelated processes.
    Named { prefix: String },
}

/// Heap tuning knobs.
///
/// ```
/// use mmap_heap::{ArenaSharing, Heap, HeapConfig};
///
/// let heap = Heap::with_config(
///     HeapConfig::default()
///         .initial_arena_size(64 * 1024)
///         .max_arena_size(16 * 1024 * 1024)
///         .sharing(ArenaSharing::Named { prefix: "my-app".into() }),
/// );
/// # drop(heap);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    pub(crate) initial_arena_size: usize,
    pub(crate) max_arena_size: Option<usize>,
    pub(crate) sharing: ArenaSharing,
}

impl Default for HeapConfig {
    /// One page for the first arena, uncapped growth, inherited arenas.
    fn default() -> Self {
        HeapConfig {
            initial_arena_size: page_size(),
            max_arena_size: None,
            sharing: ArenaSharing::Inherited,
        }
    }
}

impl HeapConfig {
    /// Target size of the first arena. Every new arena doubles the target.
    /// Zero is treated as one page.
    pub fn initial_arena_size(mut self, size: usize) -> Self {
        self.initial_arena_size = size.max(page_size());
        self
    }

    /// Stops doubling the arena target at `size`.
    ///
    /// Requests larger than the cap still get a dedicated arena of their own size.
    pub fn max_arena_size(mut self, size: usize) -> Self {
        self.max_arena_size = Some(size.max(page_size()));
        self
    }

    pub fn sharing(mut self, sharing: ArenaSharing) -> Self {
        self.sharing = sharing;
        self
    }
}
