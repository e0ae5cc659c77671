//! [`Buffer`]: an allocated block that returns itself to its heap.

use crate::arena::Arena;
use crate::block::Block;
use crate::error::Result;
use crate::heap::Heap;

use core::ptr::NonNull;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

/// Owns one block of a [`Heap`] and releases it exactly once, either through
/// [`release`](Buffer::release) or when the buffer is dropped.
///
/// ```
/// use mmap_heap::Buffer;
///
/// let mut buf = Buffer::new(100)?;
/// buf.as_mut_slice()[..5].copy_from_slice(b"hello");
/// assert_eq!(buf.size(), 100);
/// buf.release()?;
/// # Ok::<(), mmap_heap::Error>(())
/// ```
pub struct Buffer<'h> {
    heap: &'h Heap,
    /// `None` once released.
    block: Option<Block>,
    size: usize,
}

impl Buffer<'static> {
    /// Allocates `size` bytes from the [global](Heap::global) heap.
    pub fn new(size: usize) -> Result<Self> {
        Buffer::new_in(Heap::global(), size)
    }
}

impl<'h> Buffer<'h> {
    /// Allocates `size` bytes from `heap`.
    ///
    /// # Errors
    /// Forwards the errors of [`Heap::allocate`].
    pub fn new_in(heap: &'h Heap, size: usize) -> Result<Self> {
        let block = heap.allocate(size)?;
        Ok(Buffer {
            heap,
            block: Some(block),
            size,
        })
    }

    /// Returns the address of the first byte of the buffer.
    pub fn address(&self) -> NonNull<u8> {
        let block = self.block();
        assert!(
            self.size <= block.arena().size(),
            "buffer of {} bytes can't live in {:?}",
            self.size,
            block.arena()
        );
        block.address()
    }

    /// Returns the requested size, before rounding.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn block(&self) -> &Block {
        // Only `release` and `drop` take the block, and both consume the buffer.
        match &self.block {
            Some(block) => block,
            None => unreachable!("buffer used after release"),
        }
    }

    /// The arena backing the buffer, e.g. to ship its
    /// [descriptor](Arena::descriptor) to another process.
    #[inline]
    pub fn arena(&self) -> &Arc<Arena> {
        self.block().arena()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.address().as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.address().as_ptr(), self.size) }
    }

    /// Returns the block to the heap, reporting failures that [`Drop`] can only log.
    pub fn release(mut self) -> Result<()> {
        self.release_block()
    }

    fn release_block(&mut self) -> Result<()> {
        match self.block.take() {
            Some(block) => self.heap.free(&block),
            None => Ok(()),
        }
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release_block() {
            warn!(%err, "Couldn't release dropped buffer.");
        }
    }
}

impl fmt::Debug for Buffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("block", &self.block)
            .field("size", &self.size)
            .finish()
    }
}
