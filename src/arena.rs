//! [`Arena`]: one page-backed memory mapping from which blocks are carved.
//!
//! Arenas come in two flavours, see [`Sharing`]:
//! - *inherited* arenas are anonymous `MAP_SHARED` mappings. They can only be
//!   shared with processes forked after their creation.
//! - *named* arenas are backed by a POSIX shared memory object. Another process can
//!   map the same memory by [reopening](Arena::reopen) the name.
//!
//! Both are zero-initialized by the OS and never resized. The mapping is released
//! once the last reference to the arena is dropped.

use crate::error::{Error, Result};
use crate::util::current_pid;

use core::ptr::{null_mut, NonNull};
use std::ffi::CString;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

static ARENA_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of an [`Arena`].
///
/// Ids are never reused, so blocks of a discarded arena can't be mistaken for
/// blocks of a newer one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaId(u64);

impl ArenaId {
    fn next() -> Self {
        ArenaId(ARENA_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arena#{}", self.0)
    }
}

/// How an arena can be reached from another process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sharing {
    /// Anonymous mapping, shared with children through process creation.
    Inherited,
    /// Mapping registered under a system-wide name that other processes may reopen.
    Named(String),
}

/// The wire form of an arena at a process boundary.
///
/// Inherited arenas carry no name and can't be reopened from a descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaDescriptor {
    pub size: usize,
    pub name: Option<String>,
}

/// A fixed-size, page-aligned, read-write memory mapping.
pub struct Arena {
    id: ArenaId,
    ptr: NonNull<u8>,
    size: usize,
    sharing: Sharing,
    /// Pid of the process that registered the name, if this arena did.
    /// Only that process removes the name again.
    name_owner: Option<u32>,
}

// The arena only hands out raw addresses; synchronizing access to the bytes is up
// to the owners of the blocks.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Maps `size` bytes of anonymous shared memory.
    ///
    /// # Errors
    /// Returns [`Error::Mapping`] if the OS can't satisfy the request.
    pub fn create(size: usize) -> Result<Arena> {
        let ptr = unsafe { map(size, libc::MAP_SHARED | libc::MAP_ANONYMOUS, -1)? };
        let arena = Arena {
            id: ArenaId::next(),
            ptr,
            size,
            sharing: Sharing::Inherited,
            name_owner: None,
        };
        debug!(id = %arena.id, size, "Mapped anonymous arena.");
        Ok(arena)
    }

    /// Maps `size` bytes of shared memory registered under `name`.
    ///
    /// # Errors
    /// Returns [`Error::SharingViolation`] if `name` is already in use and
    /// [`Error::Mapping`] if the OS can't provide the memory.
    pub fn create_named(size: usize, name: &str) -> Result<Arena> {
        let cname = shm_name(name)?;
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if fd == -1 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EEXIST) => Error::sharing(name, "name is already in use"),
                _ => Error::Mapping { size, source: err },
            });
        }

        let mapped = unsafe {
            if libc::ftruncate(fd, size as libc::off_t) == -1 {
                Err(Error::mapping(size))
            } else {
                map(size, libc::MAP_SHARED, fd)
            }
        };
        unsafe { libc::close(fd) };

        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(err) => {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                return Err(err);
            }
        };

        let arena = Arena {
            id: ArenaId::next(),
            ptr,
            size,
            sharing: Sharing::Named(name.to_owned()),
            name_owner: Some(current_pid()),
        };
        debug!(id = %arena.id, size, name, "Mapped named arena.");
        Ok(arena)
    }

    /// Maps the shared memory previously registered under `name`.
    ///
    /// # Errors
    /// Returns [`Error::SharingViolation`] if no mapping uses `name` or if it is
    /// smaller than `size`, and [`Error::Mapping`] if the OS can't map it.
    pub fn reopen(name: &str, size: usize) -> Result<Arena> {
        let cname = shm_name(name)?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if fd == -1 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => Error::sharing(name, "no mapping uses this name"),
                _ => Error::Mapping { size, source: err },
            });
        }

        let mapped = unsafe {
            let mut stat: libc::stat = core::mem::zeroed();
            if libc::fstat(fd, &mut stat) == -1 {
                Err(Error::mapping(size))
            } else if (stat.st_size as u64) < size as u64 {
                Err(Error::sharing(name, "existing mapping is smaller than requested"))
            } else {
                map(size, libc::MAP_SHARED, fd)
            }
        };
        unsafe { libc::close(fd) };

        let arena = Arena {
            id: ArenaId::next(),
            ptr: mapped?,
            size,
            sharing: Sharing::Named(name.to_owned()),
            name_owner: None,
        };
        debug!(id = %arena.id, size, name, "Reopened named arena.");
        Ok(arena)
    }

    /// Maps the arena described by `descriptor` in this process.
    ///
    /// # Errors
    /// Inherited arenas can't be reopened and yield [`Error::SharingViolation`].
    /// Otherwise see [`reopen`](Arena::reopen).
    pub fn from_descriptor(descriptor: &ArenaDescriptor) -> Result<Arena> {
        match &descriptor.name {
            Some(name) => Arena::reopen(name, descriptor.size),
            None => Err(Error::sharing(
                "<anonymous>",
                "inherited arenas can only be shared through process creation",
            )),
        }
    }

    /// Returns the descriptor used to ship this arena to another process.
    pub fn descriptor(&self) -> ArenaDescriptor {
        ArenaDescriptor {
            size: self.size,
            name: match &self.sharing {
                Sharing::Inherited => None,
                Sharing::Named(name) => Some(name.clone()),
            },
        }
    }

    /// Returns the absolute address `offset` bytes into the mapping.
    ///
    /// # Panics
    /// Panics if `offset` is greater than the arena size.
    #[inline]
    pub fn address_of(&self, offset: usize) -> NonNull<u8> {
        assert!(
            offset <= self.size,
            "offset {offset} is outside of {} ({} bytes)",
            self.id,
            self.size
        );
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }

    #[inline]
    pub fn id(&self) -> ArenaId {
        self.id
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn sharing(&self) -> &Sharing {
        &self.sharing
    }

    #[inline]
    pub fn is_named(&self) -> bool {
        matches!(self.sharing, Sharing::Named(_))
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("sharing", &self.sharing)
            .finish()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.size) } == -1 {
            warn!(id = %self.id, error = %io::Error::last_os_error(), "Couldn't unmap arena.");
        }
        // A forked child must not unregister a name its parent still serves.
        if let (Sharing::Named(name), Some(owner)) = (&self.sharing, self.name_owner) {
            if owner == current_pid() {
                if let Ok(cname) = CString::new(name.as_str()) {
                    unsafe { libc::shm_unlink(cname.as_ptr()) };
                }
            }
        }
    }
}

/// Maps `size` read-write bytes with `flags`, backed by `fd` (or anonymous if `fd` is -1).
///
/// # Safety
/// `fd` must be -1 or an open descriptor that can back `size` bytes.
unsafe fn map(size: usize, flags: libc::c_int, fd: libc::c_int) -> Result<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::mapping(size));
    }
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::Mapping {
        size,
        source: io::Error::other("mmap returned null"),
    })
}

fn shm_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::sharing(name, "name contains a NUL byte"))
}
