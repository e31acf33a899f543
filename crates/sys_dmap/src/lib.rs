//! Low-level page-aliasing ("double mapping") primitives.
//!
//! This crate provides the OS half of arraylet double mapping: an fd-backed
//! [`LeafArena`] from which fixed-size chunks are carved, and an [`AliasMap`]
//! that maps an ordered set of those chunks a second time into one contiguous
//! virtual range. Both views share the same physical pages, so writes through
//! either are visible through the other without copying.
//!
//! Platform support is limited to systems offering page aliasing through a
//! shared memory object (memfd/shm on unix, pagefile-backed sections on
//! windows). [`supported`] reports the capability at runtime.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

#[cfg(not(any(unix, windows)))]
mod unsupported;
#[cfg(not(any(unix, windows)))]
use unsupported as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// Alias chunk lengths and arena offsets must be multiples of this value.
/// On Windows this is typically 64KB; on unix it is the page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(not(windows))]
    {
        os::page_size()
    }
}

/// Whether this platform can create aliased mappings at all.
///
/// When this returns `false`, [`LeafArena::new`] fails with
/// [`io::ErrorKind::Unsupported`] and no aliasing is possible.
#[must_use]
pub const fn supported() -> bool {
    cfg!(any(unix, windows))
}

/// An fd-backed memory region that leaf chunks are carved from.
///
/// The arena is mapped read-write at a single base address; because it is
/// backed by a shared memory object, any page-aligned slice of it can be
/// mapped again elsewhere via [`LeafArena::alias`].
pub struct LeafArena {
    inner: os::ArenaInner,
}

impl LeafArena {
    /// Creates an arena of at least `len` bytes, rounded up to a page
    /// multiple.
    ///
    /// # Errors
    ///
    /// Fails if `len` is zero, the platform lacks aliasing support, or the
    /// OS cannot create or map the backing object.
    pub fn new(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let page = page_size();
        let len = len.div_ceil(page) * page;
        // SAFETY: len is a validated, non-zero page multiple.
        let inner = unsafe { os::ArenaInner::create(len)? };
        Ok(Self { inner })
    }

    /// Returns a pointer to the start of the arena.
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        self.inner.base()
    }

    /// Returns the length of the arena in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the arena has zero length (never, in practice).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Translates an absolute address within the arena to its byte offset.
    ///
    /// Returns `None` for addresses outside the arena.
    #[must_use]
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        let base = self.base() as usize;
        if addr < base || addr >= base + self.len() {
            return None;
        }
        Some(addr - base)
    }

    /// Maps the chunks at `offsets` (each `chunk_len` bytes) into one new
    /// contiguous virtual range, in the order given. Byte `i * chunk_len` of
    /// the alias shares its physical page with byte `offsets[i]` of the
    /// arena.
    ///
    /// # Errors
    ///
    /// Fails if the offsets are empty, misaligned, or out of range, or if
    /// the OS cannot place the views.
    pub fn alias(&self, offsets: &[usize], chunk_len: usize) -> io::Result<AliasMap> {
        let granularity = allocation_granularity();
        if offsets.is_empty() || chunk_len == 0 || chunk_len % granularity != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunk length must be a non-zero multiple of the allocation granularity",
            ));
        }
        for &offset in offsets {
            if offset % granularity != 0 || offset + chunk_len > self.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "chunk offset misaligned or out of arena range",
                ));
            }
        }
        // SAFETY: offsets and chunk_len were validated against this arena.
        let inner = unsafe { os::AliasInner::map(&self.inner, offsets, chunk_len)? };
        Ok(AliasMap { inner })
    }
}

/// A contiguous virtual range aliasing a set of arena chunks.
///
/// The range is unmapped when the handle is dropped; [`AliasMap::unmap`]
/// does the same but surfaces OS failures.
pub struct AliasMap {
    inner: os::AliasInner,
}

impl AliasMap {
    /// Returns a pointer to the start of the aliased range.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the reserved length of the aliased range in bytes.
    ///
    /// This is `offsets.len() * chunk_len`, which may exceed the number of
    /// data bytes the caller actually stores in the chunks.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the range has already been unmapped.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Explicitly unmaps the range.
    ///
    /// # Errors
    ///
    /// Fails if the OS rejects the unmap; the handle is consumed either way.
    pub fn unmap(mut self) -> io::Result<()> {
        self.inner.unmap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "Allocation granularity should be power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_arena_create_and_write() {
        if !supported() {
            return;
        }
        let arena = LeafArena::new(4 * page_size()).expect("failed to create arena");
        assert!(arena.len() >= 4 * page_size());
        assert_eq!(arena.base() as usize % page_size(), 0);

        unsafe {
            ptr::write_volatile(arena.base(), 42);
            assert_eq!(ptr::read_volatile(arena.base()), 42);
        }
    }

    #[test]
    fn test_offset_of() {
        if !supported() {
            return;
        }
        let arena = LeafArena::new(2 * page_size()).unwrap();
        let base = arena.base() as usize;
        assert_eq!(arena.offset_of(base), Some(0));
        assert_eq!(arena.offset_of(base + 17), Some(17));
        assert_eq!(arena.offset_of(base + arena.len()), None);
        assert_eq!(arena.offset_of(base.wrapping_sub(1)), None);
    }

    #[test]
    fn test_alias_sees_arena_writes() {
        if !supported() {
            return;
        }
        let chunk = allocation_granularity();
        let arena = LeafArena::new(4 * chunk).expect("failed to create arena");

        // Alias chunks 3, 1 (out of arena order, in alias order).
        let alias = arena.alias(&[3 * chunk, chunk], chunk).expect("failed to alias");
        assert_eq!(alias.len(), 2 * chunk);

        unsafe {
            // Write through the arena view, read through the alias.
            ptr::write_volatile(arena.base().add(3 * chunk), 0xAB);
            ptr::write_volatile(arena.base().add(chunk), 0xCD);
            assert_eq!(ptr::read_volatile(alias.ptr()), 0xAB);
            assert_eq!(ptr::read_volatile(alias.ptr().add(chunk)), 0xCD);

            // And the other direction.
            ptr::write_volatile(alias.ptr().add(1), 0xEE);
            assert_eq!(ptr::read_volatile(arena.base().add(3 * chunk + 1)), 0xEE);
        }

        alias.unmap().expect("unmap failed");
    }

    #[test]
    fn test_alias_rejects_bad_offsets() {
        if !supported() {
            return;
        }
        let chunk = allocation_granularity();
        let arena = LeafArena::new(2 * chunk).unwrap();

        assert!(arena.alias(&[], chunk).is_err());
        assert!(arena.alias(&[0], 0).is_err());
        assert!(arena.alias(&[1], chunk).is_err(), "misaligned offset");
        assert!(arena.alias(&[4 * chunk], chunk).is_err(), "offset past end");
    }
}
