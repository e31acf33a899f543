//! Test doubles for the leaf allocator and the mapping primitive.
//!
//! Available in unit tests and behind the `test-util` feature so
//! integration tests and downstream crates can exercise the linker and
//! registry without a real heap or OS mappings.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::doublemap::{DoubleMappedRange, DoubleMapper, MapError};
use crate::spine::{AllocationDescription, Spine};
use crate::LeafAllocator;

/// Leaf allocator backed by individually boxed buffers.
///
/// Non-moving: the spine never relocates. Records every handed-out leaf
/// address in allocation order.
pub struct VecLeafAllocator {
    leaf_size: usize,
    leaves: Vec<Box<[u8]>>,
}

impl VecLeafAllocator {
    /// Creates an allocator handing out `leaf_size` leaves.
    #[must_use]
    pub const fn new(leaf_size: usize) -> Self {
        Self {
            leaf_size,
            leaves: Vec::new(),
        }
    }

    /// Number of leaves handed out so far.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.leaves.len()
    }

    /// Addresses of all handed-out leaves, in allocation order.
    #[must_use]
    pub fn leaf_addrs(&self) -> Vec<usize> {
        self.leaves.iter().map(|leaf| leaf.as_ptr() as usize).collect()
    }
}

impl LeafAllocator for VecLeafAllocator {
    fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    fn region_size(&self) -> usize {
        self.leaf_size * 1024
    }

    fn allocate_leaf(&mut self, _desc: &AllocationDescription) -> Option<NonNull<u8>> {
        self.leaves.push(vec![0u8; self.leaf_size].into_boxed_slice());
        NonNull::new(self.leaves.last_mut().unwrap().as_mut_ptr())
    }
}

/// Allocator that fails at a fixed leaf index, for abandon-path tests.
pub struct FailingAllocator {
    inner: VecLeafAllocator,
    fail_at: usize,
}

impl FailingAllocator {
    /// Fails the allocation of leaf number `fail_at` (zero-based).
    #[must_use]
    pub const fn new(leaf_size: usize, fail_at: usize) -> Self {
        Self {
            inner: VecLeafAllocator::new(leaf_size),
            fail_at,
        }
    }

    /// Number of leaves handed out before the failure.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.inner.allocated()
    }
}

impl LeafAllocator for FailingAllocator {
    fn leaf_size(&self) -> usize {
        self.inner.leaf_size()
    }

    fn region_size(&self) -> usize {
        self.inner.region_size()
    }

    fn allocate_leaf(&mut self, desc: &AllocationDescription) -> Option<NonNull<u8>> {
        if self.inner.allocated() == self.fail_at {
            return None;
        }
        self.inner.allocate_leaf(desc)
    }
}

/// Allocator that relocates the spine on every leaf allocation, modelling
/// a collection cycle triggered by each sub-allocation.
///
/// The old spine copies stay alive (and stale) so a linker bug that
/// writes through a cached spine pointer scribbles on a buffer the test
/// can prove was abandoned.
pub struct RelocatingAllocator {
    inner: VecLeafAllocator,
    spines: Vec<Box<[u8]>>,
}

impl RelocatingAllocator {
    /// Creates the allocator.
    #[must_use]
    pub const fn new(leaf_size: usize) -> Self {
        Self {
            inner: VecLeafAllocator::new(leaf_size),
            spines: Vec::new(),
        }
    }

    /// Addresses of all handed-out leaves, in allocation order.
    #[must_use]
    pub fn leaf_addrs(&self) -> Vec<usize> {
        self.inner.leaf_addrs()
    }
}

impl LeafAllocator for RelocatingAllocator {
    fn leaf_size(&self) -> usize {
        self.inner.leaf_size()
    }

    fn region_size(&self) -> usize {
        self.inner.region_size()
    }

    fn allocate_leaf(&mut self, desc: &AllocationDescription) -> Option<NonNull<u8>> {
        let leaf = self.inner.allocate_leaf(desc)?;

        // Evacuate the spine to a fresh buffer, as a copying collection
        // triggered by this allocation would.
        let old = desc.resolve().expect("spine live during relocation");
        let spine_bytes = desc.plan().spine_bytes;
        let mut copy = vec![0u8; spine_bytes].into_boxed_slice();
        // SAFETY: the old spine is spine_bytes long and the buffers are
        // distinct allocations.
        unsafe {
            std::ptr::copy_nonoverlapping(
                old.addr() as *const u8,
                copy.as_mut_ptr(),
                spine_bytes,
            );
        }
        let moved = unsafe {
            Spine::from_raw(NonNull::new(copy.as_mut_ptr().cast()).unwrap())
        };
        self.spines.push(copy);
        desc.set_spine(moved);

        Some(leaf)
    }
}

/// Recording [`DoubleMapper`] double with fabricated alias addresses.
pub struct FakeMapper {
    supported: bool,
    fail_next: AtomicBool,
    next_alias: AtomicU64,
    created: AtomicUsize,
    unwound: AtomicUsize,
}

impl FakeMapper {
    /// A mapper that always succeeds.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            supported: true,
            fail_next: AtomicBool::new(false),
            next_alias: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            unwound: AtomicUsize::new(0),
        }
    }

    /// A mapper reporting no platform support.
    #[must_use]
    pub const fn unsupported() -> Self {
        Self {
            supported: false,
            fail_next: AtomicBool::new(false),
            next_alias: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            unwound: AtomicUsize::new(0),
        }
    }

    /// Makes the next `double_map` call fail with an OS error.
    pub fn fail_next_map(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Number of successful `double_map` calls.
    #[must_use]
    pub fn maps_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of `unmap` calls.
    #[must_use]
    pub fn maps_unwound(&self) -> usize {
        self.unwound.load(Ordering::SeqCst)
    }
}

impl Default for FakeMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl DoubleMapper for FakeMapper {
    type Identifier = u64;

    fn supports_double_mapping(&self) -> bool {
        self.supported
    }

    fn page_granularity(&self) -> usize {
        4096
    }

    fn double_map(
        &self,
        leaf_addrs: &[usize],
        leaf_size: usize,
        actual_size: usize,
        _page_size: usize,
    ) -> Result<DoubleMappedRange<u64>, MapError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(MapError::Os(io::Error::from(io::ErrorKind::OutOfMemory)));
        }
        let reserved = leaf_addrs.len() * leaf_size;
        assert!(actual_size <= reserved);

        let id = self.next_alias.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        // Fabricated, non-overlapping alias addresses.
        #[allow(clippy::cast_possible_truncation)]
        let contiguous_addr = 0x7000_0000_0000usize + (id as usize) * 0x1000_0000;
        Ok(DoubleMappedRange {
            contiguous_addr,
            identifier: id,
            reserved_size: reserved,
        })
    }

    fn unmap(&self, _identifier: u64, _reserved_size: usize) -> Result<(), MapError> {
        self.unwound.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
