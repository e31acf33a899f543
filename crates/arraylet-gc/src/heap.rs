//! An arena-backed arraylet heap.
//!
//! [`ArrayletHeap`] is the reference host for the layout selector, leaf
//! linker, and double-map registry: spines come from the global allocator,
//! leaves are carved from an fd-backed [`LeafArena`] so their pages can be
//! aliased, and one [`DoubleMapRegistry`] per heap tracks live views.
//!
//! The heap is non-moving (spines stay put) and reclaims everything
//! wholesale on drop; abandoned spines from failed materializations are
//! simply garbage until then, which is exactly the recovery contract of
//! the linker.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use thiserror::Error;

use sys_dmap::LeafArena;

use crate::config::{ConfigError, HeapConfig};
use crate::doublemap::{ArenaMapper, DoubleMapRegistry, MapError, MapOutcome};
use crate::layout::{select_layout, LayoutError, LayoutRequest};
use crate::link::{attach_leaves, LeafAllocator};
use crate::spine::{AllocationDescription, Spine};

/// Failures constructing a heap.
#[derive(Debug, Error)]
pub enum HeapError {
    /// The configuration is internally inconsistent.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The OS could not create the fd-backed leaf arena.
    #[error("failed to create leaf arena: {0}")]
    Arena(#[from] io::Error),
}

/// A heap instance: leaf arena, spine allocations, and mapping registry.
pub struct ArrayletHeap {
    config: HeapConfig,
    arena: Arc<LeafArena>,
    next_leaf: usize,
    spines: Vec<(NonNull<u8>, Layout)>,
    registry: DoubleMapRegistry<ArenaMapper>,
}

impl ArrayletHeap {
    /// Creates a heap with a leaf region of at least `leaf_region_bytes`.
    ///
    /// # Errors
    ///
    /// [`HeapError::Config`] for invalid configuration (including a leaf
    /// size the OS cannot alias when double mapping is enabled), or
    /// [`HeapError::Arena`] when the arena cannot be created.
    pub fn new(config: HeapConfig, leaf_region_bytes: usize) -> Result<Self, HeapError> {
        config.validate()?;
        config.validate_mappable(sys_dmap::allocation_granularity())?;

        let leaves = leaf_region_bytes.div_ceil(config.leaf_size).max(1);
        let arena = Arc::new(LeafArena::new(leaves * config.leaf_size)?);
        let registry = DoubleMapRegistry::new(ArenaMapper::new(Arc::clone(&arena)));
        Ok(Self {
            config,
            arena,
            next_leaf: 0,
            spines: Vec::new(),
            registry,
        })
    }

    /// This heap's configuration.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The fd-backed region leaves are carved from.
    #[must_use]
    pub fn arena(&self) -> Arc<LeafArena> {
        Arc::clone(&self.arena)
    }

    /// This heap's double-map registry.
    #[must_use]
    pub const fn registry(&self) -> &DoubleMapRegistry<ArenaMapper> {
        &self.registry
    }

    /// Leaves still available in the arena.
    #[must_use]
    pub fn available_leaves(&self) -> usize {
        (self.arena.len() - self.next_leaf) / self.config.leaf_size
    }

    /// Carves one leaf from the arena, or `None` when it is exhausted.
    pub fn allocate_leaf_raw(&mut self) -> Option<NonNull<u8>> {
        let leaf_size = self.config.leaf_size;
        if self.next_leaf + leaf_size > self.arena.len() {
            return None;
        }
        let offset = self.next_leaf;
        self.next_leaf += leaf_size;
        // SAFETY: offset + leaf_size is within the arena mapping.
        NonNull::new(unsafe { self.arena.base().add(offset) })
    }

    /// Materializes one array object: layout selection, spine allocation,
    /// and leaf linking.
    ///
    /// Returns `Ok(None)` when a leaf allocation failed mid-construction;
    /// the partial spine and its leaves are garbage owned by the heap, and
    /// the caller sees no other side effect.
    ///
    /// # Errors
    ///
    /// [`LayoutError`] when the request cannot be laid out at all; the
    /// caller falls back or fails its own allocation visibly.
    pub fn allocate_array(&mut self, request: &LayoutRequest) -> Result<Option<Spine>, LayoutError> {
        let plan = select_layout(request, &self.config)?;

        let layout = Layout::from_size_align(plan.spine_bytes, self.config.object_alignment)
            .map_err(|_| LayoutError::SizeOverflow)?;
        // SAFETY: layout is non-zero (spine always has a header).
        let mem = unsafe { alloc_zeroed(layout) };
        let Some(mem) = NonNull::new(mem) else {
            handle_alloc_error(layout);
        };
        self.spines.push((mem, layout));

        // SAFETY: mem is zeroed and spine_bytes long.
        let spine = unsafe { Spine::initialize(mem, &plan) };
        let desc = AllocationDescription::new(plan, spine);
        let config = self.config;
        Ok(attach_leaves(&desc, self, &config))
    }

    /// Creates (or skips, for adjacent leaves) a contiguous view of a
    /// discontiguous array allocated by this heap.
    ///
    /// Views are created lazily, on first request; the entry lives until
    /// [`ArrayletHeap::release_view`].
    ///
    /// # Errors
    ///
    /// [`MapError::Unsupported`] when the heap was configured without
    /// double mapping or the platform cannot alias; otherwise as
    /// [`DoubleMapRegistry::try_create_mapping`].
    ///
    /// # Safety
    ///
    /// `spine` must have been produced by this heap's
    /// [`ArrayletHeap::allocate_array`] and not abandoned.
    pub unsafe fn contiguous_view(&self, spine: &Spine) -> Result<MapOutcome, MapError> {
        if !self.config.double_map_enabled {
            return Err(MapError::Unsupported);
        }
        // SAFETY: caller guarantees the spine is live and linked.
        unsafe { self.registry.map_spine(spine, self.config.leaf_size) }
    }

    /// Releases the contiguous view of the object at `spine_addr`.
    ///
    /// Called exactly once, when the owning object is reclaimed.
    ///
    /// # Errors
    ///
    /// As [`DoubleMapRegistry::release_mapping`].
    pub fn release_view(&self, spine_addr: usize) -> Result<(), MapError> {
        self.registry.release_mapping(spine_addr)
    }
}

impl LeafAllocator for ArrayletHeap {
    fn leaf_size(&self) -> usize {
        self.config.leaf_size
    }

    fn region_size(&self) -> usize {
        self.arena.len()
    }

    fn allocate_leaf(&mut self, _desc: &AllocationDescription) -> Option<NonNull<u8>> {
        self.allocate_leaf_raw()
    }
}

impl Drop for ArrayletHeap {
    fn drop(&mut self) {
        for &(ptr, layout) in &self.spines {
            // SAFETY: allocated by this heap with exactly this layout.
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ArrayletLayout;

    fn heap(leaves: usize) -> ArrayletHeap {
        let config = HeapConfig::new(4096).unwrap();
        ArrayletHeap::new(config, leaves * 4096).expect("heap creation failed")
    }

    #[test]
    fn inline_array_round_trip() {
        if !sys_dmap::supported() {
            return;
        }
        let mut heap = heap(4);
        let spine = heap
            .allocate_array(&LayoutRequest::new(100, 8))
            .unwrap()
            .unwrap();
        assert_eq!(spine.layout(), ArrayletLayout::InlineContiguous);

        // Element data is writable through the arrayoid.
        unsafe {
            let data = spine.arrayoid_slot(0).unwrap().as_ptr().cast::<u64>();
            for i in 0..100 {
                data.add(i).write(i as u64 * 3);
            }
            assert_eq!(data.add(99).read(), 297);
        }
        assert_eq!(heap.available_leaves(), 4, "inline allocates no leaves");
    }

    #[test]
    fn discontiguous_array_consumes_leaves_in_arena() {
        if !sys_dmap::supported() {
            return;
        }
        let mut heap = heap(32);
        let spine = heap
            .allocate_array(&LayoutRequest::new(10_000, 8))
            .unwrap()
            .unwrap();
        assert_eq!(spine.leaf_count(), 20);
        assert_eq!(heap.available_leaves(), 12);

        let arena = heap.arena();
        unsafe {
            for addr in spine.collect_leaf_addrs() {
                assert!(arena.offset_of(addr).is_some(), "leaf outside arena");
            }
        }
    }

    #[test]
    fn exhaustion_yields_none_without_other_side_effects() {
        if !sys_dmap::supported() {
            return;
        }
        let mut heap = heap(8);
        let result = heap.allocate_array(&LayoutRequest::new(10_000, 8)).unwrap();
        assert!(result.is_none(), "20 leaves cannot fit in an 8-leaf arena");
        assert_eq!(heap.available_leaves(), 0, "burned leaves are garbage until heap drop");

        // The heap remains usable for requests that fit.
        let spine = heap
            .allocate_array(&LayoutRequest::new(64, 8))
            .unwrap()
            .unwrap();
        assert_eq!(spine.layout(), ArrayletLayout::InlineContiguous);
    }

    #[test]
    fn view_requires_double_mapping_enabled() {
        if !sys_dmap::supported() {
            return;
        }
        let mut heap = heap(32);
        let spine = heap
            .allocate_array(&LayoutRequest::new(10_000, 8))
            .unwrap()
            .unwrap();
        assert!(matches!(
            unsafe { heap.contiguous_view(&spine) },
            Err(MapError::Unsupported)
        ));
    }

    #[test]
    fn bump_allocated_leaves_short_circuit_as_adjacent() {
        if !sys_dmap::supported() {
            return;
        }
        let mut config = HeapConfig::new(4096).unwrap();
        config.double_map_enabled = true;
        if config
            .validate_mappable(sys_dmap::allocation_granularity())
            .is_err()
        {
            // 4K leaves are not mappable on this platform (64K granularity).
            return;
        }
        let mut heap = ArrayletHeap::new(config, 32 * 4096).unwrap();
        let spine = heap
            .allocate_array(&LayoutRequest::new(10_000, 8))
            .unwrap()
            .unwrap();

        // Fresh bump allocation places all 20 leaves back to back, so the
        // view is the leaves themselves and no registry entry appears.
        let outcome = unsafe { heap.contiguous_view(&spine) }.unwrap();
        let first = unsafe { spine.arrayoid_slot(0).unwrap().as_ptr() as usize };
        assert_eq!(outcome, MapOutcome::AlreadyContiguous { base: first });
        assert!(heap.registry().is_empty());
    }
}
