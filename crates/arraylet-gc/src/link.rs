//! Leaf allocation and arrayoid linking.
//!
//! Given an already-allocated, zeroed spine and a finalized layout plan,
//! the linker populates every arrayoid slot. For discontiguous and hybrid
//! layouts it allocates one leaf at a time through a [`LeafAllocator`];
//! each of those allocations may trigger a collection that relocates the
//! spine, so the spine address is re-resolved from the allocation
//! description after every single allocation before the slot is written.
//!
//! A failed leaf allocation abandons the spine and all previously linked
//! leaves as floating garbage and yields `None`; there is no rollback.

use std::ptr::NonNull;

use crate::config::HeapConfig;
use crate::layout::ArrayletLayout;
use crate::spine::{AllocationDescription, Spine};
use crate::tracing::internal as trace;

/// The external leaf allocation interface.
///
/// Implementations allocate one leaf-sized chunk per call. An allocation
/// is a collection point: an implementation that relocates the spine must
/// update `desc` with the new location before returning.
pub trait LeafAllocator {
    /// Size in bytes of every leaf this allocator hands out.
    fn leaf_size(&self) -> usize;

    /// Size in bytes of the heap region leaves are carved from.
    fn region_size(&self) -> usize;

    /// Allocates one leaf, or `None` when the heap is exhausted.
    fn allocate_leaf(&mut self, desc: &AllocationDescription) -> Option<NonNull<u8>>;
}

/// Populates every arrayoid slot of the spine recorded in `desc`.
///
/// Returns the spine at its final location, or `None` when a leaf
/// allocation failed and the partial structure was abandoned.
///
/// # Panics
///
/// Panics when invariants are violated: allocator leaf size disagreeing
/// with the configuration, or a hybrid layout under an enabled double
/// mapper (hybrid spines keep data bytes that cannot be aliased).
pub fn attach_leaves<A: LeafAllocator>(
    desc: &AllocationDescription,
    allocator: &mut A,
    config: &HeapConfig,
) -> Option<Spine> {
    assert_eq!(
        allocator.leaf_size(),
        config.leaf_size,
        "allocator leaf size disagrees with heap configuration"
    );
    let plan = *desc.plan();
    let _span = trace::trace_link(plan.element_count, plan.spine_bytes, plan.leaf_count);

    match plan.layout {
        ArrayletLayout::InlineContiguous => {
            let spine = desc.resolve()?;
            // SAFETY: desc holds a live, zeroed spine sized per plan.
            unsafe { link_inline_contiguous(spine, config) };
            Some(spine)
        }
        ArrayletLayout::Discontiguous | ArrayletLayout::Hybrid => {
            link_discontiguous(desc, allocator, config)
        }
    }
}

/// Points the arrayoid at the spine's own data section.
///
/// # Safety
///
/// `spine` must be live and zeroed past the header.
unsafe fn link_inline_contiguous(spine: Spine, config: &HeapConfig) {
    debug_assert_eq!(spine.leaf_count(), 1);
    let mut leaf_addr = spine.addr() + spine.inline_data_offset(config.align_spine_data);
    for index in 0..spine.leaf_count() {
        // SAFETY: index in range; the data section is inside the spine.
        unsafe {
            spine.set_arrayoid_slot(index, NonNull::new(leaf_addr as *mut u8));
        }
        leaf_addr += config.leaf_size;
    }
}

fn link_discontiguous<A: LeafAllocator>(
    desc: &AllocationDescription,
    allocator: &mut A,
    config: &HeapConfig,
) -> Option<Spine> {
    let plan = *desc.plan();
    let leaf_size = config.leaf_size;

    // Bytes to place outside the spine. For hybrid, the remainder stays
    // inline, so this is always a leaf-size multiple there.
    let mut bytes_remaining = plan.data_bytes - plan.inline_remainder_bytes;
    debug_assert!(
        plan.layout != ArrayletLayout::Hybrid || bytes_remaining % leaf_size == 0
    );

    let mut index = 0;
    while bytes_remaining > 0 {
        let Some(leaf) = allocator.allocate_leaf(desc) else {
            // Spine and preceding leaves are now floating garbage.
            trace::leaf_alloc_failed(index);
            desc.clear_spine();
            return None;
        };

        // The allocation may have moved the spine; resolve again before
        // touching the arrayoid. Writing through a stale spine pointer
        // would corrupt whatever now occupies the old location.
        let spine = desc.resolve().expect("live spine after leaf allocation");
        // SAFETY: spine was just re-resolved; index < leaf_count by loop bound.
        unsafe {
            spine.set_arrayoid_slot(index, Some(leaf));
        }
        trace::leaf_linked(index, leaf.as_ptr() as usize, spine.addr());

        bytes_remaining -= bytes_remaining.min(leaf_size);
        index += 1;
    }

    let spine = desc.resolve().expect("live spine after linking loop");
    match plan.layout {
        ArrayletLayout::Discontiguous => {
            if index == plan.leaf_count - 1 {
                // The final leaf holds zero bytes; its slot is explicitly
                // null rather than pointing at a non-existent leaf.
                debug_assert_eq!(plan.data_bytes % leaf_size, 0);
                // SAFETY: index < leaf_count; spine is live.
                unsafe { spine.set_arrayoid_slot(index, None) };
            } else {
                debug_assert_eq!(index, plan.leaf_count);
            }
        }
        ArrayletLayout::Hybrid => {
            assert!(
                !config.double_map_enabled,
                "hybrid arraylets must never be double mapped"
            );
            debug_assert_eq!(index, plan.leaf_count - 1);
            // Final slot points at the in-spine remainder region.
            let remainder_addr =
                spine.addr() + spine.inline_data_offset(config.align_spine_data);
            // SAFETY: index < leaf_count; the remainder is inside the spine.
            unsafe {
                spine.set_arrayoid_slot(index, NonNull::new(remainder_addr as *mut u8));
            }
        }
        ArrayletLayout::InlineContiguous => unreachable!("inline layout handled by caller"),
    }

    Some(spine)
}
