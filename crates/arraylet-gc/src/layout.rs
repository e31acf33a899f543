//! Arraylet layout selection.
//!
//! Given a requested element count and size, this module decides how the
//! array's bytes are split between the spine and external leaves, and
//! finalizes the spine size:
//!
//! - **Inline-contiguous**: all data fits in the spine; no leaves.
//! - **Discontiguous**: spine holds only the arrayoid; data lives in
//!   `ceil(data_bytes / leaf_size)` leaves, the last possibly partial.
//! - **Hybrid**: the `data_bytes % leaf_size` remainder stays inline in
//!   the spine and only full leaves are allocated externally.
//!
//! Selection can fail: a non-empty non-inline array cannot be laid out
//! when the collector forbids relocation mid-allocation, because every
//! leaf allocation is a potential collection point. That rejection is
//! local; the caller falls back or fails its own allocation request.

use thiserror::Error;

use crate::config::HeapConfig;
use crate::spine::{SpineHeader, SLOT_BYTES};

/// Rounds `value` up to a multiple of `granule` (a power of two).
pub(crate) const fn round_to_ceiling(granule: usize, value: usize) -> usize {
    (value + granule - 1) & !(granule - 1)
}

/// The three supported spine/leaf layout variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayletLayout {
    /// All element data inline in the spine; a single self-referential leaf.
    InlineContiguous,
    /// All element data in external leaves; the last leaf may be partial.
    Discontiguous,
    /// Remainder bytes inline in the spine; full leaves external.
    Hybrid,
}

/// Why a layout request was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    /// `element_count * element_size` (or the finalized spine size)
    /// overflows the address space.
    #[error("requested array size overflows")]
    SizeOverflow,

    /// Leaves are required but the collector forbids relocation during
    /// this allocation, so the leaf-by-leaf slow path cannot run.
    #[error("collector forbids relocation while laying out a non-empty {0:?} array")]
    RelocationForbidden(ArrayletLayout),
}

/// One array materialization request.
#[derive(Debug, Clone, Copy)]
pub struct LayoutRequest {
    /// Number of elements.
    pub element_count: usize,
    /// Bytes per element.
    pub element_size: usize,
    /// Reserve an identity-hash slot at the end of the spine.
    pub pre_hash: bool,
    /// The collector may run (and relocate the spine) while leaves are
    /// allocated. When false, only inline or empty arrays are feasible.
    pub gc_allowed: bool,
}

impl LayoutRequest {
    /// A plain request: no pre-computed hash, relocation permitted.
    #[must_use]
    pub const fn new(element_count: usize, element_size: usize) -> Self {
        Self {
            element_count,
            element_size,
            pre_hash: false,
            gc_allowed: true,
        }
    }
}

/// A finalized layout: everything the allocator and linker need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutPlan {
    /// Chosen layout variant.
    pub layout: ArrayletLayout,
    /// Number of elements.
    pub element_count: usize,
    /// Bytes per element.
    pub element_size: usize,
    /// Total element data bytes (`element_count * element_size`).
    pub data_bytes: usize,
    /// Finalized spine allocation size, object-alignment rounded.
    pub spine_bytes: usize,
    /// Arrayoid slot count. Always 1 for inline; at least 1 otherwise.
    pub leaf_count: usize,
    /// Bytes allocated outside the spine.
    pub layout_overhead_bytes: usize,
    /// Data bytes stored inline in a hybrid spine; zero otherwise.
    pub inline_remainder_bytes: usize,
    /// Offset of the identity-hash slot, when one was reserved.
    pub hash_offset: Option<usize>,
}

impl LayoutPlan {
    /// Total bytes requested from the heap: spine plus leaf region.
    #[must_use]
    pub const fn bytes_requested(&self) -> usize {
        self.spine_bytes + self.layout_overhead_bytes
    }

    /// Number of leaves actually allocated externally.
    ///
    /// For discontiguous this counts the partial last leaf; for hybrid the
    /// remainder stays inline so one slot's worth is not allocated. The
    /// trailing null slot of an empty discontiguous array is not counted.
    #[must_use]
    pub const fn external_leaf_count(&self, leaf_size: usize) -> usize {
        (self.data_bytes - self.inline_remainder_bytes).div_ceil(leaf_size)
    }
}

/// Unrounded spine size for the given parts; `None` on overflow.
fn raw_spine_bytes(leaf_count: usize, inline_bytes: usize, pre_hash: bool) -> Option<usize> {
    let arrayoid = leaf_count.checked_mul(SLOT_BYTES)?;
    let mut bytes = SpineHeader::BYTES.checked_add(arrayoid)?;
    bytes = bytes.checked_add(inline_bytes)?;
    if pre_hash {
        // The hash slot lands exactly at the end of the spine; reserve one
        // word for it before alignment rounding.
        bytes = bytes.checked_add(SLOT_BYTES)?;
    }
    Some(bytes)
}

/// Computes the spine size and picks a layout for `request`.
///
/// The spine size always includes the header, the arrayoid slots, any
/// inline data (with optional 8-byte data-section alignment), and an
/// optional identity-hash slot, rounded up to the configured object
/// alignment.
///
/// # Errors
///
/// [`LayoutError::SizeOverflow`] when sizes overflow, and
/// [`LayoutError::RelocationForbidden`] when leaves are required but the
/// request forbids collection during allocation.
pub fn select_layout(request: &LayoutRequest, config: &HeapConfig) -> Result<LayoutPlan, LayoutError> {
    let data_bytes = request
        .element_count
        .checked_mul(request.element_size)
        .ok_or(LayoutError::SizeOverflow)?;
    let leaf_size = config.leaf_size;

    if data_bytes > 0 && data_bytes <= leaf_size {
        return inline_plan(request, config, data_bytes);
    }

    let remainder = data_bytes % leaf_size;
    if remainder != 0 && config.hybrid_remainder && !config.double_map_enabled {
        return hybrid_plan(request, config, data_bytes);
    }
    discontiguous_plan(request, config, data_bytes)
}

fn inline_plan(
    request: &LayoutRequest,
    config: &HeapConfig,
    data_bytes: usize,
) -> Result<LayoutPlan, LayoutError> {
    let mut inline_bytes = data_bytes;
    if config.align_spine_data {
        // Padding between the arrayoid and the data section; accounted for
        // here so the rounded spine covers the aligned section.
        let unaligned = SpineHeader::BYTES + SLOT_BYTES;
        inline_bytes += round_to_ceiling(8, unaligned) - unaligned;
    }
    let raw = raw_spine_bytes(1, inline_bytes, request.pre_hash).ok_or(LayoutError::SizeOverflow)?;
    Ok(LayoutPlan {
        layout: ArrayletLayout::InlineContiguous,
        element_count: request.element_count,
        element_size: request.element_size,
        data_bytes,
        spine_bytes: round_to_ceiling(config.object_alignment, raw),
        leaf_count: 1,
        layout_overhead_bytes: 0,
        inline_remainder_bytes: 0,
        hash_offset: request.pre_hash.then_some(raw - SLOT_BYTES),
    })
}

fn discontiguous_plan(
    request: &LayoutRequest,
    config: &HeapConfig,
    data_bytes: usize,
) -> Result<LayoutPlan, LayoutError> {
    // Non-empty discontiguous arrays require the slow path; empty ones are
    // a spine plus a single null arrayoid slot and never allocate.
    if !request.gc_allowed && request.element_count != 0 {
        return Err(LayoutError::RelocationForbidden(ArrayletLayout::Discontiguous));
    }

    let leaf_count = data_bytes.div_ceil(config.leaf_size).max(1);
    let raw =
        raw_spine_bytes(leaf_count, 0, request.pre_hash).ok_or(LayoutError::SizeOverflow)?;
    Ok(LayoutPlan {
        layout: ArrayletLayout::Discontiguous,
        element_count: request.element_count,
        element_size: request.element_size,
        data_bytes,
        spine_bytes: round_to_ceiling(config.object_alignment, raw),
        leaf_count,
        layout_overhead_bytes: data_bytes,
        inline_remainder_bytes: 0,
        hash_offset: request.pre_hash.then_some(raw - SLOT_BYTES),
    })
}

fn hybrid_plan(
    request: &LayoutRequest,
    config: &HeapConfig,
    data_bytes: usize,
) -> Result<LayoutPlan, LayoutError> {
    // Hybrid arrays always require the slow path.
    if !request.gc_allowed {
        return Err(LayoutError::RelocationForbidden(ArrayletLayout::Hybrid));
    }

    let leaf_size = config.leaf_size;
    let remainder = data_bytes % leaf_size;
    debug_assert!(remainder != 0 && data_bytes > leaf_size);

    let leaf_count = data_bytes.div_ceil(leaf_size);
    let mut inline_bytes = remainder;
    if config.align_spine_data {
        let unaligned = SpineHeader::BYTES + leaf_count * SLOT_BYTES;
        inline_bytes += round_to_ceiling(8, unaligned) - unaligned;
    }
    let raw = raw_spine_bytes(leaf_count, inline_bytes, request.pre_hash)
        .ok_or(LayoutError::SizeOverflow)?;
    let overhead = (leaf_count - 1)
        .checked_mul(leaf_size)
        .ok_or(LayoutError::SizeOverflow)?;
    Ok(LayoutPlan {
        layout: ArrayletLayout::Hybrid,
        element_count: request.element_count,
        element_size: request.element_size,
        data_bytes,
        spine_bytes: round_to_ceiling(config.object_alignment, raw),
        leaf_count,
        layout_overhead_bytes: overhead,
        inline_remainder_bytes: remainder,
        hash_offset: request.pre_hash.then_some(raw - SLOT_BYTES),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HeapConfig {
        HeapConfig::new(4096).unwrap()
    }

    #[test]
    fn small_array_is_inline() {
        let plan = select_layout(&LayoutRequest::new(100, 8), &config()).unwrap();
        assert_eq!(plan.layout, ArrayletLayout::InlineContiguous);
        assert_eq!(plan.leaf_count, 1);
        assert_eq!(plan.layout_overhead_bytes, 0);
        assert!(plan.spine_bytes >= SpineHeader::BYTES + SLOT_BYTES + 800);
        assert_eq!(plan.spine_bytes % config().object_alignment, 0);
    }

    #[test]
    fn large_array_is_discontiguous_with_ceil_leaves() {
        // 10000 * 8 = 80000 bytes over 4096-byte leaves => 20 leaves,
        // last leaf holding the 80000 % 4096 = 2176 byte remainder.
        let plan = select_layout(&LayoutRequest::new(10_000, 8), &config()).unwrap();
        assert_eq!(plan.layout, ArrayletLayout::Discontiguous);
        assert_eq!(plan.data_bytes, 80_000);
        assert_eq!(plan.leaf_count, 20);
        assert_eq!(plan.layout_overhead_bytes, 80_000);
        assert_eq!(plan.data_bytes - 19 * 4096, 2176);
        assert_eq!(plan.external_leaf_count(4096), 20);
        assert_eq!(plan.bytes_requested(), plan.spine_bytes + 80_000);
    }

    #[test]
    fn empty_array_is_discontiguous_with_one_slot() {
        let plan = select_layout(&LayoutRequest::new(0, 8), &config()).unwrap();
        assert_eq!(plan.layout, ArrayletLayout::Discontiguous);
        assert_eq!(plan.leaf_count, 1);
        assert_eq!(plan.data_bytes, 0);
        assert_eq!(plan.external_leaf_count(4096), 0);
    }

    #[test]
    fn empty_array_allowed_without_gc() {
        let mut request = LayoutRequest::new(0, 8);
        request.gc_allowed = false;
        assert!(select_layout(&request, &config()).is_ok());
    }

    #[test]
    fn non_empty_discontiguous_rejected_without_gc() {
        let mut request = LayoutRequest::new(10_000, 8);
        request.gc_allowed = false;
        assert_eq!(
            select_layout(&request, &config()),
            Err(LayoutError::RelocationForbidden(ArrayletLayout::Discontiguous))
        );
    }

    #[test]
    fn hybrid_folds_remainder_inline() {
        let mut config = config();
        config.hybrid_remainder = true;

        let plan = select_layout(&LayoutRequest::new(10_000, 8), &config).unwrap();
        assert_eq!(plan.layout, ArrayletLayout::Hybrid);
        assert_eq!(plan.leaf_count, 20);
        assert_eq!(plan.inline_remainder_bytes, 80_000 % 4096);
        assert_eq!(plan.layout_overhead_bytes, 19 * 4096);
        assert_eq!(plan.external_leaf_count(4096), 19);
        // Spine carries the remainder bytes.
        assert!(plan.spine_bytes > SpineHeader::BYTES + 20 * SLOT_BYTES + plan.inline_remainder_bytes - 8);
    }

    #[test]
    fn exact_multiple_stays_discontiguous_even_with_hybrid() {
        let mut config = config();
        config.hybrid_remainder = true;

        // 4096 * 4 bytes: no remainder to fold inline.
        let plan = select_layout(&LayoutRequest::new(4096, 4), &config).unwrap();
        assert_eq!(plan.layout, ArrayletLayout::Discontiguous);
        assert_eq!(plan.leaf_count, 4);
    }

    #[test]
    fn hybrid_rejected_without_gc() {
        let mut config = config();
        config.hybrid_remainder = true;
        let mut request = LayoutRequest::new(10_000, 8);
        request.gc_allowed = false;
        assert_eq!(
            select_layout(&request, &config),
            Err(LayoutError::RelocationForbidden(ArrayletLayout::Hybrid))
        );
    }

    #[test]
    fn double_mapping_disables_hybrid() {
        let mut config = config();
        config.hybrid_remainder = false;
        config.double_map_enabled = true;

        let plan = select_layout(&LayoutRequest::new(10_000, 8), &config).unwrap();
        assert_eq!(plan.layout, ArrayletLayout::Discontiguous);
    }

    #[test]
    fn pre_hash_reserves_a_slot() {
        let bare = select_layout(&LayoutRequest::new(100, 8), &config()).unwrap();
        let mut request = LayoutRequest::new(100, 8);
        request.pre_hash = true;
        let hashed = select_layout(&request, &config()).unwrap();

        assert!(hashed.spine_bytes >= bare.spine_bytes + SLOT_BYTES);
        let offset = hashed.hash_offset.unwrap();
        assert!(offset < hashed.spine_bytes);
        assert!(bare.hash_offset.is_none());
    }

    #[test]
    fn overflow_is_rejected() {
        assert_eq!(
            select_layout(&LayoutRequest::new(usize::MAX, 8), &config()),
            Err(LayoutError::SizeOverflow)
        );
    }

    #[test]
    fn spine_is_alignment_rounded() {
        let mut config = config();
        config.object_alignment = 16;
        for count in [1usize, 3, 17, 100, 513] {
            let plan = select_layout(&LayoutRequest::new(count, 3), &config).unwrap();
            assert_eq!(plan.spine_bytes % 16, 0, "count {count}");
        }
    }
}
