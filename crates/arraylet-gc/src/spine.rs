//! Spine memory layout and the re-resolvable allocation handle.
//!
//! A spine is a header followed by the arrayoid (one word-sized slot per
//! leaf) and, for inline and hybrid layouts, an inline data section. All
//! access goes through [`Spine`], a thin copyable wrapper over the raw
//! header pointer.
//!
//! Because a collection triggered by a leaf allocation may relocate the
//! spine, nothing on the allocation path may cache a spine address across
//! an allocation. [`AllocationDescription`] is the single source of truth:
//! the allocator rewrites it on relocation and the linker re-resolves it
//! after every leaf.

use std::cell::Cell;
use std::ptr::NonNull;

use crate::layout::{round_to_ceiling, ArrayletLayout, LayoutPlan};

/// Size of one arrayoid slot (a word).
pub const SLOT_BYTES: usize = std::mem::size_of::<usize>();

/// Fixed header at the start of every spine.
///
/// The spine memory it is written into must be zeroed; the arrayoid slots
/// after the header are then already null.
#[repr(C)]
#[derive(Debug)]
pub struct SpineHeader {
    layout: u8,
    flags: u8,
    _padding: [u8; 6],
    element_count: usize,
    element_size: usize,
    data_bytes: usize,
    leaf_count: usize,
}

impl SpineHeader {
    /// Header size in bytes.
    pub const BYTES: usize = std::mem::size_of::<Self>();
}

const LAYOUT_INLINE: u8 = 1;
const LAYOUT_DISCONTIGUOUS: u8 = 2;
const LAYOUT_HYBRID: u8 = 3;

const fn layout_tag(layout: ArrayletLayout) -> u8 {
    match layout {
        ArrayletLayout::InlineContiguous => LAYOUT_INLINE,
        ArrayletLayout::Discontiguous => LAYOUT_DISCONTIGUOUS,
        ArrayletLayout::Hybrid => LAYOUT_HYBRID,
    }
}

/// A spine reference; copyable, non-owning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spine {
    ptr: NonNull<SpineHeader>,
}

impl Spine {
    /// Writes a spine header into `mem` and returns the new spine.
    ///
    /// # Safety
    ///
    /// `mem` must point to at least `plan.spine_bytes` of zeroed,
    /// word-aligned memory that stays valid for the life of the spine.
    #[must_use]
    pub unsafe fn initialize(mem: NonNull<u8>, plan: &LayoutPlan) -> Self {
        let header = mem.cast::<SpineHeader>();
        // SAFETY: caller guarantees the memory is valid and aligned.
        unsafe {
            header.write(SpineHeader {
                layout: layout_tag(plan.layout),
                flags: 0,
                _padding: [0; 6],
                element_count: plan.element_count,
                element_size: plan.element_size,
                data_bytes: plan.data_bytes,
                leaf_count: plan.leaf_count,
            });
        }
        Self { ptr: header }
    }

    /// Reconstructs a spine reference from a raw header pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live, initialized spine header.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<SpineHeader>) -> Self {
        Self { ptr }
    }

    /// The spine's current heap address.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Raw header pointer.
    #[must_use]
    pub const fn as_ptr(&self) -> NonNull<SpineHeader> {
        self.ptr
    }

    fn header(&self) -> &SpineHeader {
        // SAFETY: constructed from a live spine header.
        unsafe { self.ptr.as_ref() }
    }

    /// Layout variant recorded at initialization.
    ///
    /// # Panics
    ///
    /// Panics on a corrupt layout tag; an unknown tag means the header was
    /// overwritten and continuing would risk silent corruption.
    #[must_use]
    pub fn layout(&self) -> ArrayletLayout {
        match self.header().layout {
            LAYOUT_INLINE => ArrayletLayout::InlineContiguous,
            LAYOUT_DISCONTIGUOUS => ArrayletLayout::Discontiguous,
            LAYOUT_HYBRID => ArrayletLayout::Hybrid,
            tag => unreachable!("corrupt spine layout tag {tag}"),
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.header().element_count
    }

    /// Bytes per element.
    #[must_use]
    pub fn element_size(&self) -> usize {
        self.header().element_size
    }

    /// Total element data bytes.
    #[must_use]
    pub fn data_bytes(&self) -> usize {
        self.header().data_bytes
    }

    /// Arrayoid slot count.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.header().leaf_count
    }

    /// Byte offset of the arrayoid from the spine base.
    #[must_use]
    pub const fn arrayoid_offset() -> usize {
        SpineHeader::BYTES
    }

    /// Byte offset of the inline data section (inline and hybrid layouts).
    ///
    /// Sits right after the arrayoid, rounded up to 8 bytes when the data
    /// section is aligned.
    #[must_use]
    pub fn inline_data_offset(&self, align_spine_data: bool) -> usize {
        let unaligned = SpineHeader::BYTES + self.leaf_count() * SLOT_BYTES;
        if align_spine_data {
            round_to_ceiling(8, unaligned)
        } else {
            unaligned
        }
    }

    fn slot_ptr(&self, index: usize) -> *mut usize {
        assert!(index < self.leaf_count(), "arrayoid index out of range");
        let base = self.ptr.as_ptr().cast::<u8>();
        // SAFETY: index was bounds-checked against the header's leaf count.
        unsafe { base.add(Self::arrayoid_offset() + index * SLOT_BYTES).cast::<usize>() }
    }

    /// Reads arrayoid slot `index`; `None` for a null slot.
    ///
    /// # Safety
    ///
    /// The spine must be live and its arrayoid initialized (or zeroed).
    #[must_use]
    pub unsafe fn arrayoid_slot(&self, index: usize) -> Option<NonNull<u8>> {
        // SAFETY: slot_ptr bounds-checks; caller guarantees liveness.
        let value = unsafe { self.slot_ptr(index).read() };
        NonNull::new(value as *mut u8)
    }

    /// Writes arrayoid slot `index`.
    ///
    /// # Safety
    ///
    /// The spine must be live; `leaf` (when non-null) must point at a leaf
    /// owned exclusively by this spine.
    pub unsafe fn set_arrayoid_slot(&self, index: usize, leaf: Option<NonNull<u8>>) {
        let value = leaf.map_or(0, |p| p.as_ptr() as usize);
        // SAFETY: slot_ptr bounds-checks; caller guarantees liveness.
        unsafe { self.slot_ptr(index).write(value) };
    }

    /// Collects the leaf addresses in arrayoid order, stopping at the
    /// first null slot (the trailing null of an empty last leaf).
    ///
    /// # Safety
    ///
    /// The spine must be live with a fully linked arrayoid.
    #[must_use]
    pub unsafe fn collect_leaf_addrs(&self) -> Vec<usize> {
        let mut addrs = Vec::with_capacity(self.leaf_count());
        for index in 0..self.leaf_count() {
            // SAFETY: index is in range; caller guarantees liveness.
            match unsafe { self.arrayoid_slot(index) } {
                Some(leaf) => addrs.push(leaf.as_ptr() as usize),
                None => break,
            }
        }
        addrs
    }
}

/// The mutable allocation description shared between the leaf linker and
/// the leaf allocator.
///
/// Holds the finalized plan and the spine's current location. A leaf
/// allocator that triggers a relocating collection must call
/// [`AllocationDescription::set_spine`] with the new location before
/// returning; the linker re-resolves after every allocation and never
/// caches the address.
pub struct AllocationDescription {
    plan: LayoutPlan,
    spine: Cell<Option<NonNull<SpineHeader>>>,
}

impl AllocationDescription {
    /// Creates a description for a freshly initialized spine.
    #[must_use]
    pub const fn new(plan: LayoutPlan, spine: Spine) -> Self {
        Self {
            plan,
            spine: Cell::new(Some(spine.ptr)),
        }
    }

    /// The finalized layout plan.
    #[must_use]
    pub const fn plan(&self) -> &LayoutPlan {
        &self.plan
    }

    /// Resolves the spine's current location.
    ///
    /// `None` after the spine was abandoned on a failed leaf allocation.
    #[must_use]
    pub fn resolve(&self) -> Option<Spine> {
        self.spine.get().map(|ptr| Spine { ptr })
    }

    /// Records a relocated spine location.
    pub fn set_spine(&self, spine: Spine) {
        self.spine.set(Some(spine.ptr));
    }

    /// Abandons the spine (failed allocation; the partial structure is
    /// garbage for the collector to reclaim).
    pub fn clear_spine(&self) {
        self.spine.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::layout::{select_layout, LayoutRequest};

    fn zeroed(bytes: usize) -> Vec<u8> {
        vec![0u8; bytes]
    }

    #[test]
    fn header_is_word_aligned_and_compact() {
        assert_eq!(SpineHeader::BYTES % SLOT_BYTES, 0);
        assert_eq!(SpineHeader::BYTES, 8 + 4 * SLOT_BYTES);
    }

    #[test]
    fn initialize_round_trips_plan_fields() {
        let config = HeapConfig::new(4096).unwrap();
        let plan = select_layout(&LayoutRequest::new(10_000, 8), &config).unwrap();
        let mut mem = zeroed(plan.spine_bytes);
        let spine =
            unsafe { Spine::initialize(NonNull::new(mem.as_mut_ptr()).unwrap(), &plan) };

        assert_eq!(spine.layout(), ArrayletLayout::Discontiguous);
        assert_eq!(spine.element_count(), 10_000);
        assert_eq!(spine.element_size(), 8);
        assert_eq!(spine.data_bytes(), 80_000);
        assert_eq!(spine.leaf_count(), 20);
    }

    #[test]
    fn slots_start_null_and_read_back_writes() {
        let config = HeapConfig::new(4096).unwrap();
        let plan = select_layout(&LayoutRequest::new(10_000, 8), &config).unwrap();
        let mut mem = zeroed(plan.spine_bytes);
        let spine =
            unsafe { Spine::initialize(NonNull::new(mem.as_mut_ptr()).unwrap(), &plan) };

        unsafe {
            assert_eq!(spine.arrayoid_slot(0), None);
            assert_eq!(spine.arrayoid_slot(19), None);

            let fake = NonNull::new(0x10_0000usize as *mut u8).unwrap();
            spine.set_arrayoid_slot(3, Some(fake));
            assert_eq!(spine.arrayoid_slot(3), Some(fake));
            spine.set_arrayoid_slot(3, None);
            assert_eq!(spine.arrayoid_slot(3), None);
        }
    }

    #[test]
    fn collect_stops_at_first_null() {
        let config = HeapConfig::new(4096).unwrap();
        let plan = select_layout(&LayoutRequest::new(2048, 8), &config).unwrap();
        assert_eq!(plan.leaf_count, 4);
        let mut mem = zeroed(plan.spine_bytes);
        let spine =
            unsafe { Spine::initialize(NonNull::new(mem.as_mut_ptr()).unwrap(), &plan) };

        unsafe {
            for i in 0..3 {
                let addr = (0x20_0000 + i * 0x1000) as *mut u8;
                spine.set_arrayoid_slot(i, NonNull::new(addr));
            }
            // Slot 3 left null.
            let addrs = spine.collect_leaf_addrs();
            assert_eq!(addrs, vec![0x20_0000, 0x20_1000, 0x20_2000]);
        }
    }

    #[test]
    fn inline_data_offset_alignment() {
        let config = HeapConfig::new(4096).unwrap();
        let plan = select_layout(&LayoutRequest::new(16, 1), &config).unwrap();
        let mut mem = zeroed(plan.spine_bytes);
        let spine =
            unsafe { Spine::initialize(NonNull::new(mem.as_mut_ptr()).unwrap(), &plan) };

        let unaligned = spine.inline_data_offset(false);
        let aligned = spine.inline_data_offset(true);
        assert_eq!(unaligned, SpineHeader::BYTES + SLOT_BYTES);
        assert_eq!(aligned % 8, 0);
        assert!(aligned >= unaligned);
    }

    #[test]
    fn description_resolution_tracks_relocation() {
        let config = HeapConfig::new(4096).unwrap();
        let plan = select_layout(&LayoutRequest::new(10_000, 8), &config).unwrap();
        let mut first = zeroed(plan.spine_bytes);
        let mut second = zeroed(plan.spine_bytes);

        let spine =
            unsafe { Spine::initialize(NonNull::new(first.as_mut_ptr()).unwrap(), &plan) };
        let desc = AllocationDescription::new(plan, spine);
        assert_eq!(desc.resolve().unwrap().addr(), first.as_ptr() as usize);

        // Simulate a relocating collection.
        second.copy_from_slice(&first);
        let moved =
            unsafe { Spine::from_raw(NonNull::new(second.as_mut_ptr().cast()).unwrap()) };
        desc.set_spine(moved);
        assert_eq!(desc.resolve().unwrap().addr(), second.as_ptr() as usize);

        desc.clear_spine();
        assert!(desc.resolve().is_none());
    }
}
