//! Double-map registry: deduplicated contiguous views of scattered leaves.
//!
//! A discontiguous arraylet's leaves live wherever the heap put them. When
//! a consumer (native array access, typically) needs one contiguous byte
//! range, the leaves' physical pages are mapped a second time, back to
//! back, at a fresh virtual range. This module owns the bookkeeping for
//! those aliases: one entry per spine heap address, created on first
//! request and torn down exactly once when the owning object dies.
//!
//! The registry is an owned component constructed per heap instance, not a
//! process-wide singleton. A single mutex serializes insert, duplicate
//! lookup, and removal; mapping is a cold path and correctness beats
//! throughput here.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use sys_dmap::{AliasMap, LeafArena};

use crate::layout::ArrayletLayout;
use crate::spine::Spine;
use crate::tracing::internal as trace;

/// Failures on the mapping path.
///
/// All of these are recoverable for the immediate caller, which falls
/// back to a copying strategy instead of a zero-copy view.
#[derive(Debug, Error)]
pub enum MapError {
    /// The platform (or mapper) cannot alias pages at all.
    #[error("double mapping is not supported on this platform")]
    Unsupported,

    /// An entry for this object already exists; the surplus OS mapping
    /// created for this call has been unwound.
    #[error("a mapping for object {addr:#x} already exists")]
    Duplicate {
        /// Spine heap address of the existing entry.
        addr: usize,
    },

    /// No entry to release for this object.
    #[error("no mapping registered for object {addr:#x}")]
    NotMapped {
        /// Spine heap address the caller tried to release.
        addr: usize,
    },

    /// A leaf address is not backed by the mapper's arena.
    #[error("leaf address {addr:#x} is outside the backing arena")]
    ForeignLeaf {
        /// The offending leaf address.
        addr: usize,
    },

    /// The OS-level map or unmap primitive failed.
    #[error("OS mapping primitive failed: {0}")]
    Os(#[from] io::Error),
}

/// A fresh alias produced by a [`DoubleMapper`].
pub struct DoubleMappedRange<I> {
    /// Base of the contiguous virtual range.
    pub contiguous_addr: usize,
    /// Opaque handle needed to unmap the range later.
    pub identifier: I,
    /// Bytes actually reserved by the OS; at least the data size.
    pub reserved_size: usize,
}

/// The OS-level page-aliasing primitive, as the registry consumes it.
///
/// Implemented by [`ArenaMapper`] over a real arena; tests substitute
/// recording fakes.
pub trait DoubleMapper {
    /// Opaque handle for one created alias.
    type Identifier;

    /// Whether aliasing can work at all on this platform/configuration.
    fn supports_double_mapping(&self) -> bool;

    /// Page granularity the mapping operates at.
    fn page_granularity(&self) -> usize;

    /// Maps `leaf_addrs` (ascending leaf-index order) into one contiguous
    /// range of `leaf_addrs.len() * leaf_size` reserved bytes, of which
    /// `actual_size` are real data.
    ///
    /// # Errors
    ///
    /// Any [`MapError`]; the caller treats all of them as "no view".
    fn double_map(
        &self,
        leaf_addrs: &[usize],
        leaf_size: usize,
        actual_size: usize,
        page_size: usize,
    ) -> Result<DoubleMappedRange<Self::Identifier>, MapError>;

    /// Releases an alias produced by [`DoubleMapper::double_map`].
    ///
    /// # Errors
    ///
    /// Any [`MapError`] from the OS unmap primitive.
    fn unmap(&self, identifier: Self::Identifier, reserved_size: usize) -> Result<(), MapError>;
}

/// Outcome of a mapping request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    /// A new alias was created and registered.
    Mapped {
        /// Base of the contiguous alias.
        contiguous_addr: usize,
    },
    /// The leaves are already physically adjacent; no alias is needed and
    /// no registry entry was created. Consumers read through the first
    /// leaf directly.
    AlreadyContiguous {
        /// Address of leaf 0, start of the naturally contiguous range.
        base: usize,
    },
}

/// One live mapping, keyed by the spine's heap address at mapping time.
struct MappingEntry<I> {
    contiguous_addr: usize,
    identifier: I,
    reserved_size: usize,
    actual_size: usize,
}

/// A registered mapping as seen by lookups (no identifier exposure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingView {
    /// Base of the contiguous alias.
    pub contiguous_addr: usize,
    /// Bytes reserved by the OS primitive.
    pub reserved_size: usize,
    /// True data byte length.
    pub actual_size: usize,
}

/// Returns true when consecutive leaves sit back to back in memory, making
/// an alias pointless.
#[must_use]
pub fn leaves_are_adjacent(leaf_addrs: &[usize], leaf_size: usize) -> bool {
    leaf_addrs
        .windows(2)
        .all(|pair| pair[1] == pair[0] + leaf_size)
}

/// The double-map registry: mapper plus the table of live aliases.
pub struct DoubleMapRegistry<M: DoubleMapper> {
    mapper: M,
    table: Mutex<HashMap<usize, MappingEntry<M::Identifier>>>,
}

impl<M: DoubleMapper> DoubleMapRegistry<M> {
    /// Creates an empty registry over `mapper`.
    pub fn new(mapper: M) -> Self {
        Self {
            mapper,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Whether this registry can create mappings at all.
    pub fn supports_double_mapping(&self) -> bool {
        self.mapper.supports_double_mapping()
    }

    /// The underlying mapping primitive.
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Creates and registers a contiguous view over `leaf_addrs` for the
    /// object at `object_addr`.
    ///
    /// Leaf addresses must be in ascending leaf-index order: byte
    /// `i * leaf_size` of the alias corresponds to logical range `i`, so
    /// any reordering corrupts the view. When the leaves are already
    /// adjacent the alias is skipped entirely and no entry is created.
    ///
    /// The OS mapping is created first, then the insert runs under the
    /// lock; a concurrent winner for the same key makes this call's
    /// mapping surplus, which is unwound before the duplicate is reported.
    ///
    /// # Errors
    ///
    /// [`MapError::Unsupported`], [`MapError::Duplicate`], or whatever the
    /// primitive returned. All leave the registry unchanged.
    ///
    /// # Panics
    ///
    /// Panics when `leaf_addrs.len() != expected_leaves` or the collection
    /// is empty: a mismatch means heap corruption or a concurrent layout
    /// change, which recovery could only make worse.
    pub fn try_create_mapping(
        &self,
        object_addr: usize,
        leaf_addrs: &[usize],
        expected_leaves: usize,
        leaf_size: usize,
        actual_size: usize,
    ) -> Result<MapOutcome, MapError> {
        if !self.mapper.supports_double_mapping() {
            return Err(MapError::Unsupported);
        }
        assert_eq!(
            leaf_addrs.len(),
            expected_leaves,
            "collected leaf count diverges from the layout's leaf count"
        );
        assert!(expected_leaves > 0, "cannot map an arraylet with no leaves");

        if leaves_are_adjacent(leaf_addrs, leaf_size) {
            trace::double_map_skipped(object_addr);
            return Ok(MapOutcome::AlreadyContiguous {
                base: leaf_addrs[0],
            });
        }

        let range = self.mapper.double_map(
            leaf_addrs,
            leaf_size,
            actual_size,
            self.mapper.page_granularity(),
        )?;
        let contiguous_addr = range.contiguous_addr;
        let reserved_size = range.reserved_size;

        let surplus = {
            let mut table = self.table.lock();
            match table.entry(object_addr) {
                Entry::Occupied(_) => Some(range),
                Entry::Vacant(slot) => {
                    slot.insert(MappingEntry {
                        contiguous_addr,
                        identifier: range.identifier,
                        reserved_size,
                        actual_size,
                    });
                    None
                }
            }
        };

        if let Some(range) = surplus {
            // This call lost the race; its mapping must not leak.
            let unwind_failed = self
                .mapper
                .unmap(range.identifier, range.reserved_size)
                .is_err();
            trace::double_map_duplicate(object_addr, unwind_failed);
            return Err(MapError::Duplicate { addr: object_addr });
        }

        trace::double_map_created(object_addr, contiguous_addr, reserved_size);
        Ok(MapOutcome::Mapped { contiguous_addr })
    }

    /// Gathers leaves from a linked discontiguous spine and maps them.
    ///
    /// The trailing null slot of an empty-last-leaf arraylet is skipped
    /// during collection; the count of real leaves must still match the
    /// layout arithmetic exactly.
    ///
    /// # Errors
    ///
    /// As [`DoubleMapRegistry::try_create_mapping`].
    ///
    /// # Panics
    ///
    /// Panics for hybrid spines (they keep data inline and must never be
    /// mapped) and on leaf-count divergence.
    ///
    /// # Safety
    ///
    /// `spine` must be live with a fully linked arrayoid, and must stay
    /// live until the mapping is released.
    pub unsafe fn map_spine(
        &self,
        spine: &Spine,
        leaf_size: usize,
    ) -> Result<MapOutcome, MapError> {
        assert!(
            spine.layout() != ArrayletLayout::Hybrid,
            "hybrid arraylets must never be double mapped"
        );
        let data_bytes = spine.data_bytes();
        assert!(data_bytes > 0, "cannot map an empty arraylet");

        // SAFETY: caller guarantees the spine is live and linked.
        let leaf_addrs = unsafe { spine.collect_leaf_addrs() };
        let expected = data_bytes.div_ceil(leaf_size);
        self.try_create_mapping(spine.addr(), &leaf_addrs, expected, leaf_size, data_bytes)
    }

    /// Removes the entry for `object_addr` and unmaps its alias.
    ///
    /// Single-owner teardown: callers release a key exactly once, when the
    /// owning object is reclaimed. Releasing an unknown key reports
    /// [`MapError::NotMapped`] and is a caller bug, not a recovery path.
    ///
    /// # Errors
    ///
    /// [`MapError::NotMapped`], or the primitive's unmap failure (the
    /// entry is gone from the table either way).
    pub fn release_mapping(&self, object_addr: usize) -> Result<(), MapError> {
        let entry = self
            .table
            .lock()
            .remove(&object_addr)
            .ok_or(MapError::NotMapped { addr: object_addr })?;
        // Unmap outside the lock; nothing else can reach this entry now.
        self.mapper.unmap(entry.identifier, entry.reserved_size)?;
        trace::double_map_released(object_addr, entry.reserved_size);
        Ok(())
    }

    /// Looks up the live mapping for `object_addr`, if any.
    pub fn mapping(&self, object_addr: usize) -> Option<MappingView> {
        self.table.lock().get(&object_addr).map(|entry| MappingView {
            contiguous_addr: entry.contiguous_addr,
            reserved_size: entry.reserved_size,
            actual_size: entry.actual_size,
        })
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// True when no mappings are live.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

/// [`DoubleMapper`] over a real [`LeafArena`].
///
/// Leaf addresses are translated to arena offsets and aliased through the
/// arena's backing fd; the alias handle doubles as the unmap identifier.
pub struct ArenaMapper {
    arena: Arc<LeafArena>,
}

impl ArenaMapper {
    /// Creates a mapper over `arena`.
    #[must_use]
    pub const fn new(arena: Arc<LeafArena>) -> Self {
        Self { arena }
    }
}

impl DoubleMapper for ArenaMapper {
    type Identifier = AliasMap;

    fn supports_double_mapping(&self) -> bool {
        sys_dmap::supported()
    }

    fn page_granularity(&self) -> usize {
        sys_dmap::page_size()
    }

    fn double_map(
        &self,
        leaf_addrs: &[usize],
        leaf_size: usize,
        actual_size: usize,
        _page_size: usize,
    ) -> Result<DoubleMappedRange<AliasMap>, MapError> {
        let offsets = leaf_addrs
            .iter()
            .map(|&addr| {
                self.arena
                    .offset_of(addr)
                    .ok_or(MapError::ForeignLeaf { addr })
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug_assert!(actual_size <= offsets.len() * leaf_size);

        let alias = self.arena.alias(&offsets, leaf_size)?;
        Ok(DoubleMappedRange {
            contiguous_addr: alias.ptr() as usize,
            reserved_size: alias.len(),
            identifier: alias,
        })
    }

    fn unmap(&self, identifier: AliasMap, reserved_size: usize) -> Result<(), MapError> {
        debug_assert_eq!(identifier.len(), reserved_size);
        identifier.unmap()?;
        Ok(())
    }
}
