//! Arraylet memory layout for discontiguous array objects.
//!
//! `arraylet-gc` splits large array payloads into fixed-size **leaves**
//! referenced from a word-sized slot table (the **arrayoid**) inside a
//! **spine** object, so a collector can manage huge arrays without
//! requiring huge contiguous heap ranges.
//!
//! Three layouts cover the size spectrum:
//!
//! - **Inline-contiguous**: the payload fits in one leaf and lives inside
//!   the spine itself.
//! - **Discontiguous**: the payload spans `ceil(data / leaf)` externally
//!   allocated leaves.
//! - **Hybrid**: full leaves outside, the sub-leaf remainder inline in the
//!   spine (unavailable when double mapping is on).
//!
//! For discontiguous arrays the crate can additionally create a
//! **double-mapped** contiguous virtual view: the leaf pages are aliased
//! back-to-back at a second address, so code that needs `base + offset`
//! addressing (JIT-compiled accessors, bulk copies) works on a scattered
//! array at no copy cost.
//!
//! # Quick Start
//!
//! ```ignore
//! use arraylet_gc::{ArrayletHeap, HeapConfig, LayoutRequest};
//!
//! let config = HeapConfig::new(4096)?;
//! let mut heap = ArrayletHeap::new(config, 64 * 1024 * 1024)?;
//!
//! // 80_000 bytes of i64 elements: one spine, twenty 4 KiB leaves.
//! let spine = heap
//!     .allocate_array(&LayoutRequest::new(10_000, 8))?
//!     .expect("heap exhausted");
//! ```
//!
//! # Collection safety
//!
//! Every leaf allocation is a potential collection point that may move
//! the spine. The linker therefore works through an
//! [`AllocationDescription`] and re-resolves the spine address after
//! every single leaf allocation; see [`attach_leaves`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod doublemap;
pub mod heap;
pub mod layout;
pub mod link;
pub mod spine;
mod tracing;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util;

pub use config::{ConfigError, HeapConfig};
pub use doublemap::{
    ArenaMapper, DoubleMapRegistry, DoubleMappedRange, DoubleMapper, MapError, MapOutcome,
    MappingView,
};
pub use heap::{ArrayletHeap, HeapError};
pub use layout::{select_layout, ArrayletLayout, LayoutError, LayoutPlan, LayoutRequest};
pub use link::{attach_leaves, LeafAllocator};
pub use spine::{AllocationDescription, Spine, SLOT_BYTES};
