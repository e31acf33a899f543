//! Diagnostic events for leaf linking and double mapping.
//!
//! When the `tracing` feature is enabled, this module emits structured,
//! level-gated events at the linking and mapping call sites. With the
//! feature disabled every function compiles to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use tracing::{span, Level};

    /// Span covering one arraylet link (spine plus all leaves).
    pub fn trace_link(element_count: usize, spine_bytes: usize, leaf_count: usize) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "arraylet_link",
            element_count,
            spine_bytes,
            leaf_count
        )
        .entered()
    }

    /// One leaf attached to the spine.
    pub fn leaf_linked(index: usize, leaf_addr: usize, spine_addr: usize) {
        tracing::trace!(index, leaf_addr, spine_addr, "leaf_linked");
    }

    /// Leaf allocation failed; spine and prior leaves abandoned.
    pub fn leaf_alloc_failed(index: usize) {
        tracing::debug!(index, "leaf_alloc_failed");
    }

    /// A contiguous alias was created and registered.
    pub fn double_map_created(object_addr: usize, contiguous_addr: usize, reserved_size: usize) {
        tracing::debug!(object_addr, contiguous_addr, reserved_size, "double_map_created");
    }

    /// Mapping skipped because the leaves are already adjacent.
    pub fn double_map_skipped(object_addr: usize) {
        tracing::debug!(object_addr, "double_map_skipped_contiguous");
    }

    /// A duplicate-key insert was detected and the surplus mapping unwound.
    pub fn double_map_duplicate(object_addr: usize, unwind_failed: bool) {
        tracing::warn!(object_addr, unwind_failed, "double_map_duplicate");
    }

    /// A mapping was released and unmapped.
    pub fn double_map_released(object_addr: usize, reserved_size: usize) {
        tracing::debug!(object_addr, reserved_size, "double_map_released");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub span guard when tracing is disabled.
    pub struct EnteredSpan;

    pub fn trace_link(_element_count: usize, _spine_bytes: usize, _leaf_count: usize) -> EnteredSpan {
        EnteredSpan
    }

    pub fn leaf_linked(_index: usize, _leaf_addr: usize, _spine_addr: usize) {}

    pub fn leaf_alloc_failed(_index: usize) {}

    pub fn double_map_created(_object_addr: usize, _contiguous_addr: usize, _reserved_size: usize) {}

    pub fn double_map_skipped(_object_addr: usize) {}

    pub fn double_map_duplicate(_object_addr: usize, _unwind_failed: bool) {}

    pub fn double_map_released(_object_addr: usize, _reserved_size: usize) {}
}
