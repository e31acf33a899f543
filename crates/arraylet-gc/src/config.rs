//! Per-heap configuration.
//!
//! A [`HeapConfig`] is constructed once per heap instance and passed by
//! reference into the layout selector, the leaf linker, and the double-map
//! registry. There is no process-global configuration.

use thiserror::Error;

/// Smallest leaf size accepted; anything below a word array slot is bogus.
const MIN_LEAF_SIZE: usize = 512;

/// Errors produced while validating a [`HeapConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Leaf size must be a power of two of at least [`MIN_LEAF_SIZE`] bytes.
    #[error("leaf size {0} is not a power of two of at least 512 bytes")]
    InvalidLeafSize(usize),

    /// Object alignment must be a power of two of at least word size.
    #[error("object alignment {0} is not a power of two of at least word size")]
    InvalidAlignment(usize),

    /// Hybrid layouts keep remainder bytes in the spine, which cannot be
    /// aliased; the two features are mutually exclusive.
    #[error("hybrid remainder layout cannot be combined with double mapping")]
    HybridWithDoubleMap,

    /// Double mapping places leaves at OS mapping granularity; the leaf
    /// size must be a multiple of it.
    #[error("leaf size {leaf_size} is not a multiple of the mapping granularity {granularity}")]
    LeafSizeNotMappable {
        /// Configured leaf size.
        leaf_size: usize,
        /// OS allocation granularity.
        granularity: usize,
    },
}

/// Layout and mapping parameters for one heap instance.
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    /// Size in bytes of every externally allocated leaf.
    pub leaf_size: usize,
    /// Granularity spine allocations are rounded up to.
    pub object_alignment: usize,
    /// Round the spine's inline data section up to an 8-byte boundary.
    pub align_spine_data: bool,
    /// Discontiguous arraylets may be aliased into a contiguous view.
    pub double_map_enabled: bool,
    /// Store `data_bytes % leaf_size` remainder bytes inline in the spine
    /// instead of in a partial final leaf.
    pub hybrid_remainder: bool,
}

impl HeapConfig {
    /// Creates a configuration with the given leaf size and defaults for
    /// everything else (word alignment, no data-section alignment, no
    /// double mapping, no hybrid remainder).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidLeafSize`] for a leaf size that is not
    /// a power of two of at least 512 bytes.
    pub const fn new(leaf_size: usize) -> Result<Self, ConfigError> {
        if leaf_size < MIN_LEAF_SIZE || !leaf_size.is_power_of_two() {
            return Err(ConfigError::InvalidLeafSize(leaf_size));
        }
        Ok(Self {
            leaf_size,
            object_alignment: std::mem::size_of::<usize>(),
            align_spine_data: false,
            double_map_enabled: false,
            hybrid_remainder: false,
        })
    }

    /// Re-validates the whole configuration, including cross-field rules.
    ///
    /// Called by the heap constructor after the caller has adjusted fields.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.leaf_size < MIN_LEAF_SIZE || !self.leaf_size.is_power_of_two() {
            return Err(ConfigError::InvalidLeafSize(self.leaf_size));
        }
        if self.object_alignment < std::mem::size_of::<usize>()
            || !self.object_alignment.is_power_of_two()
        {
            return Err(ConfigError::InvalidAlignment(self.object_alignment));
        }
        if self.hybrid_remainder && self.double_map_enabled {
            return Err(ConfigError::HybridWithDoubleMap);
        }
        Ok(())
    }

    /// Checks the leaf size against the OS mapping granularity.
    ///
    /// Only meaningful when double mapping is enabled; a heap that never
    /// maps may use any leaf size.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::LeafSizeNotMappable`] if leaves could not be
    /// placed at mapping granularity.
    pub const fn validate_mappable(&self, granularity: usize) -> Result<(), ConfigError> {
        if self.double_map_enabled && self.leaf_size % granularity != 0 {
            return Err(ConfigError::LeafSizeNotMappable {
                leaf_size: self.leaf_size,
                granularity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HeapConfig::new(4096).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.leaf_size, 4096);
        assert!(!config.double_map_enabled);
    }

    #[test]
    fn rejects_bad_leaf_sizes() {
        assert!(HeapConfig::new(0).is_err());
        assert!(HeapConfig::new(100).is_err());
        assert!(HeapConfig::new(3000).is_err());
        assert!(HeapConfig::new(256).is_err(), "below minimum");
        assert!(HeapConfig::new(512).is_ok());
    }

    #[test]
    fn hybrid_and_double_map_are_mutually_exclusive() {
        let mut config = HeapConfig::new(4096).unwrap();
        config.hybrid_remainder = true;
        assert!(config.validate().is_ok());

        config.double_map_enabled = true;
        assert_eq!(config.validate(), Err(ConfigError::HybridWithDoubleMap));
    }

    #[test]
    fn mappable_check_only_applies_when_mapping() {
        let mut config = HeapConfig::new(4096).unwrap();
        assert!(config.validate_mappable(65536).is_ok());

        config.double_map_enabled = true;
        assert!(config.validate_mappable(4096).is_ok());
        assert!(matches!(
            config.validate_mappable(65536),
            Err(ConfigError::LeafSizeNotMappable { .. })
        ));
    }
}
