//! Construction parameters for the allocation strategies.

use crate::error::{AllocError, AllocResult};

/// Default region size for the general purpose strategies (2 MiB).
pub const DEFAULT_REGION_SIZE: usize = 2 * 1024 * 1024;

/// Smallest slot of the power-of-two strategy.
pub const DEFAULT_MIN_SLOT_SIZE: usize = 32;

/// Number of size classes of the power-of-two strategy (32 B up to 64 KiB).
pub const DEFAULT_CLASS_COUNT: usize = 12;

/// Bytes initially committed for every size class (64 KiB).
pub const DEFAULT_CLASS_SIZE: usize = 64 * 1024;

/// How much address space a region reserves on top of what it commits.
///
/// Reserving is free (no physical memory backs it) and lets the region grow in place
/// later on without moving anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReserveHint {
    /// Reserve exactly what is committed. The region can't grow.
    Exact,
    /// Half the standard headroom.
    Half,
    #[default]
    Standard,
}

impl ReserveHint {
    /// Factor applied to the committed size to get the reserved size.
    pub const fn multiplier(self) -> usize {
        match self {
            ReserveHint::Exact => 1,
            ReserveHint::Half => 4,
            ReserveHint::Standard => 8,
        }
    }
}

/// Configuration for [`crate::LinearAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearConfig {
    /// Bytes committed up front.
    pub initial_size: usize,
    pub reserve: ReserveHint,
    /// When `false` the allocator refuses to grow past `initial_size`.
    pub growable: bool,
}

impl LinearConfig {
    pub const fn new(initial_size: usize) -> Self {
        Self {
            initial_size,
            reserve: ReserveHint::Standard,
            growable: true,
        }
    }

    /// A capacity that never grows, so pointers handed out stay valid until `clear`.
    pub const fn fixed(capacity: usize) -> Self {
        Self {
            initial_size: capacity,
            reserve: ReserveHint::Exact,
            growable: false,
        }
    }

    pub fn validate(&self) -> AllocResult<()> {
        if self.initial_size == 0 {
            return Err(AllocError::InvalidConfig("linear allocator needs a non-zero initial size"));
        }
        Ok(())
    }
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REGION_SIZE)
    }
}

/// Configuration for [`crate::FreelistAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreelistConfig {
    pub initial_size: usize,
    pub reserve: ReserveHint,
}

impl FreelistConfig {
    pub const fn new(initial_size: usize) -> Self {
        Self {
            initial_size,
            reserve: ReserveHint::Standard,
        }
    }

    pub const fn with_reserve(mut self, reserve: ReserveHint) -> Self {
        self.reserve = reserve;
        self
    }

    pub fn validate(&self) -> AllocResult<()> {
        if self.initial_size == 0 {
            return Err(AllocError::InvalidConfig("freelist allocator needs a non-zero initial size"));
        }
        Ok(())
    }
}

impl Default for FreelistConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REGION_SIZE)
    }
}

/// Configuration for [`crate::PowAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowConfig {
    /// Slot size of the first class. Every following class doubles it.
    pub min_slot_size: usize,
    pub class_count: usize,
    /// Bytes initially committed per class (at least one slot).
    pub initial_class_size: usize,
    pub reserve: ReserveHint,
}

impl PowConfig {
    pub const fn new() -> Self {
        Self {
            min_slot_size: DEFAULT_MIN_SLOT_SIZE,
            class_count: DEFAULT_CLASS_COUNT,
            initial_class_size: DEFAULT_CLASS_SIZE,
            reserve: ReserveHint::Half,
        }
    }

    pub const fn with_initial_class_size(mut self, initial_class_size: usize) -> Self {
        self.initial_class_size = initial_class_size;
        self
    }

    pub const fn with_reserve(mut self, reserve: ReserveHint) -> Self {
        self.reserve = reserve;
        self
    }

    /// Slot size of the largest class.
    pub const fn max_slot_size(&self) -> usize {
        self.min_slot_size << (self.class_count - 1)
    }

    pub fn validate(&self) -> AllocResult<()> {
        // Slots must be able to hold the slot header plus the free list link.
        if !self.min_slot_size.is_power_of_two() || self.min_slot_size < 32 {
            return Err(AllocError::InvalidConfig(
                "minimum slot size must be a power of two of at least 32 bytes",
            ));
        }
        if self.class_count == 0 || self.class_count > 32 {
            return Err(AllocError::InvalidConfig("class count must be between 1 and 32"));
        }
        if self.min_slot_size.leading_zeros() < self.class_count as u32 {
            return Err(AllocError::InvalidConfig("largest slot size overflows"));
        }
        Ok(())
    }
}

impl Default for PowConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for [`crate::MemoryContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryConfig {
    /// General purpose (checked) heap.
    pub heap: FreelistConfig,
    /// Scratch memory, reset wholesale.
    pub scratch: LinearConfig,
    /// Small, same-sized objects.
    pub small_objects: PowConfig,
}

impl MemoryConfig {
    pub fn validate(&self) -> AllocResult<()> {
        self.heap.validate()?;
        self.scratch.validate()?;
        self.small_objects.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pow_classes_span_32_bytes_to_64_kib() {
        let config = PowConfig::default();

        assert_eq!(32, config.min_slot_size);
        assert_eq!(64 * 1024, config.max_slot_size());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let odd_slot = PowConfig {
            min_slot_size: 48,
            ..PowConfig::default()
        };
        assert!(odd_slot.validate().is_err());

        let no_classes = PowConfig {
            class_count: 0,
            ..PowConfig::default()
        };
        assert!(no_classes.validate().is_err());

        assert!(FreelistConfig::new(0).validate().is_err());
        assert!(LinearConfig::fixed(0).validate().is_err());
    }

    #[test]
    fn reserve_hints_scale_headroom() {
        assert_eq!(1, ReserveHint::Exact.multiplier());
        assert_eq!(4, ReserveHint::Half.multiplier());
        assert_eq!(8, ReserveHint::default().multiplier());
    }
}
