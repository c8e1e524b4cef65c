// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sandbox sizing policy.
//!
//! ```text
//! +- ~~~ -+------------------------------- ~~~ -+- ~~~ -+
//! | guard |        target_size (nominal)         | guard |
//! +- ~~~ -+------------------------------- ~~~ -+- ~~~ -+
//!         ^ base                                 ^ end
//! ```
//!
//! Every size is derived from the number of usable virtual address bits so
//! the same layout scales down on platforms with smaller address spaces.

use nexus_vas::{is_aligned, round_down, round_up};
use serde::Deserialize;

use crate::error::{ConfigError, Result, SandboxError};

/// Usable user-space address bits on common 64-bit platforms.
pub const DEFAULT_ADDRESS_BITS: u32 = 47;

/// How a smaller reservation is chosen when the full one cannot be made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FallbackPolicy {
    /// Never fall back; a failed full reservation is fatal.
    Disabled,
    /// Try exactly one reservation of `size_to_reserve` bytes.
    Fixed {
        /// Bytes to actually reserve.
        size_to_reserve: usize,
    },
    /// Try half the target, then a quarter, ... while at least `minimum`.
    Halving {
        /// Smallest reservation worth attempting.
        minimum: usize,
    },
}

impl FallbackPolicy {
    /// Reservation sizes to attempt for a sandbox of `size` bytes, largest first.
    pub fn candidates(self, size: usize, granularity: usize) -> Vec<usize> {
        match self {
            Self::Disabled => Vec::new(),
            Self::Fixed { size_to_reserve } => {
                if size_to_reserve > 0 && size_to_reserve < size {
                    vec![size_to_reserve]
                } else {
                    Vec::new()
                }
            }
            Self::Halving { minimum } => {
                let floor = minimum.max(granularity).max(1);
                let mut sizes = Vec::new();
                let mut next = size / 2;
                while next >= floor {
                    let candidate = round_down(next, granularity);
                    if sizes.last() != Some(&candidate) {
                        sizes.push(candidate);
                    }
                    next /= 2;
                }
                sizes
            }
        }
    }
}

/// Parameters passed to [`crate::Sandbox::initialize`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    /// Nominal size of the sandbox in bytes.
    pub target_size: usize,
    /// Whether to flank the sandbox with inaccessible guard regions.
    pub use_guard_regions: bool,
    /// Size of each guard region.
    pub guard_region_size: usize,
    /// Alignment of the sandbox base.
    pub alignment: usize,
    /// Policy used when the full reservation fails.
    pub fallback: FallbackPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::for_address_bits(DEFAULT_ADDRESS_BITS)
    }
}

impl SandboxConfig {
    /// Derives a layout from the platform's usable virtual address bits.
    ///
    /// With 47 bits this yields a 1 TiB sandbox, 32 GiB guards, 4 GiB
    /// alignment and an 8 GiB minimum fallback reservation.
    pub fn for_address_bits(bits: u32) -> Self {
        let bits = bits.clamp(32, usize::BITS);
        let pow = |cap: u32, offset: u32| 1usize << cap.min(bits - offset);
        Self {
            target_size: pow(40, 7),
            use_guard_regions: true,
            guard_region_size: pow(35, 12),
            alignment: pow(32, 15),
            fallback: FallbackPolicy::Halving { minimum: pow(33, 10) },
        }
    }

    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> core::result::Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Total bytes reserved by a full reservation, guard regions included.
    pub fn reservation_size(&self) -> Option<usize> {
        if self.use_guard_regions {
            self.guard_region_size.checked_mul(2)?.checked_add(self.target_size)
        } else {
            Some(self.target_size)
        }
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason| Err(SandboxError::InvalidConfig(reason));
        if !self.target_size.is_power_of_two() {
            return invalid("target size must be a non-zero power of two");
        }
        if !self.alignment.is_power_of_two() {
            return invalid("alignment must be a power of two");
        }
        if self.use_guard_regions {
            if self.guard_region_size == 0 || !is_aligned(self.guard_region_size, self.alignment) {
                return invalid("guard region size must be a non-zero multiple of the alignment");
            }
            if self.reservation_size().is_none() {
                return invalid("reservation size overflows");
            }
        }
        match self.fallback {
            FallbackPolicy::Disabled => {}
            FallbackPolicy::Fixed { size_to_reserve } => {
                if size_to_reserve == 0 || size_to_reserve >= self.target_size {
                    return invalid("fallback reservation must be smaller than the target size");
                }
            }
            FallbackPolicy::Halving { minimum } => {
                if minimum == 0 {
                    return invalid("halving fallback needs a non-zero minimum");
                }
            }
        }
        Ok(())
    }

    /// Validates the configuration and rounds every size up to the
    /// power-of-two `granularity` of the provider it will be reserved in.
    pub fn aligned_to(&self, granularity: usize) -> Result<Self> {
        self.validate()?;
        let overflow =
            || SandboxError::InvalidConfig("sizes overflow when rounded to the allocation granularity");
        let alignment = round_up(self.alignment, granularity).ok_or_else(overflow)?;
        let mut aligned = Self {
            target_size: round_up(self.target_size, granularity).ok_or_else(overflow)?,
            guard_region_size: round_up(self.guard_region_size, alignment).ok_or_else(overflow)?,
            alignment,
            ..*self
        };
        if let FallbackPolicy::Fixed { size_to_reserve } = self.fallback {
            aligned.fallback = FallbackPolicy::Fixed {
                size_to_reserve: round_up(size_to_reserve, granularity).ok_or_else(overflow)?,
            };
        }
        aligned.validate()?;
        Ok(aligned)
    }
}
