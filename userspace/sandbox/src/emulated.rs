// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address subspace backed by a reservation smaller than its advertised size.
//!
//! ```text
//! base                base + mapped_size                       base + size
//!  +-------------------+------------------------------------------+
//!  |  mapped (owned)   |  unmapped (borrowed from parent on use)  |
//!  +-------------------+------------------------------------------+
//! ```
//!
//! Allocations in the mapped part come from a private region allocator.
//! Allocations in the unmapped part are requested from the parent space with
//! address hints and kept only if they land inside the unmapped part. Other
//! mappings in the process may occupy the unmapped part.

use std::fmt;
use std::sync::Arc;

use log::{debug, error};
use nexus_vas::{
    is_aligned, round_down, round_up, Permissions, RegionAllocator, Result, VasError,
    VirtualAddressSpace,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Attempts made to place an allocation in the unmapped part.
const MAX_UNMAPPED_ATTEMPTS: usize = 10;

/// Subspace emulated on top of a partial reservation in `parent`.
pub struct EmulatedSubspace {
    parent: Arc<dyn VirtualAddressSpace>,
    base: usize,
    size: usize,
    mapped_size: usize,
    regions: Mutex<RegionAllocator>,
    rng: Mutex<StdRng>,
}

impl EmulatedSubspace {
    /// Wraps the reservation `[base, base + mapped_size)` already taken from
    /// `parent`, advertising `size` bytes. The reservation is freed on drop.
    pub fn new(
        parent: Arc<dyn VirtualAddressSpace>,
        base: usize,
        mapped_size: usize,
        size: usize,
    ) -> Self {
        assert!(mapped_size > 0 && mapped_size <= size, "mapped part must fit the subspace");
        let page_size = parent.page_size();
        Self {
            regions: Mutex::new(RegionAllocator::new(base, mapped_size, page_size)),
            rng: Mutex::new(StdRng::from_entropy()),
            parent,
            base,
            size,
            mapped_size,
        }
    }

    /// Bytes actually reserved from the parent.
    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    fn unmapped_base(&self) -> usize {
        self.base + self.mapped_size
    }

    fn unmapped_size(&self) -> usize {
        self.size - self.mapped_size
    }

    fn mapped_contains(&self, address: usize, size: usize) -> bool {
        range_within(address, size, self.base, self.mapped_size)
    }

    fn unmapped_contains(&self, address: usize, size: usize) -> bool {
        range_within(address, size, self.unmapped_base(), self.unmapped_size())
    }

    /// Requests larger than half the unmapped part are unlikely to be placed
    /// by hint and are not attempted.
    fn usable_for_unmapped(&self, size: usize) -> bool {
        size <= self.unmapped_size() / 2
    }

    fn random_unmapped_hint(&self, size: usize, alignment: usize) -> Option<usize> {
        let low = round_up(self.unmapped_base(), alignment)?;
        let high = round_down(self.unmapped_base() + self.unmapped_size().checked_sub(size)?, alignment);
        if low > high {
            return None;
        }
        let pick = self.rng.lock().gen_range(low..=high);
        Some(round_down(pick, alignment).max(low))
    }

    fn allocate_unmapped(
        &self,
        mut hint: usize,
        size: usize,
        alignment: usize,
        permissions: Permissions,
    ) -> Result<usize> {
        if !self.usable_for_unmapped(size) {
            return Err(VasError::Exhausted);
        }
        for _ in 0..MAX_UNMAPPED_ATTEMPTS {
            if hint == 0 || !self.unmapped_contains(hint, size) || !is_aligned(hint, alignment) {
                hint = self.random_unmapped_hint(size, alignment).ok_or(VasError::Exhausted)?;
            }
            match self.parent.allocate_pages(hint, size, alignment, permissions) {
                Ok(address) if self.unmapped_contains(address, size) => return Ok(address),
                Ok(address) => {
                    debug!("sandbox: parent placed {address:#x} outside the unmapped part; retrying");
                    self.parent.free_pages(address, size)?;
                }
                Err(VasError::Exhausted) => {}
                Err(err) => return Err(err),
            }
            hint = 0;
        }
        Err(VasError::Exhausted)
    }
}

fn range_within(address: usize, size: usize, start: usize, len: usize) -> bool {
    address >= start && size <= len && address - start <= len - size
}

impl fmt::Debug for EmulatedSubspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedSubspace")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("mapped_size", &format_args!("{:#x}", self.mapped_size))
            .finish()
    }
}

impl VirtualAddressSpace for EmulatedSubspace {
    fn page_size(&self) -> usize {
        self.parent.page_size()
    }

    fn allocation_granularity(&self) -> usize {
        self.parent.allocation_granularity()
    }

    fn base(&self) -> usize {
        self.base
    }

    fn size(&self) -> usize {
        self.size
    }

    fn max_permissions(&self) -> Permissions {
        self.parent.max_permissions()
    }

    fn allocate_pages(
        &self,
        hint: usize,
        size: usize,
        alignment: usize,
        permissions: Permissions,
    ) -> Result<usize> {
        if size == 0 || !alignment.is_power_of_two() {
            return Err(VasError::InvalidArgs);
        }
        if !is_aligned(size, self.page_size()) || !is_aligned(alignment, self.allocation_granularity()) {
            return Err(VasError::Unaligned);
        }
        if hint == 0 || self.mapped_contains(hint, size) {
            let mut regions = self.regions.lock();
            if let Some(address) = regions.allocate(hint, size, alignment, ()) {
                match self.parent.set_page_permissions(address, size, permissions) {
                    Ok(()) => return Ok(address),
                    Err(VasError::PermissionDenied) => {
                        regions.free(address);
                        return Err(VasError::PermissionDenied);
                    }
                    Err(_) => {
                        regions.free(address);
                    }
                }
            }
        }
        self.allocate_unmapped(hint, size, alignment, permissions)
    }

    fn free_pages(&self, address: usize, size: usize) -> Result<()> {
        if self.mapped_contains(address, size) {
            let mut regions = self.regions.lock();
            match regions.find(address) {
                Some((start, len, ())) if start == address && len == size => {}
                _ => return Err(VasError::NotAllocated),
            }
            self.parent.set_page_permissions(address, size, Permissions::NO_ACCESS)?;
            regions.free(address);
            Ok(())
        } else if self.unmapped_contains(address, size) {
            self.parent.free_pages(address, size)
        } else {
            Err(VasError::OutOfRange)
        }
    }

    fn set_page_permissions(
        &self,
        address: usize,
        size: usize,
        permissions: Permissions,
    ) -> Result<()> {
        if self.mapped_contains(address, size) {
            if self.regions.lock().find_covering(address, size).is_none() {
                return Err(VasError::NotAllocated);
            }
        } else if !self.unmapped_contains(address, size) {
            return Err(VasError::OutOfRange);
        }
        self.parent.set_page_permissions(address, size, permissions)
    }

    fn decommit_pages(&self, address: usize, size: usize) -> Result<()> {
        if self.mapped_contains(address, size) {
            if self.regions.lock().find_covering(address, size).is_none() {
                return Err(VasError::NotAllocated);
            }
            self.parent.set_page_permissions(address, size, Permissions::NO_ACCESS)
        } else if self.unmapped_contains(address, size) {
            self.parent.decommit_pages(address, size)
        } else {
            Err(VasError::OutOfRange)
        }
    }

    fn allocate_guard_region(&self, address: usize, size: usize) -> Result<()> {
        if self.mapped_contains(address, size) {
            if self.regions.lock().allocate_at(address, size, ()) {
                Ok(())
            } else {
                Err(VasError::Exhausted)
            }
        } else if self.unmapped_contains(address, size) {
            self.parent.allocate_guard_region(address, size)
        } else {
            Err(VasError::OutOfRange)
        }
    }

    fn free_guard_region(&self, address: usize, size: usize) -> Result<()> {
        if self.mapped_contains(address, size) {
            match self.regions.lock().free(address) {
                Some((len, ())) if len == size => Ok(()),
                _ => Err(VasError::NotAllocated),
            }
        } else if self.unmapped_contains(address, size) {
            self.parent.free_guard_region(address, size)
        } else {
            Err(VasError::OutOfRange)
        }
    }

    fn can_allocate_subspaces(&self) -> bool {
        false
    }

    fn allocate_subspace(
        &self,
        _hint: usize,
        _size: usize,
        _alignment: usize,
        _max_permissions: Permissions,
    ) -> Result<Box<dyn VirtualAddressSpace>> {
        Err(VasError::Unsupported)
    }
}

impl Drop for EmulatedSubspace {
    fn drop(&mut self) {
        if let Err(err) = self.parent.free_pages(self.base, self.mapped_size) {
            error!("sandbox: failed to release partial reservation at {:#x}: {err}", self.base);
        }
    }
}
