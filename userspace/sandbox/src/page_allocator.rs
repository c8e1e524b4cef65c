// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page allocator confined to the sandbox.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use nexus_vas::{Permissions, VirtualAddressSpace};
use parking_lot::Mutex;

use crate::error::AllocError;

/// Page-granular allocator that only hands out memory inside `[base, end)`.
///
/// Backed by the sandbox's address subspace. A provider result outside the
/// bounds is released again and reported as [`AllocError::OutsideSandbox`].
pub struct SandboxPageAllocator {
    space: Arc<dyn VirtualAddressSpace>,
    base: usize,
    end: usize,
    /// Original sizes of allocations shrunk by [`Self::release_pages`].
    resized: Mutex<HashMap<usize, usize>>,
}

impl SandboxPageAllocator {
    pub(crate) fn new(space: Arc<dyn VirtualAddressSpace>, base: usize, end: usize) -> Self {
        Self { space, base, end, resized: Mutex::new(HashMap::new()) }
    }

    /// Granularity of allocation addresses.
    pub fn allocate_page_size(&self) -> usize {
        self.space.allocation_granularity()
    }

    /// Granularity of permission changes and sizes.
    pub fn commit_page_size(&self) -> usize {
        self.space.page_size()
    }

    /// Returns true if every byte of `[address, address + size)` is inside the sandbox.
    pub fn covers(&self, address: usize, size: usize) -> bool {
        address >= self.base && size <= self.end - self.base && address - self.base <= self.end - self.base - size
    }

    /// Allocates `size` bytes inside the sandbox.
    pub fn allocate_pages(
        &self,
        hint: usize,
        size: usize,
        alignment: usize,
        permissions: Permissions,
    ) -> Result<usize, AllocError> {
        let address = self.space.allocate_pages(hint, size, alignment, permissions)?;
        if !self.covers(address, size) {
            warn!("sandbox: provider returned {address:#x} (+{size:#x}) outside the sandbox");
            self.space.free_pages(address, size)?;
            return Err(AllocError::OutsideSandbox { address, size });
        }
        Ok(address)
    }

    /// Frees an allocation, including any tail given up by [`Self::release_pages`].
    pub fn free_pages(&self, address: usize, size: usize) -> Result<(), AllocError> {
        let original = self.resized.lock().remove(&address).unwrap_or(size);
        self.space.free_pages(address, original)?;
        Ok(())
    }

    /// Shrinks the allocation at `address` from `size` to `new_size` bytes.
    ///
    /// The tail is decommitted; the reservation is returned by the final
    /// [`Self::free_pages`].
    pub fn release_pages(&self, address: usize, size: usize, new_size: usize) -> Result<(), AllocError> {
        assert!(new_size < size, "release_pages must shrink the allocation");
        self.space.decommit_pages(address + new_size, size - new_size)?;
        self.resized.lock().entry(address).or_insert(size);
        Ok(())
    }

    /// Changes the permissions of pages inside one allocation.
    pub fn set_permissions(
        &self,
        address: usize,
        size: usize,
        permissions: Permissions,
    ) -> Result<(), AllocError> {
        self.space.set_page_permissions(address, size, permissions)?;
        Ok(())
    }

    /// Makes pages inaccessible without returning the reservation.
    pub fn decommit_pages(&self, address: usize, size: usize) -> Result<(), AllocError> {
        self.space.decommit_pages(address, size)?;
        Ok(())
    }
}

impl core::fmt::Debug for SandboxPageAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SandboxPageAllocator")
            .field("base", &format_args!("{:#x}", self.base))
            .field("end", &format_args!("{:#x}", self.end))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_vas::{HostAddressSpace, HostConfig, VasError};

    const PAGE: usize = 0x1000;
    const GRAN: usize = 0x1_0000;

    fn allocator_over(base: usize, end: usize) -> (Arc<HostAddressSpace>, SandboxPageAllocator) {
        let space = Arc::new(HostAddressSpace::new(HostConfig::default()));
        let allocator = SandboxPageAllocator::new(space.clone(), base, end);
        (space, allocator)
    }

    #[test]
    fn rejects_and_releases_out_of_bounds_results() {
        // The bounds exclude the provider's first-fit address.
        let (space, allocator) = allocator_over(0x1000_0000, 0x2000_0000);
        let err = allocator.allocate_pages(0, PAGE, GRAN, Permissions::READ_WRITE).unwrap_err();
        assert!(matches!(err, AllocError::OutsideSandbox { .. }));
        assert_eq!(space.reserved_bytes(), 0);
    }

    #[test]
    fn hinted_allocation_inside_bounds() {
        let (_space, allocator) = allocator_over(0x1000_0000, 0x2000_0000);
        let addr = allocator.allocate_pages(0x1800_0000, 2 * PAGE, GRAN, Permissions::READ).unwrap();
        assert_eq!(addr, 0x1800_0000);
        assert!(allocator.covers(addr, 2 * PAGE));
        allocator.free_pages(addr, 2 * PAGE).unwrap();
    }

    #[test]
    fn release_then_free_returns_original_extent() {
        let (space, allocator) = allocator_over(0x1000_0000, 0x2000_0000);
        let addr = allocator.allocate_pages(0x1000_0000, 4 * PAGE, GRAN, Permissions::READ_WRITE).unwrap();
        allocator.release_pages(addr, 4 * PAGE, PAGE).unwrap();
        assert_eq!(space.permissions_at(addr), Some(Permissions::READ_WRITE));
        assert_eq!(space.permissions_at(addr + PAGE), Some(Permissions::NO_ACCESS));
        allocator.free_pages(addr, PAGE).unwrap();
        assert_eq!(space.reserved_bytes(), 0);
    }

    #[test]
    fn provider_errors_surface() {
        let (_space, allocator) = allocator_over(0x1000_0000, 0x2000_0000);
        assert_eq!(
            allocator.allocate_pages(0, PAGE + 1, GRAN, Permissions::READ),
            Err(AllocError::Provider(VasError::Unaligned))
        );
        assert_eq!(allocator.commit_page_size(), PAGE);
        assert_eq!(allocator.allocate_page_size(), GRAN);
    }
}
