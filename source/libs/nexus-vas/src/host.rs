// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-first address space backend.
//!
//! Performs the bookkeeping of a real virtual address space (reservations,
//! permissions, guard regions, subspaces) without mapping any memory, so the
//! sandbox can be exercised on the host with terabyte-sized layouts. An
//! optional reservation limit simulates address-space exhaustion.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{is_aligned, Permissions, RegionAllocator, Result, VasError, VirtualAddressSpace};

/// Parameters of a root [`HostAddressSpace`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostConfig {
    /// First usable address.
    pub base: usize,
    /// Size of the usable range.
    pub size: usize,
    /// Page size in bytes.
    pub page_size: usize,
    /// Allocation granularity in bytes.
    pub allocation_granularity: usize,
    /// Whether [`VirtualAddressSpace::allocate_subspace`] is supported.
    pub subspaces: bool,
    /// Upper bound on the total bytes reserved from the root space.
    pub reservation_limit: Option<usize>,
}

impl Default for HostConfig {
    /// A 47-bit user address space with 4 KiB pages and 64 KiB granularity.
    fn default() -> Self {
        Self {
            base: 0x1_0000,
            size: (1 << 47) - 0x1_0000,
            page_size: 0x1000,
            allocation_granularity: 0x1_0000,
            subspaces: true,
            reservation_limit: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Pages,
    Guard,
    Subspace,
}

/// Mutable bookkeeping of one space.
#[derive(Debug)]
struct Arena {
    regions: RegionAllocator<Kind>,
    /// Non-overlapping permission spans: start -> (len, permissions).
    protections: BTreeMap<usize, (usize, Permissions)>,
    limit: Option<usize>,
}

impl Arena {
    fn new(base: usize, size: usize, page_size: usize, limit: Option<usize>) -> Self {
        Self {
            regions: RegionAllocator::new(base, size, page_size),
            protections: BTreeMap::new(),
            limit,
        }
    }

    fn reserve(&mut self, hint: usize, size: usize, alignment: usize, kind: Kind) -> Result<usize> {
        if let Some(limit) = self.limit {
            if self.regions.allocated().saturating_add(size) > limit {
                return Err(VasError::Exhausted);
            }
        }
        self.regions.allocate(hint, size, alignment, kind).ok_or(VasError::Exhausted)
    }

    fn reserve_at(&mut self, address: usize, size: usize, kind: Kind) -> Result<()> {
        if !self.regions.contains_range(address, size) {
            return Err(VasError::OutOfRange);
        }
        if let Some(limit) = self.limit {
            if self.regions.allocated().saturating_add(size) > limit {
                return Err(VasError::Exhausted);
            }
        }
        if self.regions.allocate_at(address, size, kind) {
            Ok(())
        } else {
            Err(VasError::Exhausted)
        }
    }

    fn release(&mut self, address: usize, size: usize, kind: Kind) -> Result<()> {
        match self.regions.find(address) {
            Some((start, len, found)) if start == address && len == size && found == kind => {}
            _ => return Err(VasError::NotAllocated),
        }
        self.regions.free(address);
        self.clear_protections(address, size);
        Ok(())
    }

    /// Checks that `[address, address + size)` lies inside one page allocation.
    fn covering_pages(&self, address: usize, size: usize) -> Result<()> {
        match self.regions.find_covering(address, size) {
            Some((_, _, Kind::Pages)) => Ok(()),
            _ => Err(VasError::NotAllocated),
        }
    }

    fn protect(&mut self, address: usize, size: usize, permissions: Permissions) {
        self.clear_protections(address, size);
        self.protections.insert(address, (size, permissions));
    }

    /// Removes spans inside `[address, address + size)`, trimming spans that
    /// straddle either edge.
    fn clear_protections(&mut self, address: usize, size: usize) {
        let end = address + size;
        let mut touched: Vec<(usize, usize, Permissions)> = Vec::new();
        if let Some((&start, &(len, perms))) = self.protections.range(..address).next_back() {
            if start + len > address {
                touched.push((start, len, perms));
            }
        }
        touched.extend(self.protections.range(address..end).map(|(&s, &(l, p))| (s, l, p)));
        for (start, len, perms) in touched {
            self.protections.remove(&start);
            if start < address {
                self.protections.insert(start, (address - start, perms));
            }
            if start + len > end {
                self.protections.insert(end, (start + len - end, perms));
            }
        }
    }

    fn permissions_at(&self, address: usize) -> Option<Permissions> {
        let (&start, &(len, perms)) = self.protections.range(..=address).next_back()?;
        (address - start < len).then_some(perms)
    }
}

/// Bookkeeping-only [`VirtualAddressSpace`].
///
/// Root spaces are created with [`HostAddressSpace::new`]; subspaces come from
/// [`VirtualAddressSpace::allocate_subspace`] and release their reservation in
/// the parent on drop.
pub struct HostAddressSpace {
    arena: Arc<Mutex<Arena>>,
    parent: Option<Arc<Mutex<Arena>>>,
    base: usize,
    size: usize,
    page_size: usize,
    allocation_granularity: usize,
    max_permissions: Permissions,
    subspaces: bool,
}

impl HostAddressSpace {
    /// Creates a root space. Panics if the geometry is not page aligned.
    pub fn new(config: HostConfig) -> Self {
        assert!(config.page_size.is_power_of_two(), "page size must be a power of two");
        assert!(
            config.allocation_granularity.is_power_of_two()
                && is_aligned(config.allocation_granularity, config.page_size),
            "allocation granularity must be a power-of-two multiple of the page size"
        );
        assert!(
            is_aligned(config.base, config.allocation_granularity)
                && is_aligned(config.size, config.page_size),
            "host space geometry must be aligned"
        );
        Self {
            arena: Arc::new(Mutex::new(Arena::new(
                config.base,
                config.size,
                config.page_size,
                config.reservation_limit,
            ))),
            parent: None,
            base: config.base,
            size: config.size,
            page_size: config.page_size,
            allocation_granularity: config.allocation_granularity,
            max_permissions: Permissions::all(),
            subspaces: config.subspaces,
        }
    }

    /// Permissions currently recorded for the page containing `address`.
    pub fn permissions_at(&self, address: usize) -> Option<Permissions> {
        self.arena.lock().permissions_at(address)
    }

    /// Total bytes currently reserved directly from this space.
    pub fn reserved_bytes(&self) -> usize {
        self.arena.lock().regions.allocated()
    }

    fn check_range(&self, address: usize, size: usize) -> Result<()> {
        if size == 0 {
            return Err(VasError::InvalidArgs);
        }
        if !is_aligned(address, self.page_size) || !is_aligned(size, self.page_size) {
            return Err(VasError::Unaligned);
        }
        if address < self.base || size > self.size || address - self.base > self.size - size {
            return Err(VasError::OutOfRange);
        }
        Ok(())
    }

    fn check_alignment(&self, alignment: usize) -> Result<()> {
        if !alignment.is_power_of_two() {
            return Err(VasError::InvalidArgs);
        }
        if !is_aligned(alignment, self.allocation_granularity) {
            return Err(VasError::Unaligned);
        }
        Ok(())
    }

    fn check_permissions(&self, permissions: Permissions) -> Result<()> {
        if self.max_permissions.contains(permissions) {
            Ok(())
        } else {
            Err(VasError::PermissionDenied)
        }
    }
}

impl fmt::Debug for HostAddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAddressSpace")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("subspace", &self.parent.is_some())
            .finish()
    }
}

impl VirtualAddressSpace for HostAddressSpace {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocation_granularity(&self) -> usize {
        self.allocation_granularity
    }

    fn base(&self) -> usize {
        self.base
    }

    fn size(&self) -> usize {
        self.size
    }

    fn max_permissions(&self) -> Permissions {
        self.max_permissions
    }

    fn allocate_pages(
        &self,
        hint: usize,
        size: usize,
        alignment: usize,
        permissions: Permissions,
    ) -> Result<usize> {
        self.check_alignment(alignment)?;
        self.check_permissions(permissions)?;
        if size == 0 {
            return Err(VasError::InvalidArgs);
        }
        if !is_aligned(size, self.page_size) {
            return Err(VasError::Unaligned);
        }
        let mut arena = self.arena.lock();
        let address = arena.reserve(hint, size, alignment, Kind::Pages)?;
        arena.protect(address, size, permissions);
        Ok(address)
    }

    fn free_pages(&self, address: usize, size: usize) -> Result<()> {
        self.check_range(address, size)?;
        self.arena.lock().release(address, size, Kind::Pages)
    }

    fn set_page_permissions(
        &self,
        address: usize,
        size: usize,
        permissions: Permissions,
    ) -> Result<()> {
        self.check_range(address, size)?;
        self.check_permissions(permissions)?;
        let mut arena = self.arena.lock();
        arena.covering_pages(address, size)?;
        arena.protect(address, size, permissions);
        Ok(())
    }

    fn decommit_pages(&self, address: usize, size: usize) -> Result<()> {
        self.check_range(address, size)?;
        let mut arena = self.arena.lock();
        arena.covering_pages(address, size)?;
        arena.protect(address, size, Permissions::NO_ACCESS);
        Ok(())
    }

    fn allocate_guard_region(&self, address: usize, size: usize) -> Result<()> {
        self.check_range(address, size)?;
        let mut arena = self.arena.lock();
        arena.reserve_at(address, size, Kind::Guard)?;
        arena.protect(address, size, Permissions::NO_ACCESS);
        Ok(())
    }

    fn free_guard_region(&self, address: usize, size: usize) -> Result<()> {
        self.check_range(address, size)?;
        self.arena.lock().release(address, size, Kind::Guard)
    }

    fn can_allocate_subspaces(&self) -> bool {
        self.subspaces
    }

    fn allocate_subspace(
        &self,
        hint: usize,
        size: usize,
        alignment: usize,
        max_permissions: Permissions,
    ) -> Result<Box<dyn VirtualAddressSpace>> {
        if !self.subspaces {
            return Err(VasError::Unsupported);
        }
        self.check_alignment(alignment)?;
        self.check_permissions(max_permissions)?;
        if size == 0 {
            return Err(VasError::InvalidArgs);
        }
        if !is_aligned(size, self.allocation_granularity) {
            return Err(VasError::Unaligned);
        }
        let mut arena = self.arena.lock();
        let base = arena.reserve(hint, size, alignment, Kind::Subspace)?;
        arena.protect(base, size, Permissions::NO_ACCESS);
        drop(arena);
        Ok(Box::new(Self {
            arena: Arc::new(Mutex::new(Arena::new(base, size, self.page_size, None))),
            parent: Some(Arc::clone(&self.arena)),
            base,
            size,
            page_size: self.page_size,
            allocation_granularity: self.allocation_granularity,
            max_permissions,
            subspaces: true,
        }))
    }
}

impl Drop for HostAddressSpace {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.take() {
            // Only fails if the parent bookkeeping was corrupted.
            let released = parent.lock().release(self.base, self.size, Kind::Subspace);
            debug_assert!(released.is_ok(), "subspace reservation vanished from its parent");
        }
    }
}
