// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual address space provider interface
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/host_space.rs
//!
//! PUBLIC API:
//!   - VirtualAddressSpace trait: reserve/allocate/free/protect pages, carve subspaces
//!   - Permissions: page access bits
//!   - RegionAllocator: first-fit page-range allocator with hints
//!   - HostAddressSpace: bookkeeping-only backend (feature `backend-host`)
//!
//! DEPENDENCIES:
//!   - bitflags: permission sets
//!   - parking_lot: host backend locking
//!
//! INVARIANTS: Every range handed out lies inside the space that handed it out;
//! addresses and sizes are page aligned; subspaces release their parent
//! reservation when dropped.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use core::fmt;

use bitflags::bitflags;

pub mod region;
pub use region::RegionAllocator;

#[cfg(feature = "backend-host")]
pub mod host;
#[cfg(feature = "backend-host")]
pub use host::{HostAddressSpace, HostConfig};

/// Result alias for address space operations.
pub type Result<T> = core::result::Result<T, VasError>;

bitflags! {
    /// Access permissions applied to a range of pages.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct Permissions: u8 {
        /// Pages may be read.
        const READ = 1 << 0;
        /// Pages may be written.
        const WRITE = 1 << 1;
        /// Pages may be executed.
        const EXECUTE = 1 << 2;
    }
}

impl Permissions {
    /// Pages are reserved but inaccessible.
    pub const NO_ACCESS: Self = Self::empty();
    /// Readable and writable data pages.
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
    /// Readable and executable code pages.
    pub const READ_EXECUTE: Self = Self::READ.union(Self::EXECUTE);
}

/// Errors reported by address space providers.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum VasError {
    /// Address, size or alignment is not a multiple of the required granularity.
    #[error("address or size is not suitably aligned")]
    Unaligned,
    /// Arguments are malformed (zero size, non power-of-two alignment, ...).
    #[error("invalid arguments")]
    InvalidArgs,
    /// The range is not inside this address space.
    #[error("range lies outside the address space")]
    OutOfRange,
    /// No free range of the requested size is available.
    #[error("address space exhausted")]
    Exhausted,
    /// The range does not correspond to a live allocation of the right kind.
    #[error("range is not allocated")]
    NotAllocated,
    /// Requested permissions exceed the maximum of this space.
    #[error("permissions exceed the space maximum")]
    PermissionDenied,
    /// The provider does not implement this operation.
    #[error("operation unsupported by this address space")]
    Unsupported,
}

/// A contiguous range of virtual address space that pages and subspaces can
/// be carved from.
///
/// Implementations must be safe to call from multiple threads at once.
pub trait VirtualAddressSpace: Send + Sync + fmt::Debug {
    /// Granularity of page permissions and sizes.
    fn page_size(&self) -> usize;

    /// Granularity of allocation addresses.
    fn allocation_granularity(&self) -> usize;

    /// First address of the space.
    fn base(&self) -> usize;

    /// Size of the space in bytes.
    fn size(&self) -> usize;

    /// Upper bound for any permissions applied inside the space.
    fn max_permissions(&self) -> Permissions;

    /// Returns true if `address` lies inside the space.
    fn contains(&self, address: usize) -> bool {
        address >= self.base() && address - self.base() < self.size()
    }

    /// Allocates `size` bytes aligned to `alignment`, preferring `hint`.
    ///
    /// A zero hint lets the space choose. The hint is only honoured when the
    /// aligned range at the hint is free.
    fn allocate_pages(
        &self,
        hint: usize,
        size: usize,
        alignment: usize,
        permissions: Permissions,
    ) -> Result<usize>;

    /// Frees an allocation previously returned by [`Self::allocate_pages`].
    fn free_pages(&self, address: usize, size: usize) -> Result<()>;

    /// Changes the permissions of a page range inside one allocation.
    fn set_page_permissions(
        &self,
        address: usize,
        size: usize,
        permissions: Permissions,
    ) -> Result<()>;

    /// Makes a page range inaccessible while keeping it reserved.
    fn decommit_pages(&self, address: usize, size: usize) -> Result<()>;

    /// Reserves an inaccessible range at exactly `address`.
    fn allocate_guard_region(&self, address: usize, size: usize) -> Result<()>;

    /// Releases a guard region previously placed at `address`.
    fn free_guard_region(&self, address: usize, size: usize) -> Result<()>;

    /// Returns true if [`Self::allocate_subspace`] is supported.
    fn can_allocate_subspaces(&self) -> bool;

    /// Reserves a child space of `size` bytes. Dropping the child releases
    /// the reservation.
    fn allocate_subspace(
        &self,
        hint: usize,
        size: usize,
        alignment: usize,
        max_permissions: Permissions,
    ) -> Result<Box<dyn VirtualAddressSpace>>;
}

/// Rounds `value` down to a multiple of the power-of-two `align`.
pub const fn round_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of the power-of-two `align`.
pub fn round_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| round_down(v, align))
}

/// Returns true if `value` is a multiple of the power-of-two `align`.
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}
