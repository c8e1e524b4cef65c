// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The sandbox region manager.
//!
//! ```text
//! +-  ~~~  -+----------------------------------------  ~~~  -+-  ~~~  -+
//! |  guard  |                 target_size                    |  guard  |
//! | (front) |   runtime heap, buffers, other sandboxed data  | (back)  |
//! +-  ~~~  -+----------------------------------------  ~~~  -+-  ~~~  -+
//!           ^                                                ^
//!           base                                             end
//!           < - - - - - - - - - - - size - - - - - - - - - - >
//! < - - - - - - - - - - - - - reservation_size - - - - - - - - - - - - >
//! ```
//!
//! A partially-reserved sandbox has no guard regions and a reservation
//! smaller than `size`; unrelated mappings may appear in
//! `[base + reservation_size, end)`.

use std::sync::Arc;

use log::{debug, error, info, warn};
use nexus_vas::{is_aligned, Permissions, VirtualAddressSpace};

use crate::config::SandboxConfig;
use crate::constants::SandboxedPointerConstants;
use crate::emulated::EmulatedSubspace;
use crate::error::{Result, SandboxError};
use crate::page_allocator::SandboxPageAllocator;

/// Reserved virtual address range holding sandboxed objects.
///
/// Lifecycle: [`Sandbox::new`] → [`Sandbox::initialize`] (or
/// [`Sandbox::disable`]) → [`Sandbox::tear_down`]. Lifecycle methods take
/// `&mut self`; every query takes `&self` and may be called from any thread
/// once initialization has finished.
#[derive(Debug, Default)]
pub struct Sandbox {
    base: usize,
    end: usize,
    size: usize,
    reservation_base: usize,
    reservation_size: usize,
    initialized: bool,
    disabled: bool,
    address_space: Option<Arc<dyn VirtualAddressSpace>>,
    page_allocator: Option<SandboxPageAllocator>,
    constants: SandboxedPointerConstants,
}

impl Sandbox {
    /// Creates an uninitialized sandbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the sandbox inside `vas`, with every size rounded up to its
    /// allocation granularity.
    ///
    /// Tries a full reservation with guard regions first. If that fails, or
    /// `vas` cannot carve subspaces, falls back to a partially-reserved
    /// sandbox sized by `config.fallback`. Returns
    /// [`SandboxError::AddressSpaceExhausted`] if no fallback could be
    /// reserved either; the sandbox then stays uninitialized.
    ///
    /// Panics if the sandbox is already initialized or disabled.
    pub fn initialize(&mut self, vas: Arc<dyn VirtualAddressSpace>, config: &SandboxConfig) -> Result<()> {
        assert!(!self.initialized, "sandbox initialized twice without tear_down");
        assert!(!self.disabled, "cannot initialize a disabled sandbox");
        let granularity = vas.allocation_granularity();
        let config = config.aligned_to(granularity)?;
        let alignment = config.alignment;

        if vas.can_allocate_subspaces() {
            let guard = if config.use_guard_regions { config.guard_region_size } else { 0 };
            if self.initialize_with_size(vas.as_ref(), config.target_size, guard, alignment) {
                return Ok(());
            }
        } else {
            debug!("sandbox: address space cannot allocate subspaces");
        }

        for size_to_reserve in config.fallback.candidates(config.target_size, granularity) {
            if self.initialize_as_partially_reserved(
                Arc::clone(&vas),
                config.target_size,
                size_to_reserve,
                alignment,
            ) {
                warn!(
                    "sandbox: degraded isolation, reserved {:#x} of {:#x} bytes at {:#x}",
                    self.reservation_size, self.size, self.base
                );
                return Ok(());
            }
        }

        error!(
            "sandbox: failed to reserve {:#x} bytes of virtual address space",
            config.target_size
        );
        Err(SandboxError::AddressSpaceExhausted { size: config.target_size })
    }

    /// Reserves `size` bytes plus `guard` bytes on either side as a subspace.
    fn initialize_with_size(
        &mut self,
        vas: &dyn VirtualAddressSpace,
        size: usize,
        guard: usize,
        alignment: usize,
    ) -> bool {
        debug_assert!(is_aligned(size, vas.allocation_granularity()));
        let Some(reservation_size) = guard.checked_mul(2).and_then(|g| g.checked_add(size)) else {
            return false;
        };
        let subspace = match vas.allocate_subspace(0, reservation_size, alignment, Permissions::READ_WRITE) {
            Ok(subspace) => subspace,
            Err(err) => {
                debug!("sandbox: full reservation of {reservation_size:#x} bytes failed: {err}");
                return false;
            }
        };
        let reservation_base = subspace.base();
        let base = reservation_base + guard;
        if guard > 0 {
            let guarded = subspace
                .allocate_guard_region(reservation_base, guard)
                .and_then(|()| subspace.allocate_guard_region(base + size, guard));
            if let Err(err) = guarded {
                debug!("sandbox: failed to place guard regions: {err}");
                return false;
            }
        }

        let space: Arc<dyn VirtualAddressSpace> = Arc::from(subspace);
        self.publish(space, base, size, reservation_base, reservation_size);
        info!("sandbox: reserved {size:#x} bytes at {base:#x} with {guard:#x}-byte guard regions");
        true
    }

    /// Reserves only `size_to_reserve` bytes and emulates a `size`-byte subspace
    /// on top of it.
    fn initialize_as_partially_reserved(
        &mut self,
        vas: Arc<dyn VirtualAddressSpace>,
        size: usize,
        size_to_reserve: usize,
        alignment: usize,
    ) -> bool {
        debug_assert!(size_to_reserve < size);
        let reservation_base =
            match vas.allocate_pages(0, size_to_reserve, alignment, Permissions::NO_ACCESS) {
                Ok(address) => address,
                Err(err) => {
                    debug!("sandbox: partial reservation of {size_to_reserve:#x} bytes failed: {err}");
                    return false;
                }
            };
        let space: Arc<dyn VirtualAddressSpace> =
            Arc::new(EmulatedSubspace::new(vas, reservation_base, size_to_reserve, size));
        self.publish(space, reservation_base, size, reservation_base, size_to_reserve);
        true
    }

    fn publish(
        &mut self,
        space: Arc<dyn VirtualAddressSpace>,
        base: usize,
        size: usize,
        reservation_base: usize,
        reservation_size: usize,
    ) {
        self.base = base;
        self.size = size;
        self.end = base + size;
        self.reservation_base = reservation_base;
        self.reservation_size = reservation_size;
        self.page_allocator = Some(SandboxPageAllocator::new(Arc::clone(&space), base, self.end));
        self.address_space = Some(space);
        self.initialized = true;
        self.constants.reset();
    }

    /// Marks the sandbox as unusable. Panics if already initialized.
    pub fn disable(&mut self) {
        assert!(!self.initialized, "cannot disable an initialized sandbox");
        self.disabled = true;
    }

    /// Releases the reservation and returns to the uninitialized state.
    ///
    /// No sandboxed references may be outstanding. Calling this on an
    /// uninitialized sandbox only clears the disabled flag.
    pub fn tear_down(&mut self) {
        if self.initialized {
            // The allocator shares the subspace; drop it first so the
            // reservation is released with the last handle.
            self.page_allocator = None;
            self.address_space = None;
            self.base = 0;
            self.end = 0;
            self.size = 0;
            self.reservation_base = 0;
            self.reservation_size = 0;
            self.initialized = false;
            info!("sandbox: torn down");
        }
        self.disabled = false;
        self.constants.reset();
    }

    /// Returns true once [`Self::initialize`] has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns true if [`Self::disable`] was called.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns true unless the sandbox was disabled.
    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    /// Returns true if the reservation backing the sandbox is smaller than
    /// its size, weakening isolation.
    pub fn is_partially_reserved(&self) -> bool {
        self.reservation_size < self.size
    }

    /// First address inside the sandbox (after the front guard region).
    pub fn base(&self) -> usize {
        self.base
    }

    /// Address right after the sandbox; equal to `base + size`.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Size of the sandbox in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Start of the reservation backing the sandbox.
    pub fn reservation_base(&self) -> usize {
        self.reservation_base
    }

    /// Size of the reservation: larger than [`Self::size`] with guard regions,
    /// smaller for a partially-reserved sandbox.
    pub fn reservation_size(&self) -> usize {
        self.reservation_size
    }

    /// Returns true if `address` lies inside `[base, end)`.
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end
    }

    /// Returns true if `ptr` points into the sandbox.
    #[inline]
    pub fn contains_ptr<T>(&self, ptr: *const T) -> bool {
        self.contains(ptr as usize)
    }

    /// Address subspace backing the sandbox, once initialized.
    pub fn address_space(&self) -> Option<&dyn VirtualAddressSpace> {
        self.address_space.as_deref()
    }

    /// Page allocator confined to the sandbox, once initialized.
    pub fn page_allocator(&self) -> Option<&SandboxPageAllocator> {
        self.page_allocator.as_ref()
    }

    /// Sentinel constants owned by this sandbox.
    pub fn constants(&self) -> &SandboxedPointerConstants {
        &self.constants
    }

    /// Address of the `base` field.
    pub fn base_address(&self) -> usize {
        &self.base as *const usize as usize
    }

    /// Address of the `end` field.
    pub fn end_address(&self) -> usize {
        &self.end as *const usize as usize
    }

    /// Address of the `size` field.
    pub fn size_address(&self) -> usize {
        &self.size as *const usize as usize
    }
}

#[cfg(test)]
impl Sandbox {
    /// Reserves exactly `size` bytes without fallback.
    pub(crate) fn initialize_for_testing(
        &mut self,
        vas: Arc<dyn VirtualAddressSpace>,
        size: usize,
        use_guard_regions: bool,
    ) -> bool {
        assert!(!self.initialized && !self.disabled);
        let defaults = SandboxConfig::default();
        let guard = if use_guard_regions { defaults.guard_region_size } else { 0 };
        let alignment = vas.allocation_granularity();
        self.initialize_with_size(vas.as_ref(), size, guard, alignment)
    }

    /// Builds a partially-reserved sandbox directly.
    pub(crate) fn initialize_as_partially_reserved_for_testing(
        &mut self,
        vas: Arc<dyn VirtualAddressSpace>,
        size: usize,
        size_to_reserve: usize,
    ) -> bool {
        assert!(!self.initialized && !self.disabled);
        let alignment = vas.allocation_granularity();
        self.initialize_as_partially_reserved(vas, size, size_to_reserve, alignment)
    }
}
