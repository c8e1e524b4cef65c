// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Stand-in used when the `sandbox` feature is compiled out.
//!
//! Mirrors the interface of the real region manager so call sites need no
//! conditional compilation: nothing is reserved, `contains` is always false
//! and every accessor reports an empty sandbox.

use std::sync::Arc;

use log::debug;
use nexus_vas::VirtualAddressSpace;

use crate::config::SandboxConfig;
use crate::constants::SandboxedPointerConstants;
use crate::error::Result;
use crate::page_allocator::SandboxPageAllocator;

/// No-op sandbox.
#[derive(Debug, Default)]
pub struct Sandbox {
    constants: SandboxedPointerConstants,
}

impl Sandbox {
    /// Creates the no-op sandbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Does nothing; the sandbox stays uninitialized.
    pub fn initialize(&mut self, _vas: Arc<dyn VirtualAddressSpace>, _config: &SandboxConfig) -> Result<()> {
        debug!("sandbox: compiled out, skipping reservation");
        Ok(())
    }

    /// Does nothing; the sandbox is always disabled.
    pub fn disable(&mut self) {}

    /// Resets the sentinel constants.
    pub fn tear_down(&mut self) {
        self.constants.reset();
    }

    /// Always false.
    pub fn is_initialized(&self) -> bool {
        false
    }

    /// Always true: a compiled-out sandbox is never usable.
    pub fn is_disabled(&self) -> bool {
        true
    }

    /// Always false.
    pub fn is_enabled(&self) -> bool {
        false
    }

    /// Always false.
    pub fn is_partially_reserved(&self) -> bool {
        false
    }

    /// Always 0.
    pub fn base(&self) -> usize {
        0
    }

    /// Always 0.
    pub fn end(&self) -> usize {
        0
    }

    /// Always 0.
    pub fn size(&self) -> usize {
        0
    }

    /// Always 0.
    pub fn reservation_base(&self) -> usize {
        0
    }

    /// Always 0.
    pub fn reservation_size(&self) -> usize {
        0
    }

    /// Always false.
    #[inline]
    pub fn contains(&self, _address: usize) -> bool {
        false
    }

    /// Always false.
    #[inline]
    pub fn contains_ptr<T>(&self, _ptr: *const T) -> bool {
        false
    }

    /// Always `None`.
    pub fn address_space(&self) -> Option<&dyn VirtualAddressSpace> {
        None
    }

    /// Always `None`.
    pub fn page_allocator(&self) -> Option<&SandboxPageAllocator> {
        None
    }

    /// Zeroed constants.
    pub fn constants(&self) -> &SandboxedPointerConstants {
        &self.constants
    }

    /// Always 0.
    pub fn base_address(&self) -> usize {
        0
    }

    /// Always 0.
    pub fn end_address(&self) -> usize {
        0
    }

    /// Always 0.
    pub fn size_address(&self) -> usize {
        0
    }
}
