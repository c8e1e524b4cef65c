// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sentinel values that generated code loads from a fixed address.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Address-stable sentinel constants owned by a sandbox.
///
/// Writes are expected only during single-threaded (re)initialization; the
/// atomic exists so the slot can be written through a shared reference at a
/// stable address, not for synchronization.
#[derive(Debug, Default)]
pub struct SandboxedPointerConstants {
    empty_backing_store_buffer: AtomicUsize,
}

impl SandboxedPointerConstants {
    /// Creates constants with every slot zeroed.
    pub const fn new() -> Self {
        Self { empty_backing_store_buffer: AtomicUsize::new(0) }
    }

    /// Canonical address used for zero-length backing stores.
    pub fn empty_backing_store_buffer(&self) -> usize {
        self.empty_backing_store_buffer.load(Ordering::Relaxed)
    }

    /// Address of the slot holding [`Self::empty_backing_store_buffer`].
    pub fn empty_backing_store_buffer_address(&self) -> usize {
        &self.empty_backing_store_buffer as *const AtomicUsize as usize
    }

    /// Replaces the empty backing store sentinel.
    pub fn set_empty_backing_store_buffer(&self, value: usize) {
        self.empty_backing_store_buffer.store(value, Ordering::Relaxed);
    }

    /// Zeroes every slot.
    pub fn reset(&self) {
        self.empty_backing_store_buffer.store(0, Ordering::Relaxed);
    }
}
