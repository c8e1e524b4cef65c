// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide sandbox ownership.
//!
//! The embedder creates one [`SandboxRuntime`] during single-threaded startup
//! and hands `&Sandbox` borrows to every consumer. The borrow checker keeps
//! consumers from outliving the runtime; a process-wide flag keeps a second
//! runtime from starting while one is live.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;
use nexus_vas::VirtualAddressSpace;

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::Sandbox;

static PROCESS_SANDBOX_LIVE: AtomicBool = AtomicBool::new(false);

/// Claim on the single process-wide sandbox slot; released on drop.
#[derive(Debug)]
struct ProcessSlot(());

impl ProcessSlot {
    fn claim() -> Result<Self> {
        if PROCESS_SANDBOX_LIVE.swap(true, Ordering::AcqRel) {
            return Err(SandboxError::AlreadyRunning);
        }
        Ok(Self(()))
    }
}

impl Drop for ProcessSlot {
    fn drop(&mut self) {
        PROCESS_SANDBOX_LIVE.store(false, Ordering::Release);
    }
}

/// Root object owning the process-wide sandbox.
#[derive(Debug)]
pub struct SandboxRuntime {
    // Boxed so field and constant addresses stay put when the runtime moves.
    sandbox: Box<Sandbox>,
    _slot: ProcessSlot,
}

impl SandboxRuntime {
    /// Reserves the process-wide sandbox. Startup must abort on error.
    pub fn start(vas: Arc<dyn VirtualAddressSpace>, config: &SandboxConfig) -> Result<Self> {
        let slot = ProcessSlot::claim()?;
        let mut sandbox = Box::new(Sandbox::new());
        sandbox.initialize(vas, config)?;
        info!(
            "sandbox: process-wide sandbox ready (partially reserved: {})",
            sandbox.is_partially_reserved()
        );
        Ok(Self { sandbox, _slot: slot })
    }

    /// Starts a runtime whose sandbox is disabled, for platforms that cannot
    /// support one.
    pub fn start_disabled() -> Result<Self> {
        let slot = ProcessSlot::claim()?;
        let mut sandbox = Box::new(Sandbox::new());
        sandbox.disable();
        info!("sandbox: process-wide sandbox disabled");
        Ok(Self { sandbox, _slot: slot })
    }

    /// Returns true while a runtime is live in this process.
    pub fn is_running() -> bool {
        PROCESS_SANDBOX_LIVE.load(Ordering::Acquire)
    }

    /// The process-wide sandbox.
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Sentinel address for zero-length backing stores.
    pub fn empty_backing_store_buffer(&self) -> usize {
        empty_backing_store_buffer(&self.sandbox)
    }

    /// Tears the sandbox down. Every consumer must have stopped.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for SandboxRuntime {
    fn drop(&mut self) {
        self.sandbox.tear_down();
    }
}

/// Sentinel address for zero-length backing stores inside `sandbox`, or 0
/// when sandboxed pointers are compiled out.
pub fn empty_backing_store_buffer(sandbox: &Sandbox) -> usize {
    if cfg!(feature = "sandboxed-pointers") {
        sandbox.constants().empty_backing_store_buffer()
    } else {
        0
    }
}
