// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process-wide sandbox region manager
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/{lifecycle,invariants,runtime,compiled_out}.rs
//!
//! PUBLIC API:
//!   - Sandbox: reserve, query and tear down the sandbox region
//!   - SandboxPageAllocator: page allocation confined to the sandbox
//!   - SandboxedPointerConstants: address-stable sentinel values
//!   - SandboxConfig / FallbackPolicy: sizing and degraded-fallback policy
//!   - SandboxRuntime: root object owning the process-wide sandbox
//!
//! DEPENDENCIES:
//!   - nexus-vas: address space provider interface
//!   - parking_lot: allocator bookkeeping
//!   - rand: placement hints in partially-reserved sandboxes
//!
//! INVARIANTS:
//!   - Initialized: end == base + size
//!   - is_partially_reserved() <=> reservation_size < size
//!   - contains(a) <=> base <= a < end
//!   - Every page handed out by the page allocator lies inside [base, end)
//!
//! The runtime reserves one large region and keeps most of its objects in it,
//! referencing them by offset from `base`. A corrupted offset can then only
//! reach sandboxed memory. When the full reservation cannot be made the
//! sandbox degrades to a partially-reserved one and reports it through
//! [`Sandbox::is_partially_reserved`].

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod config;
pub mod constants;
pub mod emulated;
pub mod error;
pub mod page_allocator;
pub mod runtime;

#[cfg(feature = "sandbox")]
mod sandbox;

#[cfg(not(feature = "sandbox"))]
#[path = "disabled.rs"]
mod sandbox;

pub use config::{FallbackPolicy, SandboxConfig, DEFAULT_ADDRESS_BITS};
pub use constants::SandboxedPointerConstants;
pub use emulated::EmulatedSubspace;
pub use error::{AllocError, ConfigError, Result, SandboxError};
pub use page_allocator::SandboxPageAllocator;
pub use runtime::{empty_backing_store_buffer, SandboxRuntime};
pub use sandbox::Sandbox;

/// True when the real region manager is compiled in.
pub const SANDBOX_COMPILED_IN: bool = cfg!(feature = "sandbox");

/// True when sentinel constants are exposed to generated code.
pub const SANDBOXED_POINTERS_COMPILED_IN: bool = cfg!(feature = "sandboxed-pointers");
