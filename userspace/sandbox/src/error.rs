// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types for sandbox setup, configuration and page allocation.

use nexus_vas::VasError;

/// Result alias for sandbox lifecycle operations.
pub type Result<T> = core::result::Result<T, SandboxError>;

/// Errors produced while bringing up the sandbox.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// Neither the full reservation nor any degraded fallback could be
    /// reserved. Startup must be aborted.
    #[error("virtual address space exhausted: cannot back a sandbox of {size:#x} bytes")]
    AddressSpaceExhausted {
        /// Nominal sandbox size that was requested.
        size: usize,
    },
    /// The configuration is inconsistent with itself or the provider.
    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(&'static str),
    /// A process-wide sandbox runtime is already live.
    #[error("process-wide sandbox already running")]
    AlreadyRunning,
}

/// Errors produced while loading a [`crate::SandboxConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("failed to parse sandbox config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The parsed configuration failed validation.
    #[error(transparent)]
    Invalid(#[from] SandboxError),
}

/// Errors reported by [`crate::SandboxPageAllocator`].
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The provider returned memory outside the sandbox; it was released.
    #[error("allocation at {address:#x} (+{size:#x}) lies outside the sandbox")]
    OutsideSandbox {
        /// Address the provider returned.
        address: usize,
        /// Size of the rejected allocation.
        size: usize,
    },
    /// The provider could not satisfy the request.
    #[error("page provider: {0}")]
    Provider(#[from] VasError),
}
