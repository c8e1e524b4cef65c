// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for sandbox initialization, fallback and teardown
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 15 integration tests
//!
//! TEST_SCOPE:
//!   - Full reservation with guard regions
//!   - Degraded (partially-reserved) fallback under address-space pressure
//!   - Address-space exhaustion
//!   - Sentinel constants lifecycle
//!   - Disable / teardown / re-initialize contract
//!
//! TEST_SCENARIOS:
//!   - full_reservation_with_guards(): 1 GiB target, enough space
//!   - fallback_when_only_half_fits(): only 512 MiB reservable
//!   - unaligned_fixed_fallback_is_rounded_up(): fallback size off the granularity
//!   - fallback_without_subspace_support(): provider cannot carve subspaces
//!   - exhaustion_is_reported(): nothing reservable
//!   - sentinel_constants_lifecycle(): 0 -> X -> reset -> 0
//!   - teardown_then_reinitialize(): same parameters succeed twice
//!   - full_sandbox_runs_out_of_pages(): allocation failure inside a healthy sandbox
//!   - disable_before_initialize(): flags flip
//!   - disable_after_initialize_panics(): fatal contract check
//!   - double_initialize_panics(): fatal contract check
//!
//! DEPENDENCIES:
//!   - nexus_vas::HostAddressSpace: bookkeeping provider
#![cfg(feature = "sandbox")]

use std::sync::Arc;

use nexus_sandbox::{AllocError, FallbackPolicy, Sandbox, SandboxConfig, SandboxError};
use nexus_vas::{HostAddressSpace, HostConfig, Permissions, VasError, VirtualAddressSpace};

const GIB: usize = 1 << 30;
const MIB: usize = 1 << 20;
const KIB: usize = 1 << 10;
const GUARD: usize = 64 * MIB;

fn config() -> SandboxConfig {
    SandboxConfig {
        target_size: GIB,
        use_guard_regions: true,
        guard_region_size: GUARD,
        alignment: 64 * MIB,
        fallback: FallbackPolicy::Halving { minimum: 64 * MIB },
    }
}

fn host(limit: Option<usize>) -> Arc<HostAddressSpace> {
    Arc::new(HostAddressSpace::new(HostConfig { reservation_limit: limit, ..HostConfig::default() }))
}

fn assert_layout_invariants(sandbox: &Sandbox) {
    assert!(sandbox.is_initialized());
    assert_eq!(sandbox.end(), sandbox.base() + sandbox.size());
    assert_eq!(sandbox.is_partially_reserved(), sandbox.reservation_size() < sandbox.size());
    assert!(sandbox.contains(sandbox.base()));
    assert!(sandbox.contains(sandbox.end() - 1));
    assert!(!sandbox.contains(sandbox.base() - 1));
    assert!(!sandbox.contains(sandbox.end()));
}

#[test]
fn full_reservation_with_guards() {
    let vas = host(None);
    let mut sandbox = Sandbox::new();
    sandbox.initialize(vas.clone(), &config()).expect("enough address space");
    assert_layout_invariants(&sandbox);
    assert!(!sandbox.is_partially_reserved());
    assert_eq!(sandbox.size(), GIB);
    assert_eq!(sandbox.reservation_size(), GIB + 2 * GUARD);
    assert_eq!(sandbox.base() - sandbox.reservation_base(), GUARD);
    assert_eq!(sandbox.base() % (64 * MIB), 0);
    assert_eq!(vas.reserved_bytes(), GIB + 2 * GUARD);
}

#[test]
fn fallback_when_only_half_fits() {
    let vas = host(Some(512 * MIB));
    let mut sandbox = Sandbox::new();
    sandbox.initialize(vas, &config()).expect("degraded fallback");
    assert_layout_invariants(&sandbox);
    assert!(sandbox.is_partially_reserved());
    assert_eq!(sandbox.size(), GIB);
    assert_eq!(sandbox.reservation_size(), 512 * MIB);
    assert_eq!(sandbox.reservation_base(), sandbox.base());
}

#[test]
fn fixed_fallback_size_is_used() {
    let vas = host(Some(512 * MIB));
    let mut cfg = config();
    cfg.fallback = FallbackPolicy::Fixed { size_to_reserve: 128 * MIB };
    let mut sandbox = Sandbox::new();
    sandbox.initialize(vas, &cfg).expect("degraded fallback");
    assert_eq!(sandbox.reservation_size(), 128 * MIB);
    assert!(sandbox.is_partially_reserved());
}

#[test]
fn unaligned_fixed_fallback_is_rounded_up() {
    let vas = host(Some(512 * MIB));
    let mut cfg = config();
    cfg.fallback = FallbackPolicy::Fixed { size_to_reserve: 256 * MIB + 4 * KIB };
    let mut sandbox = Sandbox::new();
    sandbox.initialize(vas.clone(), &cfg).expect("degraded fallback");
    assert_layout_invariants(&sandbox);
    assert!(sandbox.is_partially_reserved());
    assert_eq!(sandbox.reservation_size(), 256 * MIB + 64 * KIB);
    assert_eq!(vas.reserved_bytes(), 256 * MIB + 64 * KIB);
}

#[test]
fn fallback_without_subspace_support() {
    let vas = Arc::new(HostAddressSpace::new(HostConfig { subspaces: false, ..HostConfig::default() }));
    let mut sandbox = Sandbox::new();
    sandbox.initialize(vas, &config()).expect("degraded fallback");
    assert!(sandbox.is_partially_reserved());
    assert_eq!(sandbox.reservation_size(), 512 * MIB);
    assert!(!sandbox.address_space().expect("initialized").can_allocate_subspaces());
}

#[test]
fn exhaustion_is_reported() {
    let vas = host(Some(32 * MIB));
    let mut sandbox = Sandbox::new();
    assert_eq!(
        sandbox.initialize(vas.clone(), &config()),
        Err(SandboxError::AddressSpaceExhausted { size: GIB })
    );
    assert!(!sandbox.is_initialized());
    assert!(sandbox.page_allocator().is_none());
    assert_eq!(vas.reserved_bytes(), 0);
}

#[test]
fn disabled_fallback_turns_pressure_into_exhaustion() {
    let vas = host(Some(512 * MIB));
    let mut cfg = config();
    cfg.fallback = FallbackPolicy::Disabled;
    let mut sandbox = Sandbox::new();
    assert!(matches!(
        sandbox.initialize(vas, &cfg),
        Err(SandboxError::AddressSpaceExhausted { .. })
    ));
}

#[test]
fn invalid_config_is_rejected() {
    let mut cfg = config();
    cfg.target_size = 3 * GIB;
    let mut sandbox = Sandbox::new();
    assert!(matches!(
        sandbox.initialize(host(None), &cfg),
        Err(SandboxError::InvalidConfig(_))
    ));
    assert!(!sandbox.is_initialized());
}

#[test]
fn sentinel_constants_lifecycle() {
    let mut sandbox = Sandbox::new();
    sandbox.initialize(host(None), &config()).expect("initialized");
    let constants = sandbox.constants();
    assert_eq!(constants.empty_backing_store_buffer(), 0);
    let sentinel = sandbox.end() - 1;
    constants.set_empty_backing_store_buffer(sentinel);
    assert_eq!(sandbox.constants().empty_backing_store_buffer(), sentinel);
    sandbox.constants().reset();
    assert_eq!(sandbox.constants().empty_backing_store_buffer(), 0);

    sandbox.constants().set_empty_backing_store_buffer(sentinel);
    sandbox.tear_down();
    assert_eq!(sandbox.constants().empty_backing_store_buffer(), 0);
}

#[test]
fn teardown_then_reinitialize() {
    let vas = host(None);
    let mut sandbox = Sandbox::new();
    sandbox.initialize(vas.clone(), &config()).expect("first");
    sandbox.tear_down();
    assert!(!sandbox.is_initialized());
    assert_eq!(sandbox.size(), 0);
    assert!(!sandbox.contains(0));
    assert_eq!(vas.reserved_bytes(), 0);
    sandbox.tear_down();

    sandbox.initialize(vas.clone(), &config()).expect("second");
    assert_layout_invariants(&sandbox);
    assert_eq!(sandbox.reservation_size(), GIB + 2 * GUARD);
}

#[test]
fn page_allocator_and_address_space_stay_inside() {
    let mut sandbox = Sandbox::new();
    sandbox.initialize(host(None), &config()).expect("initialized");
    let allocator = sandbox.page_allocator().expect("initialized");
    let size = 4 * allocator.commit_page_size();
    let addr = allocator
        .allocate_pages(0, size, allocator.allocate_page_size(), Permissions::READ_WRITE)
        .expect("room");
    assert!(sandbox.contains(addr) && sandbox.contains(addr + size - 1));
    allocator.set_permissions(addr, size, Permissions::READ).expect("allocated");
    allocator.free_pages(addr, size).expect("allocated");

    let space = sandbox.address_space().expect("initialized");
    assert_eq!(space.base(), sandbox.reservation_base());
    assert_eq!(space.size(), sandbox.reservation_size());
}

#[test]
fn full_sandbox_runs_out_of_pages() {
    let cfg = SandboxConfig {
        target_size: 16 * MIB,
        use_guard_regions: true,
        guard_region_size: 16 * MIB,
        alignment: 16 * MIB,
        fallback: FallbackPolicy::Disabled,
    };
    let mut sandbox = Sandbox::new();
    sandbox.initialize(host(None), &cfg).expect("initialized");
    assert!(!sandbox.is_partially_reserved());
    let allocator = sandbox.page_allocator().expect("initialized");
    let granularity = allocator.allocate_page_size();
    let addr = allocator
        .allocate_pages(0, 16 * MIB, granularity, Permissions::READ_WRITE)
        .expect("whole sandbox");
    assert!(sandbox.contains(addr) && sandbox.contains(addr + 16 * MIB - 1));
    assert_eq!(
        allocator.allocate_pages(0, allocator.commit_page_size(), granularity, Permissions::READ_WRITE),
        Err(AllocError::Provider(VasError::Exhausted))
    );
    allocator.free_pages(addr, 16 * MIB).expect("allocated");
    assert!(allocator
        .allocate_pages(0, allocator.commit_page_size(), granularity, Permissions::READ_WRITE)
        .is_ok());
}

#[test]
fn disable_before_initialize() {
    let mut sandbox = Sandbox::new();
    assert!(sandbox.is_enabled());
    sandbox.disable();
    assert!(!sandbox.is_enabled());
    assert!(sandbox.is_disabled());
    assert!(!sandbox.is_initialized());
    sandbox.tear_down();
    assert!(sandbox.is_enabled());
}

#[test]
#[should_panic(expected = "cannot disable an initialized sandbox")]
fn disable_after_initialize_panics() {
    let mut sandbox = Sandbox::new();
    sandbox.initialize(host(None), &config()).expect("initialized");
    sandbox.disable();
}

#[test]
#[should_panic(expected = "sandbox initialized twice")]
fn double_initialize_panics() {
    let vas = host(None);
    let mut sandbox = Sandbox::new();
    sandbox.initialize(vas.clone(), &config()).expect("initialized");
    let _ = sandbox.initialize(vas, &config());
}
