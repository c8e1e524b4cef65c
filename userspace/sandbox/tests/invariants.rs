// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property tests for sandbox containment and page placement
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 3 property tests + 1 concurrency test
//!
//! TEST_SCOPE:
//!   - contains(a) <=> base <= a < end, around both edges
//!   - Every page from the scoped allocator lies fully inside the sandbox
//!   - Same guarantee for partially-reserved sandboxes
//!   - Concurrent allocation through one page allocator
//!
//! TEST_SCENARIOS:
//!   - contains_matches_bounds(): random offsets around base and end
//!   - full_sandbox_pages_are_contained(): random allocation sequences
//!   - partial_sandbox_pages_are_contained(): random sequences spilling past the reservation
//!   - concurrent_allocations_stay_contained(): 8 threads allocate and free in parallel
//!
//! DEPENDENCIES:
//!   - nexus_vas::HostAddressSpace: bookkeeping provider
//!   - proptest: input generation
#![cfg(feature = "sandbox")]

use std::sync::Arc;
use std::thread;

use nexus_sandbox::{FallbackPolicy, Sandbox, SandboxConfig};
use nexus_vas::{HostAddressSpace, HostConfig, Permissions};
use proptest::prelude::*;

const MIB: usize = 1 << 20;

fn config(target_size: usize) -> SandboxConfig {
    SandboxConfig {
        target_size,
        use_guard_regions: true,
        guard_region_size: 16 * MIB,
        alignment: 16 * MIB,
        fallback: FallbackPolicy::Halving { minimum: 4 * MIB },
    }
}

fn sandbox_with(host: HostConfig, target_size: usize) -> Sandbox {
    let mut sandbox = Sandbox::new();
    sandbox
        .initialize(Arc::new(HostAddressSpace::new(host)), &config(target_size))
        .expect("sandbox initializes");
    sandbox
}

proptest! {
    #[test]
    fn contains_matches_bounds(shift in 4u32..=12, delta in -0x2_0000isize..0x2_0000isize) {
        let sandbox = sandbox_with(HostConfig::default(), MIB << shift);
        for anchor in [sandbox.base(), sandbox.end()] {
            let address = anchor.wrapping_add_signed(delta);
            prop_assert_eq!(
                sandbox.contains(address),
                sandbox.base() <= address && address < sandbox.end()
            );
        }
    }

    #[test]
    fn full_sandbox_pages_are_contained(pages in prop::collection::vec(1usize..=16, 1..32)) {
        let sandbox = sandbox_with(HostConfig::default(), 64 * MIB);
        let allocator = sandbox.page_allocator().expect("initialized");
        let granularity = allocator.allocate_page_size();
        for count in pages {
            let size = count * allocator.commit_page_size();
            if let Ok(addr) = allocator.allocate_pages(0, size, granularity, Permissions::READ_WRITE) {
                prop_assert!(sandbox.contains(addr));
                prop_assert!(sandbox.contains(addr + size - 1));
            }
        }
    }

    #[test]
    fn partial_sandbox_pages_are_contained(pages in prop::collection::vec(1usize..=8, 1..48)) {
        let host = HostConfig { subspaces: false, ..HostConfig::default() };
        let sandbox = sandbox_with(host, 64 * MIB);
        prop_assert!(sandbox.is_partially_reserved());
        let allocator = sandbox.page_allocator().expect("initialized");
        let granularity = allocator.allocate_page_size();
        for count in pages {
            let size = count * granularity;
            if let Ok(addr) = allocator.allocate_pages(0, size, granularity, Permissions::READ_WRITE) {
                prop_assert!(sandbox.contains(addr));
                prop_assert!(sandbox.contains(addr + size - 1));
            }
        }
    }
}

#[test]
fn concurrent_allocations_stay_contained() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 64;

    let host = Arc::new(HostAddressSpace::new(HostConfig { subspaces: false, ..HostConfig::default() }));
    let mut cfg = config(256 * MIB);
    cfg.fallback = FallbackPolicy::Fixed { size_to_reserve: 16 * MIB };
    let mut sandbox = Sandbox::new();
    sandbox.initialize(host.clone(), &cfg).expect("degraded fallback");
    assert!(sandbox.is_partially_reserved());
    assert_eq!(host.reserved_bytes(), 16 * MIB);

    let allocator = sandbox.page_allocator().expect("initialized");
    let granularity = allocator.allocate_page_size();
    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                let mut pages = Vec::with_capacity(PER_THREAD);
                for _ in 0..PER_THREAD {
                    let addr = allocator
                        .allocate_pages(0, granularity, granularity, Permissions::READ_WRITE)
                        .expect("room in the sandbox");
                    assert!(sandbox.contains(addr));
                    assert!(sandbox.contains(addr + granularity - 1));
                    pages.push(addr);
                }
                for addr in pages {
                    allocator.free_pages(addr, granularity).expect("allocated");
                }
            });
        }
    });

    assert_eq!(host.reserved_bytes(), 16 * MIB);
    sandbox.tear_down();
    assert_eq!(host.reserved_bytes(), 0);
}
