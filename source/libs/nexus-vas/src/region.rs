// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! First-fit allocator over a fixed range of page-aligned addresses.
//!
//! Only allocated regions are tracked; free space is the gaps between them.
//! Every region carries a caller-chosen tag so owners can tell apart regions
//! of different kinds (pages, guards, subspaces) without a second index.

use std::collections::BTreeMap;

use crate::{is_aligned, round_up};

/// Region allocator for `[base, base + size)`.
#[derive(Debug, Clone)]
pub struct RegionAllocator<T = ()> {
    base: usize,
    size: usize,
    page_size: usize,
    regions: BTreeMap<usize, (usize, T)>,
    allocated: usize,
}

impl<T: Copy> RegionAllocator<T> {
    /// Creates an allocator covering `[base, base + size)`.
    ///
    /// `page_size` must be a power of two; `base` and `size` must be
    /// multiples of it.
    pub fn new(base: usize, size: usize, page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(is_aligned(base, page_size) && is_aligned(size, page_size));
        Self { base, size, page_size, regions: BTreeMap::new(), allocated: 0 }
    }

    /// First address managed by this allocator.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Number of bytes managed by this allocator.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of bytes currently allocated.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Number of bytes currently free.
    pub fn free_size(&self) -> usize {
        self.size - self.allocated
    }

    /// Returns true if `[address, address + size)` lies inside the managed range.
    pub fn contains_range(&self, address: usize, size: usize) -> bool {
        address >= self.base
            && size <= self.size
            && address - self.base <= self.size - size
    }

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// The hint is tried first when it is non-zero and aligned; otherwise the
    /// lowest fitting address is used.
    pub fn allocate(&mut self, hint: usize, size: usize, alignment: usize, tag: T) -> Option<usize> {
        if size == 0 || !is_aligned(size, self.page_size) {
            return None;
        }
        let alignment = alignment.max(self.page_size);
        if !alignment.is_power_of_two() {
            return None;
        }
        if hint != 0 && is_aligned(hint, alignment) && self.allocate_at(hint, size, tag) {
            return Some(hint);
        }
        let end = self.base + self.size;
        let mut cursor = self.base;
        let mut found = None;
        for (&start, &(len, _)) in &self.regions {
            if let Some(candidate) = fits_before(cursor, start, size, alignment) {
                found = Some(candidate);
                break;
            }
            cursor = start + len;
        }
        let address = match found {
            Some(address) => address,
            None => fits_before(cursor, end, size, alignment)?,
        };
        self.insert(address, size, tag);
        Some(address)
    }

    /// Allocates exactly `[address, address + size)` if it is free.
    pub fn allocate_at(&mut self, address: usize, size: usize, tag: T) -> bool {
        if size == 0
            || !is_aligned(address, self.page_size)
            || !is_aligned(size, self.page_size)
            || !self.contains_range(address, size)
        {
            return false;
        }
        if let Some((&start, &(len, _))) = self.regions.range(..=address).next_back() {
            if start + len > address {
                return false;
            }
        }
        if let Some((&start, _)) = self.regions.range(address..).next() {
            if start < address + size {
                return false;
            }
        }
        self.insert(address, size, tag);
        true
    }

    /// Frees the region starting at `address`, returning its size and tag.
    pub fn free(&mut self, address: usize) -> Option<(usize, T)> {
        let (size, tag) = self.regions.remove(&address)?;
        self.allocated -= size;
        Some((size, tag))
    }

    /// Returns `(start, size, tag)` of the region covering `address`.
    pub fn find(&self, address: usize) -> Option<(usize, usize, T)> {
        let (&start, &(len, tag)) = self.regions.range(..=address).next_back()?;
        (address - start < len).then_some((start, len, tag))
    }

    /// Returns the region covering the whole of `[address, address + size)`.
    pub fn find_covering(&self, address: usize, size: usize) -> Option<(usize, usize, T)> {
        let (start, len, tag) = self.find(address)?;
        (size <= len && address - start <= len - size).then_some((start, len, tag))
    }

    fn insert(&mut self, address: usize, size: usize, tag: T) {
        self.regions.insert(address, (size, tag));
        self.allocated += size;
    }
}

/// Lowest address in `[cursor, limit)` aligned to `alignment` with room for `size`.
fn fits_before(cursor: usize, limit: usize, size: usize, alignment: usize) -> Option<usize> {
    let candidate = round_up(cursor, alignment)?;
    let end = candidate.checked_add(size)?;
    (end <= limit).then_some(candidate)
}
