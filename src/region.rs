// # Region descriptor
//
// Metadata for one logical mapping: base, length, page size, and the store
// backing it. Regions never overlap, and a region's page size never changes
// for its lifetime.

use crate::store::Store;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies a region independent of its base address, so page descriptors
/// can keep pointing at the right region even if region handles are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u64);

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

impl RegionId {
    pub fn next() -> Self {
        Self(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A contiguous virtual-address range registered with the engine, backed by
/// one store.
///
/// Invariants: `length % page_size == 0`; `base % page_size == 0`; no two
/// live regions overlap; `page_size` is fixed for the region's lifetime.
pub struct RegionDescriptor {
    pub id: RegionId,
    pub base: usize,
    pub length: usize,
    pub page_size: usize,
    pub store: Arc<dyn Store>,
}

impl RegionDescriptor {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.length
    }

    pub fn overlaps(&self, base: usize, length: usize) -> bool {
        base < self.base + self.length && self.base < base + length
    }

    /// Rounds `addr` down to this region's page size.
    pub fn page_base(&self, addr: usize) -> usize {
        let offset = addr - self.base;
        self.base + (offset / self.page_size) * self.page_size
    }

    /// Store offset for the page starting at `page_addr`.
    pub fn store_offset(&self, page_addr: usize) -> u64 {
        (page_addr - self.base) as u64
    }

    pub fn num_pages(&self) -> usize {
        self.length / self.page_size
    }
}
