// # Memory Allocation
//
// NUMA-aware allocators for the worker buffers and the façade that picks
// one per job strategy:
//
// - `mmap` — anonymous native-page mappings with strict node binding and
//   transparent huge pages suppressed (the NON_CONTIGUOUS_HUGE_PAGE
//   strategy)
// - `phys_contig` — physically contiguous regions assembled from pagemap
//   PFN runs (the CONTIGUOUS_HUGE_PAGE strategy)
// - `hugepage` — hugetlbfs-backed explicit huge pages, for operators who
//   want guaranteed huge mappings rather than frame contiguity
//
// Every allocator returns a `Region` whose `Drop` releases the memory, so
// buffers cannot leak across worker exit paths.

pub mod hugepage;
pub mod mmap;
pub mod phys_contig;
mod region;

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::error::Result;
use crate::job::MemAllocType;

pub use hugepage::HugePageAllocator;
pub use mmap::MmapAllocator;
pub use phys_contig::PhysContigAllocator;
pub use region::{Region, Span};

/// Façade over the allocation strategies. One instance is owned by the job
/// coordinator; the underlying allocators are created lazily on first use
/// and torn down when the coordinator drops the façade.
pub struct MemAllocator {
    mmap: MmapAllocator,
    phys_contig: OnceCell<Arc<PhysContigAllocator>>,
    hugetlbfs: OnceCell<Arc<HugePageAllocator>>,
}

impl MemAllocator {
    pub fn new() -> Self {
        Self {
            mmap: MmapAllocator::new(),
            phys_contig: OnceCell::new(),
            hugetlbfs: OnceCell::new(),
        }
    }

    /// Allocate a worker buffer on `node` using the job's strategy.
    pub fn allocate(&self, size: usize, node: u32, strategy: MemAllocType) -> Result<Region> {
        match strategy {
            MemAllocType::NonContiguousHugePage => Ok(self.mmap.alloc(
                MmapAllocator::native_page_size(),
                size,
                Some(node),
            )?),
            MemAllocType::ContiguousHugePage => {
                let phys = self
                    .phys_contig
                    .get_or_try_init(|| PhysContigAllocator::new().map(Arc::new))?;
                let amplification = PhysContigAllocator::amplification_for(size);
                Ok(PhysContigAllocator::alloc(
                    phys,
                    size,
                    amplification,
                    Some(node),
                )?)
            }
        }
    }

    /// Explicit hugetlbfs-backed allocation, outside the two job
    /// strategies.
    pub fn allocate_hugetlbfs(&self, size: usize, node: u32) -> Result<Region> {
        let huge = self
            .hugetlbfs
            .get_or_init(|| Arc::new(HugePageAllocator::new()));
        Ok(HugePageAllocator::allocate(huge, size, node)?)
    }

    /// Return a buffer to its allocator. Equivalent to dropping the region;
    /// spelled out so the worker epilogue reads like the contract it
    /// implements.
    pub fn deallocate(&self, region: Region) {
        drop(region);
    }
}

impl Default for MemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemAllocator {
    fn drop(&mut self) {
        // Explicit process-wide teardown: if a hugetlbfs mount outlived its
        // regions, remove it now.
        if let Some(huge) = self.hugetlbfs.get() {
            huge.cleanup_mount();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facade_allocates_and_releases_mmap_regions() {
        let allocator = MemAllocator::new();
        let region = allocator
            .allocate(1 << 16, 0, MemAllocType::NonContiguousHugePage)
            .unwrap();
        assert!(!region.base().is_null());
        assert_eq!(region.len(), 1 << 16);
        unsafe {
            std::ptr::write_bytes(region.base(), 1, region.len());
        }
        allocator.deallocate(region);
    }

    #[test]
    fn zero_byte_request_yields_null_base() {
        let allocator = MemAllocator::new();
        let region = allocator
            .allocate(0, 0, MemAllocType::NonContiguousHugePage)
            .unwrap();
        assert!(region.base().is_null());
    }
}
