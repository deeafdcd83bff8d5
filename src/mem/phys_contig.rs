// Physically contiguous allocation from user space. The kernel gives out
// no such guarantee directly, so the allocator over-allocates, inspects the
// page frame numbers through `/proc/self/pagemap`, picks the longest run of
// consecutive frames, and `mremap`s that run into a reserved virtual
// window. The result models DIMM-addressed behavior: consecutive virtual
// addresses hit consecutive physical frames.
//
// Reading PFNs requires CAP_SYS_ADMIN (the kernel zeroes them otherwise).

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::AllocError;
use crate::job::GIB;

use super::mmap::bind_to_node;
use super::region::Region;

const PAGEMAP_PATH: &str = "/proc/self/pagemap";
const PAGEMAP_ENTRY_LEN: u64 = 8;
const PFN_MASK: u64 = (1 << 55) - 1;
const PAGE_PRESENT: u64 = 1 << 63;

/// Virtual window the selected run is remapped into. Advanced per
/// allocation so concurrent workers never fight over the same fixed range.
const REMAP_WINDOW_BASE: usize = 0x1_0000_0000;

#[derive(Debug)]
pub struct PhysContigAllocator {
    page_size: usize,
    max_retries: usize,
    pagemap: File,
    next_window: AtomicUsize,
    /// base address -> mapped length, so release is a lookup + munmap.
    allocations: Mutex<HashMap<usize, usize>>,
}

impl PhysContigAllocator {
    pub fn new() -> Result<Self, AllocError> {
        let pagemap = File::open(PAGEMAP_PATH).map_err(AllocError::Pagemap)?;
        Ok(Self {
            page_size: unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize },
            max_retries: 10,
            pagemap,
            next_window: AtomicUsize::new(REMAP_WINDOW_BASE),
            allocations: Mutex::new(HashMap::new()),
        })
    }

    /// Over-allocation factor per request size: small requests can afford a
    /// wide net, huge ones cannot.
    pub fn amplification_for(bytes: usize) -> usize {
        if (bytes as u64) < GIB {
            56
        } else if (bytes as u64) <= 4 * GIB {
            20
        } else {
            10
        }
    }

    /// Allocate `bytes` of physically contiguous memory, retrying with
    /// fresh over-allocations until a long-enough PFN run appears. Takes
    /// the allocator by `Arc` so the returned region can find its way back
    /// on release.
    pub fn alloc(
        this: &Arc<Self>,
        bytes: usize,
        amplification: usize,
        node: Option<u32>,
    ) -> Result<Region, AllocError> {
        if bytes == 0 {
            return Ok(Region::empty());
        }
        let pages = bytes.div_ceil(this.page_size);
        for attempt in 0..this.max_retries {
            match this.try_alloc(pages, amplification, node) {
                Ok(base) => {
                    let mapped_len = pages * this.page_size;
                    this.allocations.lock().insert(base as usize, mapped_len);
                    tracing::info!(bytes, pages, attempt, "physically contiguous region ready");
                    return Ok(Region::from_phys_contig(base, bytes, Arc::clone(this)));
                }
                Err(err @ AllocError::Pagemap(_)) => return Err(err),
                Err(err) => {
                    tracing::debug!(attempt, %err, "contiguous allocation attempt failed");
                }
            }
        }
        Err(AllocError::NoContiguousRun {
            needed: pages,
            retries: this.max_retries,
        })
    }

    fn try_alloc(
        &self,
        pages: usize,
        amplification: usize,
        node: Option<u32>,
    ) -> Result<*mut u8, AllocError> {
        let total_pages = pages * amplification;
        let alloc_size = total_pages * self.page_size;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                alloc_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(AllocError::Mmap(io::Error::last_os_error()));
        }
        let unmap_base = |err: AllocError| {
            unsafe {
                libc::munmap(base, alloc_size);
            }
            err
        };

        // Binding before the touch decides which node the frames come from.
        if let Some(node) = node {
            if let Err(err) = bind_to_node(base, alloc_size, node) {
                return Err(unmap_base(err));
            }
        }

        // Touch every page so it is physically backed, then record its PFN.
        let mut pairs: Vec<(u64, usize)> = Vec::with_capacity(total_pages);
        for i in 0..total_pages {
            let va = unsafe { (base as *mut u8).add(i * self.page_size) };
            unsafe {
                ptr::write_volatile(va, 0u8);
            }
            let pfn = match self.pfn_of(va as *const u8) {
                Ok(pfn) => pfn,
                Err(err) => return Err(unmap_base(err)),
            };
            if pfn == 0 {
                return Err(unmap_base(AllocError::Pagemap(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "page frame numbers are hidden; CAP_SYS_ADMIN is required",
                ))));
            }
            pairs.push((pfn, va as usize));
        }

        pairs.sort_unstable_by_key(|&(pfn, _)| pfn);
        let (run_start, run_len) = longest_consecutive_run(&pairs);
        tracing::debug!(run_len, needed = pages, "longest consecutive PFN run");
        if run_len < pages {
            return Err(unmap_base(AllocError::NoContiguousRun {
                needed: pages,
                retries: 1,
            }));
        }

        let target_len = pages * self.page_size;
        let target = self.next_window.fetch_add(
            target_len + self.page_size, // one guard page between windows
            Ordering::SeqCst,
        );

        // Reserve the window, then move each page of the run into place.
        let fixed = unsafe {
            libc::mmap(
                target as *mut libc::c_void,
                target_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if fixed == libc::MAP_FAILED {
            return Err(unmap_base(AllocError::Mmap(io::Error::last_os_error())));
        }

        for (i, &(_, va)) in pairs[run_start..run_start + pages].iter().enumerate() {
            let new_addr = target + i * self.page_size;
            let moved = unsafe {
                libc::mremap(
                    va as *mut libc::c_void,
                    self.page_size,
                    self.page_size,
                    libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
                    new_addr as *mut libc::c_void,
                )
            };
            if moved == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::munmap(target as *mut libc::c_void, target_len);
                }
                return Err(unmap_base(AllocError::Mremap { page: i, source: err }));
            }
        }

        // The moved pages no longer live in the over-allocation; drop the
        // leftovers.
        unsafe {
            libc::munmap(base, alloc_size);
        }

        match self.is_physically_contiguous(target as *const u8, target_len) {
            Ok(true) => Ok(target as *mut u8),
            Ok(false) => {
                unsafe {
                    libc::munmap(target as *mut libc::c_void, target_len);
                }
                Err(AllocError::NoContiguousRun {
                    needed: pages,
                    retries: 1,
                })
            }
            Err(err) => {
                unsafe {
                    libc::munmap(target as *mut libc::c_void, target_len);
                }
                Err(err)
            }
        }
    }

    /// Verify that every page frame of `[base, base + size)` is consecutive.
    pub fn is_physically_contiguous(
        &self,
        base: *const u8,
        size: usize,
    ) -> Result<bool, AllocError> {
        let pages = size.div_ceil(self.page_size);
        let mut previous: Option<u64> = None;
        for i in 0..pages {
            let va = unsafe { base.add(i * self.page_size) };
            let pfn = self.pfn_of(va)?;
            if pfn == 0 {
                return Ok(false);
            }
            if let Some(prev) = previous {
                if pfn != prev + 1 {
                    return Ok(false);
                }
            }
            previous = Some(pfn);
        }
        Ok(true)
    }

    fn pfn_of(&self, addr: *const u8) -> Result<u64, AllocError> {
        let offset = (addr as u64 / self.page_size as u64) * PAGEMAP_ENTRY_LEN;
        let mut entry = [0u8; 8];
        self.pagemap
            .read_exact_at(&mut entry, offset)
            .map_err(AllocError::Pagemap)?;
        let entry = u64::from_le_bytes(entry);
        if entry & PAGE_PRESENT == 0 {
            return Ok(0);
        }
        Ok(entry & PFN_MASK)
    }

    pub(crate) fn release(&self, base: *mut u8) {
        if let Some(mapped_len) = self.allocations.lock().remove(&(base as usize)) {
            unsafe {
                libc::munmap(base as *mut libc::c_void, mapped_len);
            }
        } else {
            tracing::warn!(?base, "release of untracked contiguous region");
        }
    }
}

/// Longest run of consecutive PFNs in a `(pfn, va)` list sorted by PFN.
/// Returns `(start_index, length)`.
pub(crate) fn longest_consecutive_run(pairs: &[(u64, usize)]) -> (usize, usize) {
    if pairs.is_empty() {
        return (0, 0);
    }
    let mut best_start = 0;
    let mut best_len = 1;
    let mut current_start = 0;
    let mut current_len = 1;
    for i in 1..pairs.len() {
        if pairs[i].0 == pairs[i - 1].0 + 1 {
            current_len += 1;
        } else {
            if current_len > best_len {
                best_len = current_len;
                best_start = current_start;
            }
            current_start = i;
            current_len = 1;
        }
    }
    if current_len > best_len {
        best_len = current_len;
        best_start = current_start;
    }
    (best_start, best_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(pfns: &[u64]) -> Vec<(u64, usize)> {
        pfns.iter().map(|&pfn| (pfn, 0usize)).collect()
    }

    #[test]
    fn run_finder_handles_empty_and_singleton() {
        assert_eq!(longest_consecutive_run(&[]), (0, 0));
        assert_eq!(longest_consecutive_run(&pairs(&[7])), (0, 1));
    }

    #[test]
    fn run_finder_picks_the_longest_run() {
        // Runs: [1,2] then [10,11,12,13] then [20].
        let input = pairs(&[1, 2, 10, 11, 12, 13, 20]);
        assert_eq!(longest_consecutive_run(&input), (2, 4));
    }

    #[test]
    fn run_finder_picks_a_trailing_run() {
        let input = pairs(&[5, 100, 101, 102]);
        assert_eq!(longest_consecutive_run(&input), (1, 3));
    }

    #[test]
    fn amplification_buckets() {
        assert_eq!(PhysContigAllocator::amplification_for(512 << 20), 56);
        assert_eq!(PhysContigAllocator::amplification_for(1 << 30), 20);
        assert_eq!(PhysContigAllocator::amplification_for(4 << 30), 20);
        assert_eq!(PhysContigAllocator::amplification_for(8 << 30), 10);
    }

    // Needs CAP_SYS_ADMIN for real PFNs.
    #[test]
    #[ignore]
    fn contiguous_smoke() {
        let allocator = Arc::new(PhysContigAllocator::new().unwrap());
        match PhysContigAllocator::alloc(&allocator, 512 << 20, 56, Some(0)) {
            Ok(region) => {
                assert!(allocator
                    .is_physically_contiguous(region.base(), region.len())
                    .unwrap());
            }
            Err(AllocError::NoContiguousRun { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
