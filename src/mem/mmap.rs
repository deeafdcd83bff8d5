// Anonymous-mmap allocation with NUMA binding. The "non-contiguous huge
// page" strategy maps native pages with transparent huge pages suppressed,
// so the region's TLB behavior stays predictable; callers that want real
// huge pages pass a huge `page_size` and get `MAP_HUGETLB` with the
// matching log-page-size flag.

use std::io;
use std::ptr;

use crate::error::AllocError;
use crate::util::numa;

use super::region::Region;

pub struct MmapAllocator;

impl MmapAllocator {
    pub fn new() -> Self {
        Self
    }

    pub fn native_page_size() -> usize {
        // sysconf(_SC_PAGESIZE) cannot fail on Linux.
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn page_size_is_huge(page_size: usize) -> bool {
        page_size > Self::native_page_size()
    }

    /// `MAP_HUGETLB | log2(page_size) << MAP_HUGE_SHIFT` for huge page
    /// sizes, nothing for the native size.
    fn page_size_flags(page_size: usize) -> Result<libc::c_int, AllocError> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(AllocError::Mmap(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("page size must be a power of 2: {page_size}"),
            )));
        }
        if !Self::page_size_is_huge(page_size) {
            return Ok(0);
        }
        let log2 = page_size.trailing_zeros() as libc::c_int;
        Ok(libc::MAP_HUGETLB | (log2 << libc::MAP_HUGE_SHIFT))
    }

    /// Map `size` bytes (rounded up to `page_size`) and bind them to
    /// `node`. Zero bytes yields the empty region.
    pub fn alloc(
        &self,
        page_size: usize,
        size: usize,
        node: Option<u32>,
    ) -> Result<Region, AllocError> {
        if size == 0 {
            return Ok(Region::empty());
        }
        let huge_flags = Self::page_size_flags(page_size)?;
        let mask = page_size - 1;
        let mapped_len = (size + mask) & !mask;

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | huge_flags,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(AllocError::Mmap(io::Error::last_os_error()));
        }

        if let Some(node) = node {
            if let Err(err) = bind_to_node(addr, mapped_len, node) {
                unsafe {
                    libc::munmap(addr, mapped_len);
                }
                return Err(err);
            }
        }

        if !Self::page_size_is_huge(page_size) {
            // Keep the kernel from transparently promoting the region.
            let rc = unsafe { libc::madvise(addr, mapped_len, libc::MADV_NOHUGEPAGE) };
            if rc != 0 {
                tracing::warn!(
                    err = %io::Error::last_os_error(),
                    "madvise(MADV_NOHUGEPAGE) failed"
                );
            }
        }

        Ok(Region::from_mmap(addr as *mut u8, size, mapped_len))
    }
}

impl Default for MmapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Strict-bind `[addr, addr + len)` to the given node. On single-node hosts
/// there is nothing to bind and the call is a no-op; on NUMA hosts a
/// failure is a hard error, because an unbound buffer measures the wrong
/// tier.
pub(crate) fn bind_to_node(
    addr: *mut libc::c_void,
    len: usize,
    node: u32,
) -> Result<(), AllocError> {
    if node >= 64 {
        return Err(AllocError::NumaBind {
            node,
            source: io::Error::new(io::ErrorKind::InvalidInput, "node id exceeds nodemask width"),
        });
    }
    if !numa::is_multi_node() {
        tracing::debug!(node, "single NUMA node online, skipping mbind");
        return Ok(());
    }
    let nodemask: u64 = 1 << node;
    // libc has no mbind wrapper; issue the raw syscall.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr,
            len,
            libc::MPOL_BIND,
            &nodemask as *const u64,
            64usize,
            0usize,
        )
    };
    if rc != 0 {
        return Err(AllocError::NumaBind {
            node,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}
