// Contiguous huge pages backed by hugetlbfs. The allocator reserves pages
// on the target node through the per-node sysfs knob, mounts `/mnt/huge` if
// needed, maps a truncated backing file with `MAP_HUGETLB`, and binds the
// mapping strictly to the node. Releasing the last region also unmounts and
// removes the mount point, restoring the machine.
//
// Reserving pages and mounting hugetlbfs require root; the allocate path
// reports `HugepageReserve`/`Mount` errors instead of failing silently.

use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::AllocError;

use super::mmap::bind_to_node;
use super::region::Region;

const MEMINFO_PATH: &str = "/proc/meminfo";
const DEFAULT_MOUNT: &str = "/mnt/huge";

static BACKING_FILE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct HugePageAllocator {
    mount_path: PathBuf,
}

impl HugePageAllocator {
    pub fn new() -> Self {
        Self {
            mount_path: PathBuf::from(DEFAULT_MOUNT),
        }
    }

    /// The platform's huge page size from `/proc/meminfo`.
    pub fn hugepage_size() -> Result<usize, AllocError> {
        let text = fs::read_to_string(MEMINFO_PATH)
            .map_err(|err| AllocError::HugepageReserve(format!("{MEMINFO_PATH}: {err}")))?;
        parse_hugepage_size(&text).ok_or_else(|| {
            AllocError::HugepageReserve("no Hugepagesize entry in /proc/meminfo".into())
        })
    }

    fn nr_hugepages_path(node: u32, hugepage_bytes: usize) -> PathBuf {
        PathBuf::from(format!(
            "/sys/devices/system/node/node{node}/hugepages/hugepages-{}kB/nr_hugepages",
            hugepage_bytes / 1024
        ))
    }

    fn reserve_node_pages(pages: usize, node: u32, hugepage_bytes: usize) -> Result<(), AllocError> {
        let path = Self::nr_hugepages_path(node, hugepage_bytes);
        fs::write(&path, pages.to_string())
            .map_err(|err| AllocError::HugepageReserve(format!("{}: {err}", path.display())))?;
        tracing::info!(pages, node, "reserved huge pages");
        Ok(())
    }

    fn ensure_mounted(&self) -> Result<(), AllocError> {
        if !self.mount_path.is_dir() {
            fs::create_dir_all(&self.mount_path).map_err(AllocError::Mount)?;
        }
        let target = path_to_cstring(&self.mount_path)?;
        let source = CString::new("none").map_err(invalid_path)?;
        let fstype = CString::new("hugetlbfs").map_err(invalid_path)?;
        let rc = unsafe {
            libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                fstype.as_ptr(),
                0,
                ptr::null(),
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Already mounted from a previous run.
            if err.raw_os_error() == Some(libc::EBUSY) {
                return Ok(());
            }
            return Err(AllocError::Mount(err));
        }
        tracing::info!(path = %self.mount_path.display(), "mounted hugetlbfs");
        Ok(())
    }

    /// Allocate `size` bytes of hugetlbfs-backed memory bound to `node`.
    /// Takes the allocator by `Arc` so the returned region can find its way
    /// back on release.
    pub fn allocate(this: &Arc<Self>, size: usize, node: u32) -> Result<Region, AllocError> {
        if size == 0 {
            return Ok(Region::empty());
        }
        let hugepage_bytes = Self::hugepage_size()?;
        let pages = size.div_ceil(hugepage_bytes);
        let mapped_len = pages * hugepage_bytes;

        Self::reserve_node_pages(pages, node, hugepage_bytes)?;
        this.ensure_mounted()?;

        let file_path = this.mount_path.join(format!(
            "tierbench-{}-{}",
            std::process::id(),
            BACKING_FILE_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&file_path)
            .map_err(AllocError::Map)?;
        if let Err(err) = file.set_len(mapped_len as u64) {
            let _ = fs::remove_file(&file_path);
            return Err(AllocError::Map(err));
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_HUGETLB,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            let _ = fs::remove_file(&file_path);
            return Err(AllocError::Map(err));
        }

        if let Err(err) = bind_to_node(addr, mapped_len, node) {
            unsafe {
                libc::munmap(addr, mapped_len);
            }
            let _ = fs::remove_file(&file_path);
            return Err(err);
        }

        // The mapping keeps the pages alive; the name can go.
        let _ = fs::remove_file(&file_path);
        tracing::info!(size, mapped_len, node, "hugetlbfs region allocated");
        Ok(Region::from_hugetlbfs(
            addr as *mut u8,
            size,
            mapped_len,
            Arc::clone(this),
        ))
    }

    pub(crate) fn release(&self, base: *mut u8, mapped_len: usize) {
        unsafe {
            if libc::munmap(base as *mut libc::c_void, mapped_len) != 0 {
                tracing::warn!(
                    err = %io::Error::last_os_error(),
                    "munmap of hugetlbfs region failed"
                );
            }
        }
        self.cleanup_mount();
    }

    /// Unmount and remove the mount point if it is still there. Idempotent;
    /// also invoked at coordinator teardown.
    pub(crate) fn cleanup_mount(&self) {
        if !self.mount_path.is_dir() {
            return;
        }
        let target = match path_to_cstring(&self.mount_path) {
            Ok(target) => target,
            Err(_) => return,
        };
        let rc = unsafe { libc::umount(target.as_ptr()) };
        if rc != 0 {
            tracing::warn!(
                err = %io::Error::last_os_error(),
                path = %self.mount_path.display(),
                "failed to unmount hugetlbfs"
            );
            return;
        }
        if let Err(err) = fs::remove_dir(&self.mount_path) {
            tracing::warn!(%err, "failed to remove hugetlbfs mount point");
        }
    }
}

impl Default for HugePageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_hugepage_size(meminfo: &str) -> Option<usize> {
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("Hugepagesize:") {
            let kb: usize = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

fn path_to_cstring(path: &Path) -> Result<CString, AllocError> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).map_err(invalid_path)
}

fn invalid_path<E: std::error::Error + Send + Sync + 'static>(err: E) -> AllocError {
    AllocError::Mount(io::Error::new(io::ErrorKind::InvalidInput, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_meminfo_hugepage_size() {
        let meminfo = "MemTotal:       65408656 kB\n\
                       MemFree:        12345678 kB\n\
                       Hugepagesize:       2048 kB\n\
                       DirectMap4k:      503232 kB\n";
        assert_eq!(parse_hugepage_size(meminfo), Some(2 * 1024 * 1024));
    }

    #[test]
    fn missing_hugepage_entry_is_none() {
        assert_eq!(parse_hugepage_size("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn sysfs_path_encodes_node_and_size() {
        let path = HugePageAllocator::nr_hugepages_path(1, 2 * 1024 * 1024);
        assert_eq!(
            path,
            PathBuf::from("/sys/devices/system/node/node1/hugepages/hugepages-2048kB/nr_hugepages")
        );
    }

    #[test]
    fn page_count_rounds_up() {
        let hugepage = 2 * 1024 * 1024;
        assert_eq!((hugepage + 1usize).div_ceil(hugepage), 2);
        assert_eq!(hugepage.div_ceil(hugepage), 1);
    }

    // Requires root, reserved huge pages, and a mountable /mnt/huge.
    #[test]
    #[ignore]
    fn allocate_and_release_round_trip() {
        let allocator = Arc::new(HugePageAllocator::new());
        let region = HugePageAllocator::allocate(&allocator, 4 * 1024 * 1024, 0).unwrap();
        unsafe {
            std::ptr::write_bytes(region.base(), 1, region.len());
        }
        drop(region);
    }
}
