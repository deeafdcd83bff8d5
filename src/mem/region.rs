use std::sync::Arc;

use super::hugepage::HugePageAllocator;
use super::phys_contig::PhysContigAllocator;

/// Borrowed view of a buffer handed to a pattern generator. Copyable so the
/// worker can pass it into the installed work function without giving up
/// the owning `Region`.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Span {}

impl Span {
    pub fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    pub fn from_slice(slice: &mut [u8]) -> Self {
        Self {
            base: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// One past the last byte.
    #[inline]
    pub fn end(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
enum Release {
    None,
    Munmap {
        mapped_len: usize,
    },
    PhysContig(Arc<PhysContigAllocator>),
    Hugetlbfs {
        allocator: Arc<HugePageAllocator>,
        mapped_len: usize,
    },
}

/// Owning handle to an allocated buffer. Dropping the region returns the
/// memory to whichever allocator produced it, so a worker that unwinds
/// mid-pattern still releases its buffer.
#[derive(Debug)]
pub struct Region {
    base: *mut u8,
    len: usize,
    release: Release,
}

unsafe impl Send for Region {}

impl Region {
    /// The zero-byte region: null base, nothing to release.
    pub fn empty() -> Self {
        Self {
            base: std::ptr::null_mut(),
            len: 0,
            release: Release::None,
        }
    }

    pub(crate) fn from_mmap(base: *mut u8, len: usize, mapped_len: usize) -> Self {
        Self {
            base,
            len,
            release: Release::Munmap { mapped_len },
        }
    }

    pub(crate) fn from_phys_contig(
        base: *mut u8,
        len: usize,
        allocator: Arc<PhysContigAllocator>,
    ) -> Self {
        Self {
            base,
            len,
            release: Release::PhysContig(allocator),
        }
    }

    pub(crate) fn from_hugetlbfs(
        base: *mut u8,
        len: usize,
        mapped_len: usize,
        allocator: Arc<HugePageAllocator>,
    ) -> Self {
        Self {
            base,
            len,
            release: Release::Hugetlbfs {
                allocator,
                mapped_len,
            },
        }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn span(&self) -> Span {
        Span::new(self.base, self.len)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.base.is_null() {
            return;
        }
        match &self.release {
            Release::None => {}
            Release::Munmap { mapped_len } => unsafe {
                if libc::munmap(self.base as *mut libc::c_void, *mapped_len) != 0 {
                    tracing::warn!(
                        err = %std::io::Error::last_os_error(),
                        "munmap failed during region release"
                    );
                }
            },
            Release::PhysContig(allocator) => allocator.release(self.base),
            Release::Hugetlbfs {
                allocator,
                mapped_len,
            } => allocator.release(self.base, *mapped_len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_region_has_null_base() {
        let region = Region::empty();
        assert!(region.base().is_null());
        assert_eq!(region.len(), 0);
        drop(region);
    }

    #[test]
    fn span_end_is_base_plus_len() {
        let mut buf = vec![0u8; 128];
        let span = Span::from_slice(&mut buf);
        assert_eq!(span.len(), 128);
        assert_eq!(span.end() as usize - span.base() as usize, 128);
    }
}
