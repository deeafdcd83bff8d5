// Portable mock of the access primitives. Plain copies through a stack
// bounce buffer stand in for the non-temporal instructions; `black_box`
// keeps the compiler from eliding the traffic. Cache maintenance is a
// compiler fence only. This variant exists so the harness builds and runs
// on hosts without the vector extensions; the unit tests and the criterion
// bench target it directly.

use std::hint::black_box;
use std::ptr;
use std::sync::atomic::{compiler_fence, Ordering};

use crate::util::Timer;

use super::Primitives;

macro_rules! mock_load_block {
    ($name:ident, $width:expr) => {
        /// # Safety
        ///
        /// `addr..addr + total_bytes` must be mapped and readable, and
        /// `total_bytes` a multiple of the block width.
        pub unsafe fn $name(addr: *mut u8, total_bytes: u64) {
            let mut buf = [0u8; $width];
            let mut offset = 0u64;
            while offset < total_bytes {
                ptr::copy_nonoverlapping(addr.add(offset as usize), buf.as_mut_ptr(), $width);
                black_box(&buf);
                offset += $width as u64;
            }
        }
    };
}

macro_rules! mock_store_block {
    ($name:ident, $width:expr) => {
        /// # Safety
        ///
        /// `addr..addr + total_bytes` must be mapped and writable, and
        /// `total_bytes` a multiple of the block width.
        pub unsafe fn $name(addr: *mut u8, total_bytes: u64) {
            let buf = [0u8; $width];
            let mut offset = 0u64;
            while offset < total_bytes {
                ptr::copy_nonoverlapping(black_box(buf.as_ptr()), addr.add(offset as usize), $width);
                offset += $width as u64;
            }
        }
    };
}

mock_load_block!(load_block_64, 64);
mock_load_block!(load_block_128, 128);
mock_load_block!(load_block_256, 256);
mock_load_block!(load_block_512, 512);

mock_store_block!(store_block_64, 64);
mock_store_block!(store_block_128, 128);
mock_store_block!(store_block_256, 256);
mock_store_block!(store_block_512, 512);

/// # Safety
///
/// `addr..addr + total_bytes` must be mapped and writable.
pub unsafe fn load_with_flush(addr: *mut u8, total_bytes: u64) -> u64 {
    let mut buf = [0u8; 64];
    let mut acc = 0u64;
    let mut offset = 0u64;
    let mut timer = Timer::new();
    while offset < total_bytes {
        let line = addr.add(offset as usize);
        timer.start();
        ptr::copy_nonoverlapping(line, buf.as_mut_ptr(), 64);
        black_box(&buf);
        acc += timer.elapsed_ns();
        // Stands in for the cache-line flush.
        ptr::write_bytes(line, 0, 64);
        offset += 64;
    }
    acc
}

/// # Safety
///
/// `addr..addr + total_bytes` must be mapped and writable.
pub unsafe fn store_with_flush(addr: *mut u8, total_bytes: u64) -> u64 {
    let buf = [0u8; 64];
    let mut acc = 0u64;
    let mut offset = 0u64;
    let mut timer = Timer::new();
    while offset < total_bytes {
        let line = addr.add(offset as usize);
        timer.start();
        ptr::copy_nonoverlapping(black_box(buf.as_ptr()), line, 64);
        acc += timer.elapsed_ns();
        ptr::write_bytes(line, 0, 64);
        offset += 64;
    }
    acc
}

/// # Safety
///
/// `base` must point to a region of at least `region_bytes` bytes whose
/// slots encode a chain of in-bounds indices.
pub unsafe fn ptr_chase_load(
    base: *mut u64,
    region_bytes: u64,
    stride: u64,
    block_size: u64,
) -> u64 {
    let mut scanned = 0u64;
    let mut current: u64 = 0;
    let mut total = 0u64;
    let mut timer = Timer::new();
    while scanned < region_bytes {
        let slot = base.add((current * stride / 8) as usize);
        timer.start();
        let next = black_box(ptr::read_volatile(slot));
        total += timer.elapsed_ns();
        current = next;
        scanned += block_size;
    }
    total
}

/// # Safety
///
/// As `ptr_chase_load`; `next_table` must hold at least
/// `region_bytes / stride` entries.
pub unsafe fn ptr_chase_store(
    base: *mut u64,
    region_bytes: u64,
    stride: u64,
    block_size: u64,
    next_table: *const u64,
) -> u64 {
    let mut scanned = 0u64;
    let mut current: u64 = 0;
    let mut total = 0u64;
    let mut timer = Timer::new();
    while scanned < region_bytes {
        let slot = base.add((current * stride / 8) as usize);
        let next = *next_table.add(current as usize);
        timer.start();
        ptr::write_volatile(slot, black_box(next));
        total += timer.elapsed_ns();
        current = next;
        scanned += block_size;
    }
    total
}

/// # Safety
///
/// Always safe to call; kept unsafe for signature parity with the real
/// flush implementations.
pub unsafe fn flush_range(_addr: *mut u8, _bytes: u64) {
    compiler_fence(Ordering::SeqCst);
}

pub fn fence() {
    compiler_fence(Ordering::SeqCst);
}

pub fn primitives() -> Primitives {
    Primitives {
        name: "mock",
        load: [load_block_64, load_block_128, load_block_256, load_block_512],
        store: [
            store_block_64,
            store_block_128,
            store_block_256,
            store_block_512,
        ],
        load_with_flush,
        store_with_flush,
        chase_load: ptr_chase_load,
        chase_store: ptr_chase_store,
        flush_range,
        fence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load_round_trip() {
        let mut buf = vec![0xffu8; 8192];
        unsafe {
            store_block_256(buf.as_mut_ptr(), 8192);
            load_block_256(buf.as_mut_ptr(), 8192);
        }
        // The mock store writes zeros over the whole region.
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn timed_flush_variants_accumulate() {
        let mut buf = vec![1u8; 1 << 20];
        let load_ns = unsafe { load_with_flush(buf.as_mut_ptr(), buf.len() as u64) };
        let store_ns = unsafe { store_with_flush(buf.as_mut_ptr(), buf.len() as u64) };
        assert!(load_ns > 0);
        assert!(store_ns > 0);
    }

    #[test]
    fn chase_load_follows_the_encoded_chain() {
        // Chain over 8 slots, stride 64: 0 -> 1 -> ... -> 7 -> 0.
        let slots = 8usize;
        let stride = 64u64;
        let mut buf = vec![0u64; slots * stride as usize / 8];
        for i in 0..slots {
            buf[i * stride as usize / 8] = ((i + 1) % slots) as u64;
        }
        let ns =
            unsafe { ptr_chase_load(buf.as_mut_ptr(), (slots as u64) * stride, stride, stride) };
        let _ = ns;
    }
}
