// # Architecture-Dependent Access Primitives
//
// Cache maintenance (`flush_range`/`fence`) and the bulk non-temporal
// load/store, timed load/store-with-flush, and pointer-chase primitives the
// pattern generators are built on. Three implementations exist:
//
// - `x86`: `vmovntdqa`/`vmovntdq` zmm inline assembly, `clflush`+`mfence`
// - `arm`: `LDNP`/`STNP` q-register inline assembly, `dc civac`+`dmb sy`
// - `mock`: plain copies through a bounce buffer, so the harness compiles
//   and runs on hosts without the vector extensions
//
// Selection happens once at first use: the compile target picks the
// candidate set, runtime feature detection decides whether the real
// non-temporal paths are usable, and anything unavailable falls back to the
// mock. Primitives never allocate or take locks; every timed primitive
// issues the strongest available serialising fence immediately before the
// timer stop so the CPU cannot reorder the measured access past it.

pub mod mock;

#[cfg(target_arch = "aarch64")]
pub mod arm;
#[cfg(target_arch = "x86_64")]
pub mod x86;

use once_cell::sync::Lazy;

/// Bulk load/store over `total_bytes` starting at `addr`, in groups of the
/// block width the function was unrolled for.
pub type BlockFn = unsafe fn(*mut u8, u64);

/// Per-line timed access with a flush after each line; returns the sum of
/// the timed intervals in nanoseconds.
pub type TimedFlushFn = unsafe fn(*mut u8, u64) -> u64;

/// One full pointer-chase walk over `region_bytes`; returns total
/// nanoseconds spent in the timed loads.
pub type ChaseLoadFn = unsafe fn(*mut u64, u64, u64, u64) -> u64;

/// Write form of the chase; the successor of each slot comes from the
/// precomputed index table.
pub type ChaseStoreFn = unsafe fn(*mut u64, u64, u64, u64, *const u64) -> u64;

/// The full primitive set for one architecture variant. The `load`/`store`
/// arrays are indexed by `BlockWidth::index()`.
pub struct Primitives {
    pub name: &'static str,
    pub load: [BlockFn; 4],
    pub store: [BlockFn; 4],
    pub load_with_flush: TimedFlushFn,
    pub store_with_flush: TimedFlushFn,
    pub chase_load: ChaseLoadFn,
    pub chase_store: ChaseStoreFn,
    pub flush_range: unsafe fn(*mut u8, u64),
    pub fence: fn(),
}

/// Runtime CPU capabilities relevant to the non-temporal paths.
#[derive(Debug, Clone, Copy)]
pub struct CpuFeatures {
    pub avx512f: bool,
}

impl CpuFeatures {
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        Self {
            avx512f: std::arch::is_x86_feature_detected!("avx512f"),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn detect() -> Self {
        Self { avx512f: false }
    }
}

static ACTIVE: Lazy<Primitives> = Lazy::new(select_primitives);

#[cfg(target_arch = "x86_64")]
fn select_primitives() -> Primitives {
    let features = CpuFeatures::detect();
    if features.avx512f {
        tracing::debug!("using x86-64 non-temporal access primitives");
        return x86::primitives();
    }
    // The zmm block primitives need AVX-512; cache maintenance and the
    // pointer chase only need the x86-64 baseline.
    tracing::warn!("AVX-512 not detected; bulk primitives fall back to the portable mock");
    let mut prims = mock::primitives();
    prims.name = "x86-64 (mock bulk)";
    prims.chase_load = x86::ptr_chase_load;
    prims.chase_store = x86::ptr_chase_store;
    prims.flush_range = x86::flush_range;
    prims.fence = x86::fence;
    prims
}

#[cfg(target_arch = "aarch64")]
fn select_primitives() -> Primitives {
    tracing::debug!("using aarch64 non-temporal access primitives");
    arm::primitives()
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn select_primitives() -> Primitives {
    tracing::warn!("no native access primitives for this architecture; using the mock");
    mock::primitives()
}

/// The primitive set for the running machine.
pub fn active() -> &'static Primitives {
    &ACTIVE
}

/// Clean and invalidate every cache line of `[addr, addr + bytes)` on the
/// executing core, followed by a full barrier.
///
/// # Safety
///
/// `addr..addr + bytes` must be a mapped, readable range.
pub unsafe fn flush_range(addr: *mut u8, bytes: u64) {
    (active().flush_range)(addr, bytes)
}

/// Full system memory barrier.
pub fn fence() {
    (active().fence)()
}
