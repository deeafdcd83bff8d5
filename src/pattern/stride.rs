// Strided patterns: a fixed-size access every `stride` bytes, sweeping the
// buffer and wrapping at the end. The bandwidth form times whole sweeps of
// bulk non-temporal blocks; the latency form times each cache line
// individually and flushes it afterwards, so every line access is a miss.

use crate::arch::{self, BlockFn, TimedFlushFn};
use crate::error::{BenchError, Result};
use crate::job::{BlockWidth, LoadStoreType};
use crate::mem::Span;
use crate::util::Timer;
use crate::worker::WorkerContext;

use super::{check_stop, prepare, signal_complete, PatternGenerator};

/// One strided sweep resolved from the worker's load/store mode.
#[derive(Debug)]
enum StrideSweep {
    /// Bulk blocks, timed across the whole sweep.
    Bulk(BlockFn),
    /// Per-line timed access with flush; nanoseconds accumulate per line.
    TimedFlush(TimedFlushFn),
}

impl StrideSweep {
    fn resolve(ldst: LoadStoreType, block: BlockWidth) -> Result<Self> {
        let prims = arch::active();
        match ldst {
            LoadStoreType::Load => Ok(StrideSweep::Bulk(prims.load[block.index()])),
            LoadStoreType::Store => Ok(StrideSweep::Bulk(prims.store[block.index()])),
            LoadStoreType::LoadWithFlush => Ok(StrideSweep::TimedFlush(prims.load_with_flush)),
            LoadStoreType::StoreWithFlush => Ok(StrideSweep::TimedFlush(prims.store_with_flush)),
            other => Err(BenchError::UnknownPattern(format!(
                "no stride function for {other:?}"
            ))),
        }
    }

    /// Run one sweep of `count` accesses of `access_size` bytes, `stride`
    /// apart, starting at `start`. Returns the measured nanoseconds.
    ///
    /// # Safety
    ///
    /// Every access must stay inside the worker's buffer; the caller clamps
    /// `count` accordingly.
    unsafe fn sweep(&self, start: *mut u8, access_size: u64, stride: u64, count: u64) -> u64 {
        match self {
            StrideSweep::Bulk(block_fn) => {
                let mut timer = Timer::new();
                timer.start();
                let mut offset = 0usize;
                for _ in 0..count {
                    block_fn(start.add(offset), access_size);
                    offset += stride as usize;
                }
                timer.elapsed_ns()
            }
            StrideSweep::TimedFlush(flush_fn) => {
                let mut acc = 0u64;
                let mut offset = 0usize;
                for _ in 0..count {
                    acc += flush_fn(start.add(offset), access_size);
                    offset += stride as usize;
                }
                acc
            }
        }
    }
}

/// Clamp the per-sweep access count so the sweep stays inside the buffer.
fn clamped_access_count(ctx: &WorkerContext) -> u64 {
    let mut count = ctx.access_count;
    if ctx.lt_stride_size * count > ctx.buffer_size {
        count = ctx.buffer_size / ctx.lt_stride_size;
    }
    count
}

pub struct StrideBandwidth;

impl PatternGenerator for StrideBandwidth {
    fn run(&self, ctx: &WorkerContext, span: Span) -> Result<()> {
        let access_size = ctx.lt_access_size;
        let stride = ctx.lt_stride_size;
        let count = clamped_access_count(ctx);
        let sweep = StrideSweep::resolve(ctx.ldst_type, ctx.lt_block_size)?;

        prepare(span);

        let base = span.base() as usize;
        let end = span.end() as usize;
        let mut addr = base;
        loop {
            let ns = unsafe { sweep.sweep(addr as *mut u8, access_size, stride, count) };
            ctx.log.add_nanos(ns);
            ctx.log.add_bytes(access_size * count);

            addr += (stride * count) as usize;
            if addr + (access_size * count) as usize >= end {
                addr = base;
            }
            if check_stop(ctx) {
                break;
            }
        }
        Ok(())
    }
}

pub struct StrideLatency;

impl PatternGenerator for StrideLatency {
    fn run(&self, ctx: &WorkerContext, span: Span) -> Result<()> {
        let iterations = ctx.pattern_iteration as u64;
        if iterations < 2 {
            return Err(BenchError::Config(
                "stride latency needs pattern_iteration >= 2".into(),
            ));
        }
        // Latency always measures through the flush variants.
        let ldst = match ctx.ldst_type {
            LoadStoreType::Load => LoadStoreType::LoadWithFlush,
            LoadStoreType::Store => LoadStoreType::StoreWithFlush,
            other => other,
        };
        let sweep = StrideSweep::resolve(ldst, ctx.lt_block_size)?;

        let access_size = ctx.lt_access_size;
        let stride = ctx.lt_stride_size;
        let count = clamped_access_count(ctx);
        let lines_per_access = (access_size / 64).max(1);

        prepare(span);

        let base = span.base() as usize;
        let end = span.end() as usize;
        let mut addr = base;
        let mut latency = 0u64;
        for _ in 0..iterations {
            let ns = unsafe { sweep.sweep(addr as *mut u8, access_size, stride, count) };
            latency += ns / (lines_per_access * count);
            ctx.log.add_bytes(access_size * count);

            addr += (stride * count) as usize;
            if addr + (access_size * count) as usize >= end {
                addr = base;
            }
        }
        // Mean line latency across sweeps, discarding the warm-up sweep.
        ctx.log.add_nanos(latency / (iterations - 1));
        signal_complete(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BwPattern, JobInfo, JobKind, LatencyPattern, MemAllocType};
    use crate::mem::{MmapAllocator, Region};

    /// Page-aligned scratch buffer, memset to 1 like a worker prologue.
    fn scratch(len: usize) -> Region {
        let region = MmapAllocator::new()
            .alloc(MmapAllocator::native_page_size(), len, None)
            .unwrap();
        unsafe {
            std::ptr::write_bytes(region.base(), 1, region.len());
        }
        region
    }

    fn ctx_for(ldst: LoadStoreType, buffer: u64, stride: u64, access: u64) -> WorkerContext {
        let job = JobInfo {
            kind: JobKind::Latency,
            num_threads: 1,
            lt_block_size: BlockWidth::B64,
            lt_access_size: access,
            lt_stride_size: stride,
            delay_ns: 0,
            numa_node: 0,
            socket_id: 0,
            ldst_type: ldst,
            alloc_type: MemAllocType::NonContiguousHugePage,
            latency_pattern: LatencyPattern::Stride,
            bw_pattern: BwPattern::Stride,
            bw_load_block: BlockWidth::B64,
            bw_store_block: BlockWidth::B64,
            pattern_iteration: 4,
            thread_buffer_size: buffer,
            measure_secs: 1,
            layout: Default::default(),
        };
        WorkerContext::from_job(&job, 0)
    }

    #[test]
    fn access_count_is_clamped_to_the_buffer() {
        // 1 MiB buffer, stride 4096, access 64: raw count would sweep
        // 64 MiB, the clamp keeps it inside the buffer.
        let ctx = ctx_for(LoadStoreType::Load, 1 << 20, 4096, 64);
        assert_eq!(ctx.access_count, (1 << 20) / 64);
        assert_eq!(clamped_access_count(&ctx), (1 << 20) / 4096);
    }

    #[test]
    fn nt_modes_are_not_wired() {
        let err = StrideSweep::resolve(LoadStoreType::NtLoad, BlockWidth::B64).unwrap_err();
        assert!(matches!(err, BenchError::UnknownPattern(_)));
        let err = StrideSweep::resolve(LoadStoreType::NtStore, BlockWidth::B64).unwrap_err();
        assert!(matches!(err, BenchError::UnknownPattern(_)));
    }

    #[test]
    fn bandwidth_stops_after_the_flag_is_raised() {
        let ctx = ctx_for(LoadStoreType::Load, 1 << 20, 4096, 64);
        let region = scratch(1 << 20);

        // Pre-raise the stop flag: the pattern runs exactly one sweep.
        ctx.shared.lock().stop = true;
        StrideBandwidth.run(&ctx, region.span()).unwrap();

        let swept = (1 << 20) / 4096 * 64;
        assert_eq!(ctx.log.bytes(), swept);
    }

    #[test]
    fn latency_self_terminates_and_signals_complete() {
        let ctx = ctx_for(LoadStoreType::Load, 1 << 20, 4096, 64);
        let region = scratch(1 << 20);

        StrideLatency.run(&ctx, region.span()).unwrap();

        assert!(ctx.shared.lock().completed);
        // 4 sweeps of count accesses each.
        assert_eq!(ctx.log.bytes(), 4 * ((1 << 20) / 4096) * 64);
        assert!(ctx.log.nanos() > 0);
    }

    #[test]
    fn latency_rejects_single_iteration() {
        let mut ctx = ctx_for(LoadStoreType::Load, 1 << 16, 4096, 64);
        ctx.pattern_iteration = 1;
        let region = scratch(1 << 16);
        let err = StrideLatency.run(&ctx, region.span()).unwrap_err();
        assert!(matches!(err, BenchError::Config(_)));
    }
}
