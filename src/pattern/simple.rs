// Simple bulk bandwidth: one timed pass of the block primitive over the
// whole buffer, repeated until the measurement window closes. The block
// width comes from the per-mode setting, so load and store jobs can use
// different unroll depths.

use crate::arch;
use crate::error::{BenchError, Result};
use crate::job::LoadStoreType;
use crate::mem::Span;
use crate::util::Timer;
use crate::worker::WorkerContext;

use super::{check_stop, prepare, PatternGenerator};

pub struct SimpleLdStBandwidth;

impl PatternGenerator for SimpleLdStBandwidth {
    fn run(&self, ctx: &WorkerContext, span: Span) -> Result<()> {
        let prims = arch::active();
        let block_fn = match ctx.ldst_type {
            LoadStoreType::Load => prims.load[ctx.bw_load_block.index()],
            LoadStoreType::Store => prims.store[ctx.bw_store_block.index()],
            other => {
                return Err(BenchError::UnknownPattern(format!(
                    "no simple load/store function for {other:?}"
                )))
            }
        };

        prepare(span);

        let len = span.len() as u64;
        let mut timer = Timer::new();
        loop {
            timer.start();
            unsafe {
                block_fn(span.base(), len);
            }
            ctx.log.add_nanos(timer.elapsed_ns());
            ctx.log.add_bytes(len);
            if check_stop(ctx) {
                break;
            }
        }
        Ok(())
    }
}
