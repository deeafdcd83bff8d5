// # Pattern Generators
//
// The access patterns a worker can drive over its buffer. Generators are
// stateless: they borrow the worker's context, write only its measurement
// log, and observe its stop/complete coordination. Nothing on a measurement
// hot path allocates or takes a lock; the only blocking point is the
// bounded 1 ms wait the bandwidth patterns use as their cancellation check
// between sweeps.

pub mod chase;
pub mod simple;
pub mod stride;

use std::time::Duration;

use crate::arch;
use crate::error::Result;
use crate::job::{BwPattern, LatencyPattern};
use crate::mem::Span;
use crate::worker::WorkerContext;

pub use chase::PointerChaseLatency;
pub use simple::SimpleLdStBandwidth;
pub use stride::{StrideBandwidth, StrideLatency};

pub trait PatternGenerator: Send + Sync {
    fn run(&self, ctx: &WorkerContext, span: Span) -> Result<()>;
}

static STRIDE_BANDWIDTH: StrideBandwidth = StrideBandwidth;
static SIMPLE_BANDWIDTH: SimpleLdStBandwidth = SimpleLdStBandwidth;
static STRIDE_LATENCY: StrideLatency = StrideLatency;
static CHASE_LATENCY: PointerChaseLatency = PointerChaseLatency;

/// Bandwidth-pattern dispatch, indexed by the job's pattern tag.
pub fn bandwidth_generator(kind: BwPattern) -> &'static dyn PatternGenerator {
    match kind {
        BwPattern::Stride => &STRIDE_BANDWIDTH,
        BwPattern::SimpleBulk => &SIMPLE_BANDWIDTH,
    }
}

/// Latency-pattern dispatch.
pub fn latency_generator(kind: LatencyPattern) -> &'static dyn PatternGenerator {
    match kind {
        LatencyPattern::Stride => &STRIDE_LATENCY,
        LatencyPattern::RandomPointerChase => &CHASE_LATENCY,
    }
}

/// Flush the worker's buffer out of the private caches before the first
/// timed sweep.
pub(crate) fn prepare(span: Span) {
    if span.is_empty() {
        return;
    }
    unsafe {
        arch::flush_range(span.base(), span.len() as u64);
    }
}

/// Bounded stop check between sweeps: wait at most 1 ms on `subop_stop` and
/// report whether the stop flag was raised. Doubles as the cancellation
/// point and as a cap on busy-wait overhead.
pub(crate) fn check_stop(ctx: &WorkerContext) -> bool {
    let mut shared = ctx.shared.lock();
    if shared.stop {
        return true;
    }
    let _ = ctx
        .subop_stop
        .wait_for(&mut shared, Duration::from_millis(1));
    shared.stop
}

/// Mark the worker's measurement finished and wake a waiting orchestrator.
pub(crate) fn signal_complete(ctx: &WorkerContext) {
    let mut shared = ctx.shared.lock();
    shared.completed = true;
    ctx.complete.notify_all();
}
