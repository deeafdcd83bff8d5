// # Job-Class Handlers
//
// Policy per job kind: which pattern each worker runs, how the orchestrator
// waits for the measurement to end, and how results are reported. The three
// user-space job classes collapse into one tagged enum; the per-pattern
// dispatch happens through the read-only resolver tables in `pattern`.

use std::time::Duration;

use crate::error::{BenchError, Result};
use crate::job::{JobKind, MIB};
use crate::pattern;
use crate::util::Logger;
use crate::worker::{WorkerContext, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Bandwidth,
    Latency,
    /// Worker 0 measures latency while workers 1..N-1 generate load.
    BandwidthVsLatency,
}

impl HandlerKind {
    pub fn for_job(kind: JobKind) -> Result<Self> {
        match kind {
            JobKind::Bandwidth => Ok(HandlerKind::Bandwidth),
            JobKind::Latency => Ok(HandlerKind::Latency),
            JobKind::BandwidthLatency => Ok(HandlerKind::BandwidthVsLatency),
            JobKind::PointerChase => Err(BenchError::Config(
                "pointer-chase jobs run through the kernel collaborator, not the worker pool"
                    .into(),
            )),
        }
    }
}

pub struct JobHandler {
    kind: HandlerKind,
    measure_window: Duration,
}

impl JobHandler {
    pub fn new(kind: HandlerKind, measure_window: Duration) -> Self {
        Self {
            kind,
            measure_window,
        }
    }

    /// Install each worker's pattern dispatch and release the pool.
    pub fn start(&self, pool: &WorkerPool) {
        let kind = self.kind;
        pool.start(move |index| {
            Box::new(move |ctx: &WorkerContext, span| {
                let generator = match kind {
                    HandlerKind::Bandwidth => pattern::bandwidth_generator(ctx.bw_pattern),
                    HandlerKind::Latency => pattern::latency_generator(ctx.latency_pattern),
                    HandlerKind::BandwidthVsLatency => {
                        if index == 0 {
                            pattern::latency_generator(ctx.latency_pattern)
                        } else {
                            pattern::bandwidth_generator(ctx.bw_pattern)
                        }
                    }
                };
                generator.run(ctx, span)
            })
        });
    }

    /// Block until the job's stop policy fires, then cancel whichever
    /// workers do not terminate on their own.
    pub fn wait(&self, pool: &WorkerPool) {
        match self.kind {
            HandlerKind::Bandwidth => {
                std::thread::sleep(self.measure_window);
                tracing::info!("measurement window over, stopping workers");
                pool.stop_from(0);
            }
            // Latency patterns self-terminate after their iterations.
            HandlerKind::Latency => {}
            HandlerKind::BandwidthVsLatency => {
                pool.wait_complete(0);
                tracing::info!("latency worker finished, stopping bandwidth workers");
                pool.stop_from(1);
            }
        }
    }

    /// Emit per-worker lines and the aggregate for this job class.
    pub fn report(&self, pool: &WorkerPool, logger: &mut Logger) {
        match self.kind {
            HandlerKind::Bandwidth => {
                let mut total = 0u64;
                for ctx in pool.contexts() {
                    let (line, mib_s) = bandwidth_line(ctx);
                    total += mib_s;
                    logger.append(&line);
                }
                logger.append(&format!("Total Bandwidth : {total} MiB/s"));
            }
            HandlerKind::Latency => {
                let mut sum = 0u64;
                for ctx in pool.contexts() {
                    sum += ctx.log.nanos();
                    logger.append(&format!(
                        "Worker : [{}] Latency : {} ns",
                        ctx.core_id,
                        ctx.log.nanos()
                    ));
                }
                let mean = sum / pool.num_workers() as u64;
                logger.append(&format!("Average Latency : {mean} ns"));
            }
            HandlerKind::BandwidthVsLatency => {
                let mut total = 0u64;
                for ctx in pool.contexts().iter().skip(1) {
                    let (line, mib_s) = bandwidth_line(ctx);
                    total += mib_s;
                    logger.append(&line);
                }
                logger.append(&format!("Total Bandwidth : {total} MiB/s"));
                logger.append(&format!(
                    "Measured Latency : {} ns",
                    pool.contexts()[0].log.nanos()
                ));
            }
        }
    }
}

fn bandwidth_line(ctx: &WorkerContext) -> (String, u64) {
    let bytes = ctx.log.bytes();
    let nanos = ctx.log.nanos();
    let mib_s = if nanos == 0 {
        0
    } else {
        (bytes as f64 * 1e9 / nanos as f64 / MIB as f64) as u64
    };
    let line = format!(
        "Worker : [{}] Latency : {} ns, Size : {} bytes, Bandwidth : {} MiB/s",
        ctx.core_id, nanos, bytes, mib_s
    );
    (line, mib_s)
}
