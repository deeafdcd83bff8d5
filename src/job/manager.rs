// Orchestration of one measurement run: validate, open the result log,
// spin up the pool, run the handler's start/wait/report protocol, and tear
// everything down. The manager owns the allocator façade, so process-wide
// allocator state (hugetlbfs mount, pagemap handle) lives exactly as long
// as the coordinator.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::handler::{HandlerKind, JobHandler};
use crate::job::JobInfo;
use crate::mem::MemAllocator;
use crate::util::Logger;
use crate::worker::WorkerPool;

pub struct JobManager {
    allocator: Arc<MemAllocator>,
}

impl JobManager {
    pub fn new() -> Self {
        Self {
            allocator: Arc::new(MemAllocator::new()),
        }
    }

    /// Run a job end to end, logging results under `output_dir`.
    pub fn run(&self, output_dir: &Path, job: &JobInfo) -> Result<()> {
        job.validate()?;
        let mut logger = Logger::open(output_dir)?;
        self.run_with_logger(&mut logger, job)
    }

    /// Run a job against an already-open result log.
    pub fn run_with_logger(&self, logger: &mut Logger, job: &JobInfo) -> Result<()> {
        job.validate()?;
        let kind = HandlerKind::for_job(job.kind)?;
        let handler = JobHandler::new(kind, Duration::from_secs(job.measure_secs));

        logger.append(&job.test_info());

        let mut pool = WorkerPool::initialize(job, Arc::clone(&self.allocator))?;
        tracing::info!(workers = pool.num_workers(), "starting worker threads");
        handler.start(&pool);
        handler.wait(&pool);
        pool.wrap_up();
        handler.report(&pool, logger);
        pool.first_error()
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}
