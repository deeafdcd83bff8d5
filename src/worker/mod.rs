// # Worker Pool
//
// One pinned, real-time-priority thread per worker. Threads are spawned at
// pool initialization and immediately block on their context's `ready`
// condition until the handler installs a work function; each worker then
// allocates its private buffer on the target node, materialises the pages,
// runs the installed pattern, and releases the buffer. The buffer is owned
// by a `Region` guard, so it is returned to the allocator on every exit
// path, including unwinds.
//
// Coordination per worker is a mutex plus three conditions:
// `ready` (handler -> worker: work installed), `subop_stop` (handler ->
// worker: measurement window over), `complete` (worker -> handler: latency
// measurement finished). The stop flag and the completion flag live under
// the mutex, so no notification can be missed.

use std::os::unix::thread::JoinHandleExt;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::error::{BenchError, Result};
use crate::job::{BlockWidth, BwPattern, JobInfo, LatencyPattern, LoadStoreType, MemAllocType};
use crate::mem::{MemAllocator, Span};

/// The per-worker measurement installed by a handler.
pub type WorkFn = Box<dyn FnOnce(&WorkerContext, Span) -> Result<()> + Send>;

/// Bytes touched and nanoseconds spent, accumulated by the running pattern.
#[derive(Debug, Default)]
pub struct TestLog {
    bytes: AtomicU64,
    nanos: AtomicU64,
}

impl TestLog {
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn nanos(&self) -> u64 {
        self.nanos.load(Ordering::Relaxed)
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_nanos(&self, nanos: u64) {
        self.nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn set_nanos(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
        self.nanos.store(0, Ordering::Relaxed);
    }
}

/// State guarded by the worker's mutex.
#[derive(Default)]
pub struct WorkerShared {
    pub work: Option<WorkFn>,
    pub stop: bool,
    pub completed: bool,
    pub error: Option<BenchError>,
}

/// Everything one worker needs: identity, the pattern parameters copied
/// from the job, the coordination primitives, and the measurement log.
pub struct WorkerContext {
    pub worker_index: usize,
    pub core_id: usize,
    pub buffer_size: u64,
    pub lt_access_size: u64,
    pub lt_block_size: BlockWidth,
    pub lt_stride_size: u64,
    pub delay_ns: u64,
    pub access_count: u64,
    pub ldst_type: LoadStoreType,
    pub latency_pattern: LatencyPattern,
    pub bw_pattern: BwPattern,
    pub bw_load_block: BlockWidth,
    pub bw_store_block: BlockWidth,
    pub numa_node: u32,
    pub socket_id: u32,
    pub alloc_type: MemAllocType,
    pub pattern_iteration: u32,

    pub shared: Mutex<WorkerShared>,
    pub ready: Condvar,
    pub subop_stop: Condvar,
    pub complete: Condvar,
    pub log: TestLog,
}

impl WorkerContext {
    pub fn from_job(job: &JobInfo, worker_index: usize) -> Self {
        Self {
            worker_index,
            core_id: job.layout.core_for(job.socket_id, worker_index),
            buffer_size: job.thread_buffer_size,
            lt_access_size: job.lt_access_size,
            lt_block_size: job.lt_block_size,
            lt_stride_size: job.lt_stride_size,
            delay_ns: job.delay_ns,
            access_count: job.access_count(),
            ldst_type: job.ldst_type,
            latency_pattern: job.latency_pattern,
            bw_pattern: job.bw_pattern,
            bw_load_block: job.bw_load_block,
            bw_store_block: job.bw_store_block,
            numa_node: job.numa_node,
            socket_id: job.socket_id,
            alloc_type: job.alloc_type,
            pattern_iteration: job.pattern_iteration,
            shared: Mutex::new(WorkerShared::default()),
            ready: Condvar::new(),
            subop_stop: Condvar::new(),
            complete: Condvar::new(),
            log: TestLog::default(),
        }
    }

    /// True once the worker's stop flag has been raised.
    pub fn stop_requested(&self) -> bool {
        self.shared.lock().stop
    }
}

pub struct WorkerPool {
    contexts: Vec<Arc<WorkerContext>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create the contexts, spawn one thread per worker, and pin each
    /// thread to its core at real-time priority. Affinity or priority
    /// failures are logged and the measurement proceeds.
    pub fn initialize(job: &JobInfo, allocator: Arc<MemAllocator>) -> Result<Self> {
        let contexts: Vec<_> = (0..job.num_threads as usize)
            .map(|i| Arc::new(WorkerContext::from_job(job, i)))
            .collect();

        let mut threads = Vec::with_capacity(contexts.len());
        for (index, ctx) in contexts.iter().enumerate() {
            let ctx_for_thread = Arc::clone(ctx);
            let allocator = Arc::clone(&allocator);
            let handle = thread::Builder::new()
                .name(format!("tierbench-worker-{index}"))
                .spawn(move || worker_loop(ctx_for_thread, allocator))?;
            configure_thread(&handle, ctx.core_id, index);
            threads.push(handle);
        }

        Ok(Self { contexts, threads })
    }

    pub fn contexts(&self) -> &[Arc<WorkerContext>] {
        &self.contexts
    }

    pub fn num_workers(&self) -> usize {
        self.contexts.len()
    }

    /// Install the work function for every worker and release them.
    pub fn start<F>(&self, make_work: F)
    where
        F: Fn(usize) -> WorkFn,
    {
        for (index, ctx) in self.contexts.iter().enumerate() {
            {
                let mut shared = ctx.shared.lock();
                shared.work = Some(make_work(index));
            }
            ctx.ready.notify_all();
        }
    }

    /// Raise the stop flag of workers `first..` and wake their bounded
    /// waits.
    pub fn stop_from(&self, first: usize) {
        for ctx in self.contexts.iter().skip(first) {
            {
                let mut shared = ctx.shared.lock();
                shared.stop = true;
            }
            ctx.subop_stop.notify_all();
        }
    }

    /// Block until the given worker has signalled `complete`.
    pub fn wait_complete(&self, index: usize) {
        let ctx = &self.contexts[index];
        let mut shared = ctx.shared.lock();
        while !shared.completed {
            ctx.complete.wait(&mut shared);
        }
    }

    /// Join every worker thread. After this returns no worker is alive and
    /// no buffer remains allocated.
    pub fn wrap_up(&mut self) {
        for (index, handle) in self.threads.drain(..).enumerate() {
            if handle.join().is_err() {
                warn!(worker = index, "worker thread panicked");
            }
        }
    }

    /// The first non-affinity error any worker recorded.
    pub fn first_error(&self) -> Result<()> {
        for ctx in &self.contexts {
            let mut shared = ctx.shared.lock();
            if let Some(err) = shared.error.take() {
                return Err(err);
            }
        }
        Ok(())
    }
}

fn worker_loop(ctx: Arc<WorkerContext>, allocator: Arc<MemAllocator>) {
    let work = {
        let mut shared = ctx.shared.lock();
        loop {
            if let Some(work) = shared.work.take() {
                break work;
            }
            ctx.ready.wait(&mut shared);
        }
    };

    if let Err(err) = run_measurement(&ctx, &allocator, work) {
        warn!(worker = ctx.worker_index, %err, "worker failed");
        ctx.log.reset();
        let mut shared = ctx.shared.lock();
        shared.error = Some(err);
        // Unblock an orchestrator waiting on this worker's completion.
        shared.completed = true;
        ctx.complete.notify_all();
    }
}

fn run_measurement(ctx: &WorkerContext, allocator: &MemAllocator, work: WorkFn) -> Result<()> {
    let region = allocator.allocate(ctx.buffer_size as usize, ctx.numa_node, ctx.alloc_type)?;
    if !region.is_empty() {
        // Touch every page with a nonzero byte so the mapping is backed
        // before the first timed access.
        unsafe {
            ptr::write_bytes(region.base(), 1, region.len());
        }
    }
    let span = region.span();
    let result = work(ctx, span);
    allocator.deallocate(region);
    result
}

/// Pin the thread to `core_id` and raise it to the SCHED_FIFO maximum.
/// Both operations are best-effort; failure is reported and the worker
/// stays on the default scheduler.
fn configure_thread(handle: &JoinHandle<()>, core_id: usize, index: usize) {
    let pthread = handle.as_pthread_t();

    if core_id >= num_cpus::get() {
        warn!(
            worker = index,
            core_id,
            online = num_cpus::get(),
            "target core is not present on this host"
        );
    }

    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(core_id, &mut cpuset);
        let rc =
            libc::pthread_setaffinity_np(pthread, std::mem::size_of::<libc::cpu_set_t>(), &cpuset);
        if rc != 0 {
            warn!(worker = index, core_id, rc, "failed to set CPU affinity");
        } else {
            info!(worker = index, core_id, "worker pinned");
        }

        let param = libc::sched_param {
            sched_priority: libc::sched_get_priority_max(libc::SCHED_FIFO),
        };
        let rc = libc::pthread_setschedparam(pthread, libc::SCHED_FIFO, &param);
        if rc != 0 {
            warn!(worker = index, rc, "failed to raise to SCHED_FIFO");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;

    fn small_job() -> JobInfo {
        JobInfo {
            kind: JobKind::Latency,
            num_threads: 2,
            lt_block_size: BlockWidth::B64,
            lt_access_size: 64,
            lt_stride_size: 4096,
            delay_ns: 0,
            numa_node: 0,
            socket_id: 0,
            ldst_type: LoadStoreType::Load,
            alloc_type: MemAllocType::NonContiguousHugePage,
            latency_pattern: LatencyPattern::Stride,
            bw_pattern: BwPattern::SimpleBulk,
            bw_load_block: BlockWidth::B256,
            bw_store_block: BlockWidth::B256,
            pattern_iteration: 2,
            thread_buffer_size: 1 << 20,
            measure_secs: 1,
            layout: Default::default(),
        }
    }

    #[test]
    fn workers_run_installed_functions_and_release_buffers() {
        let job = small_job();
        let allocator = Arc::new(MemAllocator::new());
        let mut pool = WorkerPool::initialize(&job, allocator).unwrap();

        pool.start(|_index| {
            Box::new(|ctx: &WorkerContext, span: Span| {
                assert_eq!(span.len() as u64, ctx.buffer_size);
                // Pages were materialised with a nonzero byte.
                unsafe {
                    assert_eq!(*span.base(), 1);
                }
                ctx.log.add_bytes(span.len() as u64);
                ctx.log.add_nanos(1);
                Ok(())
            })
        });
        pool.wrap_up();
        pool.first_error().unwrap();

        for ctx in pool.contexts() {
            assert_eq!(ctx.log.bytes(), 1 << 20);
        }
    }

    #[test]
    fn worker_errors_reset_the_log_and_surface_once() {
        let job = small_job();
        let allocator = Arc::new(MemAllocator::new());
        let mut pool = WorkerPool::initialize(&job, allocator).unwrap();

        pool.start(|index| {
            Box::new(move |ctx: &WorkerContext, _span: Span| {
                ctx.log.add_bytes(123);
                if index == 0 {
                    Err(BenchError::UnknownPattern("injected".into()))
                } else {
                    Ok(())
                }
            })
        });
        pool.wrap_up();

        let err = pool.first_error().unwrap_err();
        assert!(matches!(err, BenchError::UnknownPattern(_)));
        // Failed worker reports (0, 0); the healthy one keeps its log.
        assert_eq!(pool.contexts()[0].log.bytes(), 0);
        assert_eq!(pool.contexts()[1].log.bytes(), 123);
        // A second query finds nothing: the error was taken.
        pool.first_error().unwrap();
    }

    #[test]
    fn stop_flag_is_visible_under_the_mutex() {
        let job = small_job();
        let allocator = Arc::new(MemAllocator::new());
        let mut pool = WorkerPool::initialize(&job, allocator).unwrap();

        pool.start(|_| {
            Box::new(|ctx: &WorkerContext, _span: Span| {
                while !ctx.stop_requested() {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Ok(())
            })
        });
        pool.stop_from(0);
        pool.wrap_up();
        pool.first_error().unwrap();
        for ctx in pool.contexts() {
            assert!(ctx.stop_requested());
        }
    }

    #[test]
    fn wait_complete_returns_after_worker_signals() {
        let job = small_job();
        let allocator = Arc::new(MemAllocator::new());
        let mut pool = WorkerPool::initialize(&job, allocator).unwrap();

        pool.start(|_| {
            Box::new(|ctx: &WorkerContext, _span: Span| {
                let mut shared = ctx.shared.lock();
                shared.completed = true;
                ctx.complete.notify_all();
                Ok(())
            })
        });
        pool.wait_complete(0);
        pool.wait_complete(1);
        pool.wrap_up();
    }
}
