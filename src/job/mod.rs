// # Job Data Model
//
// A job describes one measurement run: how many pinned workers, which
// access pattern each runs, where the backing memory lives, and how the
// buffers are allocated. Descriptors arrive as YAML with integer-coded
// enumerations; every code is decoded through `TryFrom<u32>` so invalid
// values become a `Config` error before any worker thread is spawned.

pub mod manager;

use serde::Deserialize;

use crate::error::{BenchError, Result};
use crate::util::numa;

pub use manager::JobManager;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Job class. The numeric values are the wire codes of the job file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum JobKind {
    /// One latency worker measured against N-1 bandwidth workers.
    BandwidthLatency = 100,
    Bandwidth = 101,
    Latency = 102,
    /// Kernel-space pointer chase over physical addresses.
    PointerChase = 200,
}

impl TryFrom<u32> for JobKind {
    type Error = BenchError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            100 => Ok(JobKind::BandwidthLatency),
            101 => Ok(JobKind::Bandwidth),
            102 => Ok(JobKind::Latency),
            200 => Ok(JobKind::PointerChase),
            other => Err(BenchError::Config(format!("invalid job_id: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LoadStoreType {
    Load = 0,
    Store = 1,
    NtLoad = 2,
    NtStore = 3,
    LoadWithFlush = 4,
    StoreWithFlush = 5,
}

impl TryFrom<u32> for LoadStoreType {
    type Error = BenchError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            0 => Ok(LoadStoreType::Load),
            1 => Ok(LoadStoreType::Store),
            2 => Ok(LoadStoreType::NtLoad),
            3 => Ok(LoadStoreType::NtStore),
            4 => Ok(LoadStoreType::LoadWithFlush),
            5 => Ok(LoadStoreType::StoreWithFlush),
            other => Err(BenchError::Config(format!(
                "invalid loadstore_type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemAllocType {
    ContiguousHugePage = 0,
    NonContiguousHugePage = 1,
}

impl TryFrom<u32> for MemAllocType {
    type Error = BenchError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            0 => Ok(MemAllocType::ContiguousHugePage),
            1 => Ok(MemAllocType::NonContiguousHugePage),
            other => Err(BenchError::Config(format!(
                "invalid mem_alloc_type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LatencyPattern {
    Stride = 0,
    RandomPointerChase = 1,
}

impl TryFrom<u32> for LatencyPattern {
    type Error = BenchError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            0 => Ok(LatencyPattern::Stride),
            1 => Ok(LatencyPattern::RandomPointerChase),
            other => Err(BenchError::Config(format!(
                "invalid latency_pattern: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BwPattern {
    Stride = 0,
    SimpleBulk = 1,
}

impl TryFrom<u32> for BwPattern {
    type Error = BenchError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            0 => Ok(BwPattern::Stride),
            1 => Ok(BwPattern::SimpleBulk),
            other => Err(BenchError::Config(format!(
                "invalid bandwidth_pattern: {other}"
            ))),
        }
    }
}

/// Access block width of the bulk load/store primitives. One cache line up
/// to eight, matching the widths the per-arch primitives are unrolled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum BlockWidth {
    B64 = 64,
    B128 = 128,
    B256 = 256,
    B512 = 512,
}

impl BlockWidth {
    #[inline]
    pub fn bytes(self) -> u64 {
        self as u64
    }

    /// Index into the per-width primitive tables.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            BlockWidth::B64 => 0,
            BlockWidth::B128 => 1,
            BlockWidth::B256 => 2,
            BlockWidth::B512 => 3,
        }
    }
}

impl TryFrom<u64> for BlockWidth {
    type Error = BenchError;

    fn try_from(bytes: u64) -> Result<Self> {
        match bytes {
            64 => Ok(BlockWidth::B64),
            128 => Ok(BlockWidth::B128),
            256 => Ok(BlockWidth::B256),
            512 => Ok(BlockWidth::B512),
            other => Err(BenchError::Config(format!(
                "invalid block size: {other} (expected 64/128/256/512)"
            ))),
        }
    }
}

/// Core topology used to map `(socket, worker_index)` to a core id.
///
/// Workers fill the physical cores of the target socket first; indices past
/// `cores_per_socket` wrap onto the hyperthread-sibling range.
#[derive(Debug, Clone, Copy)]
pub struct CoreLayout {
    pub cores_per_socket: usize,
    pub sockets: usize,
}

impl Default for CoreLayout {
    fn default() -> Self {
        Self {
            cores_per_socket: 10,
            sockets: 2,
        }
    }
}

impl CoreLayout {
    pub fn core_for(&self, socket_id: u32, worker_index: usize) -> usize {
        let mut base = socket_id as usize * self.cores_per_socket;
        if worker_index >= self.cores_per_socket {
            base += (self.sockets - 1) * self.cores_per_socket + 1;
        }
        base + worker_index
    }
}

/// Immutable description of one measurement run.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub kind: JobKind,
    pub num_threads: u32,
    pub lt_block_size: BlockWidth,
    pub lt_access_size: u64,
    pub lt_stride_size: u64,
    /// Requested inter-access delay in nanoseconds.
    pub delay_ns: u64,
    pub numa_node: u32,
    pub socket_id: u32,
    pub ldst_type: LoadStoreType,
    pub alloc_type: MemAllocType,
    pub latency_pattern: LatencyPattern,
    pub bw_pattern: BwPattern,
    pub bw_load_block: BlockWidth,
    pub bw_store_block: BlockWidth,
    pub pattern_iteration: u32,
    /// Per-thread buffer size in bytes (declared in MiB in the job file).
    pub thread_buffer_size: u64,
    /// Bandwidth measurement window in seconds.
    pub measure_secs: u64,
    pub layout: CoreLayout,
}

/// Raw job file as it appears on disk: integer codes, buffer size in MiB.
#[derive(Debug, Deserialize)]
struct RawJob {
    job_id: u32,
    num_threads: u32,
    lt_pattern_block_size: u64,
    lt_pattern_access_size: u64,
    lt_pattern_stride_size: u64,
    numa_type: u32,
    socket_type: u32,
    delay: u64,
    loadstore_type: u32,
    mem_alloc_type: u32,
    latency_pattern: u32,
    bandwidth_pattern: u32,
    bw_load_pattern_block_size: u64,
    bw_store_pattern_block_size: u64,
    pattern_iteration: u32,
    thread_buffer_size: u64,
    #[serde(default = "default_measure_secs")]
    measure_secs: u64,
    #[serde(default)]
    cores_per_socket: Option<usize>,
    #[serde(default)]
    sockets: Option<usize>,
}

fn default_measure_secs() -> u64 {
    10
}

impl TryFrom<RawJob> for JobInfo {
    type Error = BenchError;

    fn try_from(raw: RawJob) -> Result<Self> {
        let mut layout = CoreLayout::default();
        if let Some(cores) = raw.cores_per_socket {
            layout.cores_per_socket = cores;
        }
        if let Some(sockets) = raw.sockets {
            layout.sockets = sockets;
        }
        Ok(JobInfo {
            kind: JobKind::try_from(raw.job_id)?,
            num_threads: raw.num_threads,
            lt_block_size: BlockWidth::try_from(raw.lt_pattern_block_size)?,
            lt_access_size: raw.lt_pattern_access_size,
            lt_stride_size: raw.lt_pattern_stride_size,
            delay_ns: raw.delay,
            numa_node: raw.numa_type,
            socket_id: raw.socket_type,
            ldst_type: LoadStoreType::try_from(raw.loadstore_type)?,
            alloc_type: MemAllocType::try_from(raw.mem_alloc_type)?,
            latency_pattern: LatencyPattern::try_from(raw.latency_pattern)?,
            bw_pattern: BwPattern::try_from(raw.bandwidth_pattern)?,
            bw_load_block: BlockWidth::try_from(raw.bw_load_pattern_block_size)?,
            bw_store_block: BlockWidth::try_from(raw.bw_store_pattern_block_size)?,
            pattern_iteration: raw.pattern_iteration,
            thread_buffer_size: raw.thread_buffer_size * MIB,
            measure_secs: raw.measure_secs,
            layout,
        })
    }
}

impl JobInfo {
    /// Decode and validate a job file.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let raw: RawJob = serde_yaml::from_str(text)
            .map_err(|err| BenchError::Config(format!("failed to parse job file: {err}")))?;
        let job = JobInfo::try_from(raw)?;
        job.validate()?;
        Ok(job)
    }

    /// Reject anything that would spawn workers with unusable parameters.
    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(BenchError::Config("num_threads must be >= 1".into()));
        }
        if self.kind == JobKind::BandwidthLatency && self.num_threads < 2 {
            return Err(BenchError::Config(
                "bandwidth-vs-latency jobs need at least 2 threads".into(),
            ));
        }
        if self.lt_access_size == 0 || self.lt_stride_size == 0 {
            return Err(BenchError::Config(
                "access size and stride must be non-zero".into(),
            ));
        }
        if self.thread_buffer_size == 0 {
            return Err(BenchError::Config("thread_buffer_size must be > 0".into()));
        }
        if self.is_latency_class() && self.pattern_iteration < 2 {
            // The stride-latency mean discards the warm-up sweep, so a
            // single iteration would divide by zero.
            return Err(BenchError::Config(
                "latency jobs require pattern_iteration >= 2".into(),
            ));
        }
        if self.socket_id as usize >= self.layout.sockets {
            return Err(BenchError::Config(format!(
                "socket id {} out of range (layout has {} sockets)",
                self.socket_id, self.layout.sockets
            )));
        }
        let online = numa::online_nodes();
        if !online.is_empty() && !online.contains(&self.numa_node) {
            return Err(BenchError::Config(format!(
                "NUMA node {} is not online (online: {online:?})",
                self.numa_node
            )));
        }
        Ok(())
    }

    pub fn is_latency_class(&self) -> bool {
        matches!(self.kind, JobKind::Latency | JobKind::BandwidthLatency)
    }

    /// Derived number of accesses per sweep before clamping.
    pub fn access_count(&self) -> u64 {
        self.thread_buffer_size / self.lt_access_size
    }

    /// The test-info preamble appended to the result log, enumerating every
    /// job field.
    pub fn test_info(&self) -> String {
        let access_type = if self.socket_id == self.numa_node {
            format!("LOCAL_{}_{}", self.socket_id, self.numa_node)
        } else {
            format!("REMOTE_{}_{}", self.socket_id, self.numa_node)
        };
        format!(
            "===========================================================================================\n\
             Test Information:\n\
             Buffer Size: {}MiB\n\
             Number of Threads: {}\n\
             Job Id: {}\n\
             Access Type: {}\n\
             LoadStore Type: {:?}\n\
             Block Size: {} bytes\n\
             Access Size: {} bytes\n\
             Stride Size: {} bytes\n\
             Delay: {} ns\n\
             Pattern Iteration: {}\n\
             Mem alloc Type: {:?}\n\
             Latency Pattern: {:?}\n\
             Bandwidth Pattern: {:?}\n\
             Bandwidth Load Pattern Block Size: {} bytes\n\
             Bandwidth Store Pattern Block Size: {} bytes\n\
             Measure Window: {} s\n\
             ===========================================================================================",
            self.thread_buffer_size / MIB,
            self.num_threads,
            self.kind as u32,
            access_type,
            self.ldst_type,
            self.lt_block_size.bytes(),
            self.lt_access_size,
            self.lt_stride_size,
            self.delay_ns,
            self.pattern_iteration,
            self.alloc_type,
            self.latency_pattern,
            self.bw_pattern,
            self.bw_load_block.bytes(),
            self.bw_store_block.bytes(),
            self.measure_secs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        "job_id: 101\n\
         num_threads: 2\n\
         lt_pattern_block_size: 64\n\
         lt_pattern_access_size: 64\n\
         lt_pattern_stride_size: 4096\n\
         numa_type: 0\n\
         socket_type: 0\n\
         delay: 0\n\
         loadstore_type: 0\n\
         mem_alloc_type: 1\n\
         latency_pattern: 0\n\
         bandwidth_pattern: 1\n\
         bw_load_pattern_block_size: 256\n\
         bw_store_pattern_block_size: 256\n\
         pattern_iteration: 8\n\
         thread_buffer_size: 64\n"
    }

    #[test]
    fn parses_a_complete_job_file() {
        let job = JobInfo::from_yaml_str(sample_yaml()).unwrap();
        assert_eq!(job.kind, JobKind::Bandwidth);
        assert_eq!(job.num_threads, 2);
        assert_eq!(job.thread_buffer_size, 64 * MIB);
        assert_eq!(job.bw_load_block, BlockWidth::B256);
        assert_eq!(job.ldst_type, LoadStoreType::Load);
        assert_eq!(job.measure_secs, 10);
    }

    #[test]
    fn rejects_invalid_block_size() {
        let text = sample_yaml().replace("lt_pattern_block_size: 64", "lt_pattern_block_size: 73");
        let err = JobInfo::from_yaml_str(&text).unwrap_err();
        assert!(matches!(err, BenchError::Config(_)), "got {err:?}");
    }

    #[test]
    fn rejects_unknown_enum_codes() {
        let text = sample_yaml().replace("loadstore_type: 0", "loadstore_type: 9");
        assert!(JobInfo::from_yaml_str(&text).is_err());

        let text = sample_yaml().replace("job_id: 101", "job_id: 103");
        assert!(JobInfo::from_yaml_str(&text).is_err());
    }

    #[test]
    fn rejects_single_iteration_latency_job() {
        let text = sample_yaml()
            .replace("job_id: 101", "job_id: 102")
            .replace("pattern_iteration: 8", "pattern_iteration: 1");
        let err = JobInfo::from_yaml_str(&text).unwrap_err();
        assert!(matches!(err, BenchError::Config(_)));
    }

    #[test]
    fn bandwidth_vs_latency_needs_two_threads() {
        let text = sample_yaml()
            .replace("job_id: 101", "job_id: 100")
            .replace("num_threads: 2", "num_threads: 1");
        assert!(JobInfo::from_yaml_str(&text).is_err());
    }

    #[test]
    fn core_layout_maps_sockets_and_wraps() {
        let layout = CoreLayout {
            cores_per_socket: 10,
            sockets: 2,
        };
        assert_eq!(layout.core_for(0, 0), 0);
        assert_eq!(layout.core_for(0, 9), 9);
        assert_eq!(layout.core_for(1, 0), 10);
        // Past the physical cores the index wraps onto the sibling range.
        assert_eq!(layout.core_for(0, 10), 21);
    }

    #[test]
    fn block_width_codes() {
        assert_eq!(BlockWidth::try_from(128).unwrap(), BlockWidth::B128);
        assert_eq!(BlockWidth::B512.index(), 3);
        assert!(BlockWidth::try_from(96).is_err());
    }

    #[test]
    fn test_info_mentions_every_field() {
        let job = JobInfo::from_yaml_str(sample_yaml()).unwrap();
        let info = job.test_info();
        assert!(info.contains("Buffer Size: 64MiB"));
        assert!(info.contains("Number of Threads: 2"));
        assert!(info.contains("Access Type: LOCAL_0_0"));
        assert!(info.contains("Bandwidth Load Pattern Block Size: 256"));
    }
}
