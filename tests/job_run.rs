// End-to-end runs of the worker-pool engine through `JobManager`, using
// small buffers and short measurement windows so they finish quickly on any
// host. The access primitives resolve to whatever the machine supports; on
// hosts without the vector extensions that is the portable mock.

use std::fs;
use std::path::Path;

use tierbench::error::BenchError;
use tierbench::job::{
    BlockWidth, BwPattern, JobInfo, JobKind, LatencyPattern, LoadStoreType, MemAllocType, MIB,
};
use tierbench::JobManager;

fn base_job(kind: JobKind) -> JobInfo {
    JobInfo {
        kind,
        num_threads: 1,
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
        pattern_iteration: 4,
        thread_buffer_size: MIB,
        measure_secs: 1,
        layout: Default::default(),
    }
}

/// The result log lives under a wall-clock-tagged subdirectory.
fn read_result_log(output_dir: &Path) -> String {
    let run_dir = fs::read_dir(output_dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    fs::read_to_string(run_dir.join("result.log")).unwrap()
}

#[test]
fn latency_job_end_to_end() {
    let out = tempfile::tempdir().unwrap();
    let job = base_job(JobKind::Latency);
    JobManager::new().run(out.path(), &job).unwrap();

    let log = read_result_log(out.path());
    assert!(log.contains("Test Information:"), "missing preamble:\n{log}");
    assert_eq!(log.matches("Worker : [").count(), 1);
    assert!(log.contains("Average Latency :"), "missing summary:\n{log}");
}

#[test]
fn bandwidth_job_emits_worker_and_total_lines() {
    let out = tempfile::tempdir().unwrap();
    let mut job = base_job(JobKind::Bandwidth);
    job.thread_buffer_size = 4 * MIB;
    JobManager::new().run(out.path(), &job).unwrap();

    let log = read_result_log(out.path());
    assert_eq!(log.matches("Worker : [").count(), 1);
    let total_line = log
        .lines()
        .find(|line| line.contains("Total Bandwidth :"))
        .expect("missing total bandwidth line");
    let mib_s: u64 = total_line
        .split("Total Bandwidth : ")
        .nth(1)
        .unwrap()
        .split(' ')
        .next()
        .unwrap()
        .parse()
        .unwrap();
    assert!(mib_s > 0, "bandwidth should be positive: {total_line}");
}

#[test]
fn bandwidth_vs_latency_stops_load_workers_after_worker_zero() {
    let out = tempfile::tempdir().unwrap();
    let mut job = base_job(JobKind::BandwidthLatency);
    job.num_threads = 2;
    JobManager::new().run(out.path(), &job).unwrap();

    let log = read_result_log(out.path());
    // One bandwidth line (worker 1), a total, and the latency of worker 0.
    assert_eq!(log.matches("Bandwidth :").count(), 2); // worker line + total
    assert!(log.contains("Measured Latency :"));
}

#[test]
fn pointer_chase_latency_runs_in_user_space() {
    let out = tempfile::tempdir().unwrap();
    let mut job = base_job(JobKind::Latency);
    job.latency_pattern = LatencyPattern::RandomPointerChase;
    job.thread_buffer_size = 64 * 1024;
    job.lt_stride_size = 64;
    job.pattern_iteration = 2;
    JobManager::new().run(out.path(), &job).unwrap();

    let log = read_result_log(out.path());
    assert!(log.contains("Average Latency :"));
}

#[test]
fn nt_load_surfaces_unknown_pattern() {
    let out = tempfile::tempdir().unwrap();
    let mut job = base_job(JobKind::Bandwidth);
    job.bw_pattern = BwPattern::Stride;
    job.ldst_type = LoadStoreType::NtLoad;
    let err = JobManager::new().run(out.path(), &job).unwrap_err();
    assert!(matches!(err, BenchError::UnknownPattern(_)), "got {err:?}");
}

#[test]
fn invalid_block_size_is_rejected_before_any_worker_spawns() {
    let yaml = "job_id: 101\n\
                num_threads: 1\n\
                lt_pattern_block_size: 73\n\
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
                thread_buffer_size: 64\n";
    let err = JobInfo::from_yaml_str(yaml).unwrap_err();
    assert!(matches!(err, BenchError::Config(_)), "got {err:?}");
}

#[test]
fn multi_worker_latency_reports_every_worker() {
    let out = tempfile::tempdir().unwrap();
    let mut job = base_job(JobKind::Latency);
    job.num_threads = 3;
    JobManager::new().run(out.path(), &job).unwrap();

    let log = read_result_log(out.path());
    assert_eq!(log.matches("Worker : [").count(), 3);
}
