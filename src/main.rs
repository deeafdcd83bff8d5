//! # Tierbench
//!
//! Entry point for the memory-tier benchmark harness. Reads a YAML job
//! file, dispatches it to the worker-pool engine (bandwidth/latency jobs)
//! or the kernel pointer-chase collaborator (job id 200), and writes the
//! results under the output directory.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use serde::Deserialize;
use tracing::{error, info};

use tierbench::error::{BenchError, Result};
use tierbench::job::{JobInfo, JobManager};
use tierbench::kernel::{self, KernelJob};
use tierbench::util::Logger;
use tierbench::VERSION;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    info!("tierbench {VERSION}");

    let (script_path, output_path) = match parse_args() {
        Ok(paths) => paths,
        Err(err) => {
            error!(%err, "invalid arguments");
            eprintln!("Usage: tierbench -f <job.yaml> -o <output_dir>");
            return ExitCode::from(u8::MAX); // negative return in C terms
        }
    };

    match run(&script_path, &output_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ BenchError::Config(_)) => {
            error!(%err, "job rejected");
            ExitCode::from(u8::MAX)
        }
        Err(err) => {
            error!(%err, "measurement run failed");
            ExitCode::from(1)
        }
    }
}

fn parse_args() -> Result<(PathBuf, PathBuf)> {
    let mut script = None;
    let mut output = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-f" => script = args.next().map(PathBuf::from),
            "-o" => output = args.next().map(PathBuf::from),
            other => {
                return Err(BenchError::Config(format!(
                    "unknown or incomplete argument: {other}"
                )))
            }
        }
    }
    match (script, output) {
        (Some(script), Some(output)) => Ok((script, output)),
        _ => Err(BenchError::Config(
            "both -f <job.yaml> and -o <output_dir> are required".into(),
        )),
    }
}

/// Only the job id is needed to pick the execution path.
#[derive(Deserialize)]
struct JobIdProbe {
    job_id: u32,
}

fn run(script_path: &Path, output_path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(script_path)?;
    let probe: JobIdProbe = serde_yaml::from_str(&text)
        .map_err(|err| BenchError::Config(format!("failed to parse job file: {err}")))?;

    if probe.job_id == 200 {
        let job = KernelJob::from_yaml_str(&text)?;
        let mut logger = Logger::open(output_path)?;
        return kernel::run_job(&mut logger, &job);
    }

    let job = JobInfo::from_yaml_str(&text)?;
    info!(job_id = probe.job_id, "job parsed");
    JobManager::new().run(output_path, &job)
}
