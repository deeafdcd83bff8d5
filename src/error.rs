use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("config error: {0}")]
    Config(String),

    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("affinity error: {0}")]
    Affinity(String),

    #[error("unknown pattern: {0}")]
    UnknownPattern(String),

    #[error("pointer-chase chain construction exceeded {0:?}")]
    ChainBuildTimeout(Duration),

    #[error("kernel ioctl failed: {0}")]
    KernelIoctl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Allocator sub-kinds, one per failing stage of the allocation pipelines.
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("mmap failed: {0}")]
    Mmap(std::io::Error),

    #[error("NUMA bind to node {node} failed: {source}")]
    NumaBind { node: u32, source: std::io::Error },

    #[error("hugepage reservation failed: {0}")]
    HugepageReserve(String),

    #[error("hugetlbfs mount failed: {0}")]
    Mount(std::io::Error),

    #[error("hugepage map failed: {0}")]
    Map(std::io::Error),

    #[error("pagemap read failed: {0}")]
    Pagemap(std::io::Error),

    #[error("mremap failed at page {page}: {source}")]
    Mremap { page: usize, source: std::io::Error },

    #[error("no physically contiguous run of {needed} pages after {retries} retries")]
    NoContiguousRun { needed: usize, retries: usize },
}

pub type Result<T> = std::result::Result<T, BenchError>;
