// Randomized pointer chase. The buffer is cut into `buffer / stride` slots
// and a Hamiltonian cycle over the slots is generated; for loads the cycle
// is encoded into the buffer itself, so every access depends on the value
// the previous one returned and neither the prefetcher nor memory-level
// parallelism can help. Chains are cached on disk per (worker, length) so
// repeated runs chase identical cycles.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;

use crate::arch;
use crate::error::{BenchError, Result};
use crate::mem::Span;
use crate::util::Timer;
use crate::worker::WorkerContext;

use super::{prepare, signal_complete, PatternGenerator};

pub const CHAIN_BUILD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaseOrder {
    Sequential,
    Random,
}

/// Build a Hamiltonian cycle over `len` slots as a successor table:
/// starting at slot 0 and following `chain[i]` visits every slot exactly
/// once and returns to 0. The random order draws uniform unused successors;
/// slot 0 is reserved as the closing point so an early back-edge cannot
/// short-circuit the cycle.
pub fn build_chain<R: Rng>(len: u64, order: ChaseOrder, rng: &mut R) -> Vec<u64> {
    let len_usize = len as usize;
    let mut chain = vec![0u64; len_usize];
    if len_usize < 2 {
        return chain;
    }
    let mut used = vec![false; len_usize];
    used[0] = true;

    let mut current = 0u64;
    for _ in 0..len - 1 {
        let next = match order {
            ChaseOrder::Sequential => current + 1,
            ChaseOrder::Random => loop {
                let candidate = rng.random_range(0..len);
                if !used[candidate as usize] {
                    break candidate;
                }
            },
        };
        used[next as usize] = true;
        chain[current as usize] = next;
        current = next;
    }
    // The last visited slot keeps its initial 0 entry, closing the cycle.
    chain
}

/// Check the Hamiltonian-cycle property: `len` hops from slot 0 visit every
/// slot once and land back on 0.
pub fn chain_is_cycle(chain: &[u64]) -> bool {
    let len = chain.len();
    if len == 0 {
        return false;
    }
    let mut visited = vec![false; len];
    let mut current = 0usize;
    for _ in 0..len {
        if visited[current] {
            return false;
        }
        visited[current] = true;
        let next = chain[current] as usize;
        if next >= len {
            return false;
        }
        current = next;
    }
    current == 0
}

fn cache_path(dir: &Path, worker_index: usize, len: u64) -> PathBuf {
    dir.join(format!("pointer_chase_{worker_index}_{len}.txt"))
}

fn load_cached(path: &Path, len: u64) -> Option<Vec<u64>> {
    let text = fs::read_to_string(path).ok()?;
    let chain: Vec<u64> = text
        .lines()
        .map(|line| line.trim().parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if chain.len() as u64 != len || !chain_is_cycle(&chain) {
        return None;
    }
    Some(chain)
}

fn save_cached(path: &Path, chain: &[u64]) {
    let mut text = String::with_capacity(chain.len() * 8);
    for index in chain {
        text.push_str(&index.to_string());
        text.push('\n');
    }
    if let Err(err) = fs::write(path, text) {
        tracing::warn!(%err, path = %path.display(), "failed to cache pointer-chase chain");
    }
}

/// Load the cached chain for `(worker_index, len)` or build and cache a new
/// one.
pub fn load_or_build<R: Rng>(
    dir: &Path,
    len: u64,
    worker_index: usize,
    order: ChaseOrder,
    rng: &mut R,
) -> Vec<u64> {
    let path = cache_path(dir, worker_index, len);
    if let Some(chain) = load_cached(&path, len) {
        tracing::debug!(path = %path.display(), "loaded pointer-chase chain from cache");
        return chain;
    }
    let chain = build_chain(len, order, rng);
    save_cached(&path, &chain);
    chain
}

/// Encode the cycle into the buffer: every slot receives the index of its
/// successor. Long chains carry a probabilistically-sampled two-minute
/// timeout.
///
/// # Safety
///
/// `base..end` must span at least `chain.len() * stride` bytes.
pub unsafe fn encode_chain(
    base: *mut u64,
    end: *const u64,
    stride: u64,
    chain: &[u64],
) -> Result<()> {
    let timer = Timer::new();
    let mut rng = rand::rng();
    let mut current = 0u64;
    for _ in 0..chain.len() {
        if current as usize >= chain.len() {
            return Err(BenchError::Config(format!(
                "chain index {current} out of range"
            )));
        }
        let slot = base.add((current * stride / 8) as usize);
        if slot as *const u64 >= end {
            return Err(BenchError::Config(
                "chain slot falls beyond the buffer".into(),
            ));
        }
        let next = chain[current as usize];
        *slot = next;
        current = next;

        if rng.random_range(0..10_000u32) == 0
            && timer.elapsed_ns() > CHAIN_BUILD_TIMEOUT.as_nanos() as u64
        {
            return Err(BenchError::ChainBuildTimeout(CHAIN_BUILD_TIMEOUT));
        }
    }
    Ok(())
}

fn chain_cache_dir() -> PathBuf {
    std::env::temp_dir()
}

pub struct PointerChaseLatency;

impl PatternGenerator for PointerChaseLatency {
    fn run(&self, ctx: &WorkerContext, span: Span) -> Result<()> {
        use crate::job::LoadStoreType;

        let stride = ctx.lt_stride_size;
        let block = ctx.lt_block_size.bytes();
        let buffer = span.len() as u64;
        let chain_len = buffer / stride;
        if chain_len < 2 {
            return Err(BenchError::Config(format!(
                "buffer of {buffer} bytes holds fewer than two {stride}-byte chase slots"
            )));
        }

        prepare(span);

        let mut rng = rand::rng();
        let chain = load_or_build(
            &chain_cache_dir(),
            chain_len,
            ctx.worker_index,
            ChaseOrder::Random,
            &mut rng,
        );

        let base = span.base() as *mut u64;
        let prims = arch::active();
        let repeat = ctx.pattern_iteration.max(1) as u64;
        let mut timings = vec![0u64; repeat as usize];

        match ctx.ldst_type {
            LoadStoreType::Load => {
                unsafe {
                    encode_chain(base, span.end() as *const u64, stride, &chain)?;
                }
                for timing in timings.iter_mut() {
                    *timing = unsafe { (prims.chase_load)(base, buffer, stride, block) };
                }
            }
            LoadStoreType::Store => {
                for timing in timings.iter_mut() {
                    *timing =
                        unsafe { (prims.chase_store)(base, buffer, stride, block, chain.as_ptr()) };
                }
            }
            other => {
                return Err(BenchError::UnknownPattern(format!(
                    "no pointer-chase function for {other:?}"
                )))
            }
        }

        // Mean nanoseconds per access, averaged over the repeats.
        let accesses_per_walk = buffer / block;
        if accesses_per_walk == 0 {
            return Err(BenchError::Config(format!(
                "block size {block} exceeds the {buffer}-byte buffer"
            )));
        }
        let mut latency = 0u64;
        for timing in &timings {
            latency += timing / accesses_per_walk;
        }
        ctx.log.set_nanos(latency / repeat);
        signal_complete(ctx);
        Ok(())
    }
}
