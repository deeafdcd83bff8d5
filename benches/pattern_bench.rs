// Throughput of the portable mock block primitives. The mock is what CI
// and development hosts actually execute, so regressions here show up as
// skewed baselines in every measurement run on those machines.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use tierbench::arch::mock;

const BUFFER_LEN: usize = 1 << 20;

fn bench_mock_blocks(c: &mut Criterion) {
    let mut buffer = vec![1u8; BUFFER_LEN];

    let loads: [(&str, unsafe fn(*mut u8, u64)); 4] = [
        ("load_64B", mock::load_block_64),
        ("load_128B", mock::load_block_128),
        ("load_256B", mock::load_block_256),
        ("load_512B", mock::load_block_512),
    ];
    let mut group = c.benchmark_group("mock_load");
    group.throughput(Throughput::Bytes(BUFFER_LEN as u64));
    for (name, block_fn) in loads {
        group.bench_function(name, |b| {
            b.iter(|| unsafe { block_fn(buffer.as_mut_ptr(), BUFFER_LEN as u64) })
        });
    }
    group.finish();

    let stores: [(&str, unsafe fn(*mut u8, u64)); 4] = [
        ("store_64B", mock::store_block_64),
        ("store_128B", mock::store_block_128),
        ("store_256B", mock::store_block_256),
        ("store_512B", mock::store_block_512),
    ];
    let mut group = c.benchmark_group("mock_store");
    group.throughput(Throughput::Bytes(BUFFER_LEN as u64));
    for (name, block_fn) in stores {
        group.bench_function(name, |b| {
            b.iter(|| unsafe { block_fn(buffer.as_mut_ptr(), BUFFER_LEN as u64) })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_mock_blocks);
criterion_main!(benches);
