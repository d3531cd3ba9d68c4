//! Benchmarks for the I/O queue and the traversal engine
//!
//! Run with: cargo bench

use bfs_walker::ioq::{Ioq, Op, Payload};
use bfs_walker::{walk, WalkControl, WalkOptions};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::fs;

fn benchmark_nop_round_trip(c: &mut Criterion) {
    // Light nops measure pure queue overhead, heavy nops add one syscall
    // per request, bracketing what a real open costs.
    for (name, heavy) in [("ioq_nop_light", false), ("ioq_nop_heavy", true)] {
        c.bench_function(name, |b| {
            let ioq = Ioq::new(64, 2).unwrap();
            let mut token = 0u64;
            b.iter(|| {
                ioq.submit(token, Op::Nop { heavy }).unwrap();
                token += 1;
                let completion = ioq.wait().unwrap();
                assert!(matches!(completion.payload, Payload::Nop));
                black_box(completion.seq);
            })
        });
    }
}

fn benchmark_nop_batched(c: &mut Criterion) {
    c.bench_function("ioq_nop_batch_32", |b| {
        let ioq = Ioq::new(64, 4).unwrap();
        let mut token = 0u64;
        b.iter(|| {
            for _ in 0..32 {
                ioq.submit(token, Op::Nop { heavy: false }).unwrap();
                token += 1;
            }
            for _ in 0..32 {
                black_box(ioq.wait().unwrap());
            }
        })
    });
}

fn benchmark_walk_small_tree(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("bench");
    for a in 0..8 {
        for b in 0..8 {
            let leaf = root.join(format!("d{a}")).join(format!("e{b}"));
            fs::create_dir_all(&leaf).unwrap();
            for f in 0..4 {
                fs::write(leaf.join(format!("f{f}")), b"").unwrap();
            }
        }
    }

    c.bench_function("walk_small_tree", |b| {
        let options = WalkOptions::new([&root]);
        b.iter(|| {
            let mut count = 0u64;
            walk(&options, |visit| {
                black_box(visit.depth());
                count += 1;
                WalkControl::Continue
            })
            .unwrap();
            assert_eq!(count, 1 + 8 + 64 + 256);
        })
    });
}

criterion_group!(
    benches,
    benchmark_nop_round_trip,
    benchmark_nop_batched,
    benchmark_walk_small_tree
);
criterion_main!(benches);
