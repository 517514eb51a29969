//! Benchmarks for handle table operations

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use om_kernel::HandleTable;

fn bench_push_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_remove");

    for live in [0usize, 16, 256].iter() {
        group.bench_with_input(BenchmarkId::new("churn", live), live, |b, &live| {
            let table: HandleTable<u64> = HandleTable::new("bench");
            for i in 0..live {
                table.push(i as u64).unwrap();
            }

            b.iter(|| {
                let h = table.push(black_box(42)).unwrap();
                black_box(table.remove(h));
            });
        });
    }

    group.finish();
}

fn bench_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("access");

    let table: HandleTable<u64> = HandleTable::new("bench");
    let handles: Vec<_> = (0..64).map(|i| table.push(i).unwrap()).collect();

    group.bench_function("is_active", |b| {
        b.iter(|| {
            for &h in &handles {
                black_box(table.is_active(h));
            }
        });
    });

    group.bench_function("read", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for &h in &handles {
                sum += *table.access(h).unwrap();
            }
            black_box(sum)
        });
    });

    group.finish();
}

fn bench_replace(c: &mut Criterion) {
    let table: HandleTable<u64, u32> = HandleTable::new("bench");
    for key in 0..32 {
        table.push_keyed(key, key as u64).unwrap();
    }

    c.bench_function("replace_or_push", |b| {
        b.iter(|| {
            black_box(table.replace_or_push(black_box(31), 7).unwrap());
        });
    });
}

criterion_group!(benches, bench_push_remove, bench_access, bench_replace);
criterion_main!(benches);
