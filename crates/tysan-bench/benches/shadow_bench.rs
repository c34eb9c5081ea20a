//! Shadow update and check benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tysan_runtime::{Access, AccessKind, DescriptorArena, ShadowMemory, Violation, check_access};

fn sink(v: Violation) {
    black_box(v);
}

fn bench_shadow_updates(c: &mut Criterion) {
    let shadow = ShadowMemory::reserve_window(20).unwrap();
    let arena = DescriptorArena::new();
    let long = arena.scalar("long").unwrap();
    let sizes: &[usize] = &[8, 64, 512, 4096];
    let buf = vec![0u8; 2 * 4096];
    let p = buf.as_ptr() as usize;
    let mut group = c.benchmark_group("shadow_update");

    for &size in sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("set_type_unknown", size), &size, |b, &sz| {
            b.iter(|| shadow.set_type_unknown(black_box(p), sz));
        });
        group.bench_with_input(BenchmarkId::new("set_type", size), &size, |b, &sz| {
            b.iter(|| shadow.set_type(black_box(p), long, sz));
        });
        group.bench_with_input(BenchmarkId::new("copy_types", size), &size, |b, &sz| {
            b.iter(|| shadow.copy_types(black_box(p + 4096), black_box(p), sz));
        });
    }
    group.finish();
}

fn bench_check(c: &mut Criterion) {
    let shadow = ShadowMemory::reserve_window(20).unwrap();
    let arena = DescriptorArena::new();
    let long = arena.scalar("long").unwrap();
    let pair = arena.structure("Pair", &[(long, 0), (long, 8)]).unwrap();
    let m0 = arena.member(pair, long, 0);
    let m1 = arena.member(pair, long, 8);
    let buf = vec![0u8; 256];
    let p = buf.as_ptr() as usize;
    let mut group = c.benchmark_group("check_access");

    shadow.set_type_unknown(p, 256);
    let untyped = Access {
        addr: p,
        size: 8,
        ty: Some(m0),
        kind: AccessKind::Read,
    };
    group.bench_function("untyped", |b| {
        b.iter(|| check_access(&shadow, black_box(&untyped), sink));
    });

    shadow.set_type(p + 64, m0, 8);
    let matching = Access {
        addr: p + 64,
        ..untyped
    };
    group.bench_function("matching", |b| {
        b.iter(|| check_access(&shadow, black_box(&matching), sink));
    });

    shadow.set_type(p + 128, pair, 64);
    let interior = Access {
        addr: p + 190,
        size: 2,
        ty: Some(m1),
        kind: AccessKind::Write,
    };
    group.bench_function("interior_walk_62", |b| {
        b.iter(|| check_access(&shadow, black_box(&interior), sink));
    });

    group.finish();
}

criterion_group!(benches, bench_shadow_updates, bench_check);
criterion_main!(benches);
