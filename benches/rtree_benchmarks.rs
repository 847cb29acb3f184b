use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use celldex::{Datatype, RTree};

/// 2D leaf MBRs laid out on a row-major grid of unit tiles.
fn grid_mbrs(side: i64) -> Vec<i64> {
    let mut mbrs = Vec::with_capacity((side * side * 4) as usize);
    for r in 0..side {
        for c in 0..side {
            mbrs.extend_from_slice(&[r * 10, r * 10 + 9, c * 10, c * 10 + 9]);
        }
    }
    mbrs
}

fn benchmark_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("rtree_build");

    for side in [32i64, 100, 316] {
        let mbrs = grid_mbrs(side);
        group.bench_with_input(
            BenchmarkId::from_parameter(side * side),
            &mbrs,
            |b, mbrs| b.iter(|| RTree::build::<i64>(2, 10, black_box(mbrs)).unwrap()),
        );
    }

    group.finish();
}

fn benchmark_tile_overlap(c: &mut Criterion) {
    let mut group = c.benchmark_group("tile_overlap");

    let side = 316i64;
    let tree = RTree::build::<i64>(2, 10, &grid_mbrs(side)).unwrap();

    group.bench_function("point", |b| {
        b.iter(|| tree.get_tile_overlap(black_box(&[1555i64, 1555, 1555, 1555])))
    });

    group.bench_function("small_range", |b| {
        b.iter(|| tree.get_tile_overlap(black_box(&[1000i64, 1200, 1000, 1200])))
    });

    group.bench_function("full_domain", |b| {
        b.iter(|| tree.get_tile_overlap(black_box(&[0i64, side * 10, 0, side * 10])))
    });

    group.finish();
}

fn benchmark_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("rtree_serialize");

    let tree = RTree::build::<i64>(2, 10, &grid_mbrs(100)).unwrap();
    group.bench_function("serialize_10k", |b| b.iter(|| tree.serialize()));

    let bytes = tree.serialize();
    group.bench_function("deserialize_10k", |b| {
        b.iter(|| RTree::deserialize(black_box(&bytes), 2, 10, Datatype::Int64).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_build,
    benchmark_tile_overlap,
    benchmark_serialize
);
criterion_main!(benches);
