//! Plan and driver Criterion benchmarks.
//!
//! Measures plan resolution for wide and deep graphs, and the cost of a
//! keyed persist build when the state is cold versus already stored.
//!
//! Run with: cargo bench --bench plan_bench

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use stratum_core::connector::{Catalog, MemoryConnector, MemoryScanner, MemoryTable};
use stratum_core::plan::{Function, NodeKind, PlanBuilder, UnionNode};
use stratum_core::storage::HeapStateStorage;
use stratum_core::types::{Field, FieldType, Key, Value};
use stratum_core::{Driver, DriverConfig};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fields() -> Vec<Field> {
    vec![Field::new("id", FieldType::Long), Field::new("x", FieldType::Long)]
}

fn pass() -> Function {
    Function::new("pass", FieldType::Boolean, |_| Value::Boolean(true))
}

/// `scan -> filter_0 -> ... -> filter_{depth-1} -> persist`.
fn deep(depth: usize) -> PlanBuilder {
    let mut builder = PlanBuilder::new().scan("scan", "t", fields(), &["id"]);
    let mut prev = "scan".to_string();
    for i in 0..depth {
        let name = format!("filter_{i}");
        builder = builder.filter(&name, &prev, pass(), &["x"]);
        prev = name;
    }
    builder.persist("persist", &prev, &["id"])
}

/// `width` scans feeding one union, then a persist.
fn wide(width: usize) -> PlanBuilder {
    let mut builder = PlanBuilder::new();
    let mut sources = Vec::with_capacity(width);
    for i in 0..width {
        let name = format!("scan_{i}");
        builder = builder.scan(&name, "t", fields(), &["id"]);
        sources.push(name);
    }
    builder
        .node(
            "union",
            NodeKind::Union(UnionNode {
                sources,
                index_field: Some("src".into()),
            }),
        )
        .persist("persist", "union", &["src", "id"])
}

fn driver(rows: i64) -> (Driver, Arc<MemoryTable>) {
    let table = Arc::new(MemoryTable::new());
    for id in 0..rows {
        table.insert([("id", id), ("x", id * 10)]);
    }
    let mut catalog = Catalog::new();
    catalog
        .register_connector(Arc::new(MemoryConnector::new("mem")))
        .unwrap();
    catalog
        .register_table("t", "mem", Arc::new(MemoryScanner::new(Arc::clone(&table))))
        .unwrap();
    let plan = deep(2).build("persist").unwrap();
    let driver = Driver::new(
        Arc::new(plan),
        Arc::new(catalog),
        Arc::new(HeapStateStorage::new()),
        DriverConfig::default(),
    )
    .unwrap();
    (driver, table)
}

// ---------------------------------------------------------------------------
// Plan resolution
// ---------------------------------------------------------------------------

fn bench_plan_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_build");
    for size in [8, 64, 256] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("deep", size), &size, |b, &size| {
            b.iter(|| black_box(deep(size).build("persist").unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("wide", size), &size, |b, &size| {
            b.iter(|| black_box(wide(size).build("persist").unwrap()));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Keyed builds
// ---------------------------------------------------------------------------

fn bench_persist_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("persist_build");
    group.throughput(Throughput::Elements(1));

    let (cold, _table) = driver(1024);
    group.bench_function("cold", |b| {
        let mut id = 0i64;
        b.iter(|| {
            let mut ctx = cold.create_context();
            let rows = ctx.build_by_name("persist", &Key::of([("id", id % 1024)])).unwrap();
            id += 1;
            black_box(rows);
        });
    });

    let (stored, _table) = driver(1024);
    let mut ctx = stored.create_context();
    ctx.build_by_name("persist", &Key::All).unwrap();
    ctx.commit().unwrap();
    drop(ctx);
    group.bench_function("stored", |b| {
        let mut id = 0i64;
        b.iter(|| {
            let mut ctx = stored.create_context();
            let rows = ctx.build_by_name("persist", &Key::of([("id", id % 1024)])).unwrap();
            id += 1;
            black_box(rows);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_plan_build, bench_persist_build);
criterion_main!(benches);
