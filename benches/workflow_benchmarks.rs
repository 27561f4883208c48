//! Construction and lowering throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use docflow::{merge, workflow, DocVar, Selector, SortDir, WorkflowOp};

/// A deep chain of shape-preserving ops over one read. Coalescing collapses
/// the limits and matches as the chain is built, which is exactly the cost
/// being measured.
fn deep_plan(depth: usize) -> WorkflowOp {
    let mut op = WorkflowOp::read("events");
    for i in 0..depth {
        op = match i % 4 {
            0 => WorkflowOp::match_(op, Selector::eq("kind", json!(i as i64))),
            1 => WorkflowOp::limit(op, 1000 + i as u64),
            2 => WorkflowOp::skip(op, (i as u64) % 7),
            _ => WorkflowOp::sort(op, vec![(DocVar::field("ts"), SortDir::Descending)]),
        };
    }
    op
}

fn bench_construct_and_lower(c: &mut Criterion) {
    c.bench_function("construct_and_lower_depth_64", |b| {
        b.iter(|| workflow(black_box(deep_plan(64))).expect("lowering"));
    });
}

fn bench_merge_shared_source(c: &mut Criterion) {
    let left = deep_plan(32);
    let right = deep_plan(17);
    c.bench_function("merge_shared_source", |b| {
        b.iter(|| merge(black_box(&left), black_box(&right)).expect("merge"));
    });
}

criterion_group!(benches, bench_construct_and_lower, bench_merge_shared_source);
criterion_main!(benches);
