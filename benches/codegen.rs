//! Code-emission benchmark: graph construction plus one fused emission
//! pass for synthetic expression chains. No GPU required.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use riptide::{fused_preview, Expr, Graph};

/// Build a chain of `n` alternating arithmetic/transcendental ops.
fn synthetic_chain(g: &Graph, n: usize) -> Expr {
    let mut expr = g.lit(1.5);
    for i in 0..n {
        expr = match i % 5 {
            0 => expr + 1.0,
            1 => expr * 0.5,
            2 => expr.exp(),
            3 => expr.abs().sqrt(),
            4 => expr - 0.25,
            _ => unreachable!(),
        };
    }
    expr
}

fn bench_emit_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("emit_chain");
    for &n in &[16usize, 64, 256] {
        group.bench_function(format!("{}_ops", n), |b| {
            b.iter(|| {
                let g = Graph::new();
                let expr = synthetic_chain(&g, black_box(n));
                fused_preview(&[&expr])
            })
        });
    }
    group.finish();
}

fn bench_emit_shared(c: &mut Criterion) {
    c.bench_function("emit_two_destinations_shared_base", |b| {
        b.iter(|| {
            let g = Graph::new();
            let shared = synthetic_chain(&g, black_box(64));
            let a = &shared + 1.0;
            let b2 = &shared * 3.0;
            fused_preview(&[&a, &b2])
        })
    });
}

criterion_group!(benches, bench_emit_chain, bench_emit_shared);
criterion_main!(benches);
