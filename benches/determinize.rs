//! Benchmarks for the construction pipeline: union-heavy
//! determinization and the minimization strategies.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lexfsm::{Fsm, FsmCtx, Key, KeyOps};

fn keys(s: &str) -> Vec<Key> {
    s.chars().map(Key::from_char).collect()
}

/// A union of many short keywords, the shape scanners produce.
fn build_keyword_union(ctx: &mut FsmCtx, count: usize) -> Fsm {
    let mut m = Fsm::concat_fsm(ctx, &keys("kw0"));
    for i in 1..count {
        let word = format!("kw{}", i);
        let other = Fsm::concat_fsm(ctx, &keys(&word));
        m.union_op(ctx, other).unwrap();
    }
    m
}

fn bench_keyword_union(c: &mut Criterion) {
    c.bench_function("union_32_keywords", |b| {
        b.iter(|| {
            let mut ctx = FsmCtx::new(KeyOps::unsigned_octet());
            black_box(build_keyword_union(&mut ctx, 32))
        })
    });
}

fn bench_minimize_stable(c: &mut Criterion) {
    let mut ctx = FsmCtx::new(KeyOps::unsigned_octet());
    let mut built = build_keyword_union(&mut ctx, 32);
    c.bench_function("minimize_stable_32_keywords", |b| {
        b.iter(|| {
            let mut m = built.duplicate();
            m.minimize_stable(&ctx);
            black_box(m)
        })
    });
}

fn bench_minimize_partition(c: &mut Criterion) {
    let mut ctx = FsmCtx::new(KeyOps::unsigned_octet());
    let mut built = build_keyword_union(&mut ctx, 32);
    c.bench_function("minimize_partition2_32_keywords", |b| {
        b.iter(|| {
            let mut m = built.duplicate();
            m.minimize_partition2(&ctx);
            black_box(m)
        })
    });
}

fn bench_star_concat_pipeline(c: &mut Criterion) {
    c.bench_function("identifier_pipeline", |b| {
        b.iter(|| {
            let mut ctx = FsmCtx::new(KeyOps::unsigned_octet());
            let mut first = Fsm::range_fsm(&ctx, Key(b'a' as i64), Key(b'z' as i64)).unwrap();
            let mut rest = Fsm::range_fsm(&ctx, Key(b'0' as i64), Key(b'9' as i64)).unwrap();
            let tail = Fsm::range_fsm(&ctx, Key(b'a' as i64), Key(b'z' as i64)).unwrap();
            rest.union_op(&mut ctx, tail).unwrap();
            rest.star_op(&mut ctx).unwrap();
            first.concat_op(&mut ctx, rest).unwrap();
            first.minimize_partition2(&ctx);
            black_box(first)
        })
    });
}

criterion_group!(
    benches,
    bench_keyword_union,
    bench_minimize_stable,
    bench_minimize_partition,
    bench_star_concat_pipeline
);
criterion_main!(benches);
