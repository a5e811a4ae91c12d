use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cqrpc_core::{promise, stream, tie, Future};

fn future_chain(c: &mut Criterion) {
    c.bench_function("future_then_x8", |b| {
        b.iter(|| {
            let (p, f) = promise::<u64>();
            let f = f
                .then(|v| v + 1)
                .then(|v| v * 2)
                .then(|v| v + 3)
                .then(|v| v * 4)
                .then(|v| v + 5)
                .then(|v| v * 6)
                .then(|v| v + 7)
                .then(|v| v * 8);
            p.set_value(black_box(1));
            f.get()
        })
    });

    c.bench_function("tie_pair", |b| {
        b.iter(|| tie((Future::ready(black_box(1u32)), Future::ready(2u32))).get())
    });
}

fn stream_delivery(c: &mut Criterion) {
    c.bench_function("stream_push_1k", |b| {
        b.iter(|| {
            let (tx, rx) = stream::<u64>();
            let mut sum = 0u64;
            let done = rx.for_each(move |v| sum = sum.wrapping_add(v));
            for i in 0..1000 {
                tx.push(black_box(i));
            }
            tx.complete();
            done.get()
        })
    });
}

criterion_group!(benches, future_chain, stream_delivery);
criterion_main!(benches);
