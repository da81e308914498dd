use corelink_core::queue::{MpscQueue, SpscQueue};
use criterion::{criterion_group, criterion_main, Criterion};

fn bench_mpsc_push_pop(c: &mut Criterion) {
    c.bench_function("mpsc_push_pop", |b| {
        let q: MpscQueue<u64> = MpscQueue::with_capacity(4096);
        b.iter(|| {
            q.push(1).ok();
            q.pop();
        });
    });
}

fn bench_spsc_push_pop(c: &mut Criterion) {
    c.bench_function("spsc_push_pop", |b| {
        let q: SpscQueue<u64> = SpscQueue::with_capacity(4096);
        b.iter(|| {
            q.push(1).ok();
            q.pop();
        });
    });
}

criterion_group!(benches, bench_mpsc_push_pop, bench_spsc_push_pop);
criterion_main!(benches);
