use bytes::Bytes;
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rask_ingest_buffer::buffer::RingBuffer;
use rask_ingest_buffer::domain::Event;

fn create_test_event(id: usize) -> Event {
    Event::new("bench", Bytes::from(format!("<34>Oct 11 bench message {id}")))
}

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_add");

    for &size in [1_000, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let events: Vec<Event> = (0..size).map(create_test_event).collect();
            b.iter(|| {
                let mut ring = RingBuffer::new(size);
                for event in events.iter().cloned() {
                    std::hint::black_box(ring.add(event));
                }
            });
        });
    }
    group.finish();
}

fn bench_add_with_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_add_with_eviction");
    group.throughput(Throughput::Elements(100_000));
    group.bench_function("capacity_1000", |b| {
        let events: Vec<Event> = (0..100_000).map(create_test_event).collect();
        b.iter(|| {
            let mut ring = RingBuffer::new(1_000);
            for event in events.iter().cloned() {
                std::hint::black_box(ring.add(event));
            }
        });
    });
    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_drain");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("get_10k", |b| {
        let events: Vec<Event> = (0..10_000).map(create_test_event).collect();
        b.iter_batched(
            || {
                let mut ring = RingBuffer::new(10_000);
                for event in events.iter().cloned() {
                    ring.add(event);
                }
                ring
            },
            |mut ring| {
                while let Some(event) = ring.get() {
                    std::hint::black_box(event);
                }
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_add, bench_add_with_eviction, bench_drain);
criterion_main!(benches);
