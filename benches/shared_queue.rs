use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use visfeed::queue::Element;
use visfeed::SharedQueue;

fn bench_put_get_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_queue_roundtrip");
    for &payload_size in &[4 * 1024usize, 64 * 1024, 512 * 1024] {
        group.throughput(Throughput::Bytes(payload_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_size),
            &payload_size,
            |b, &payload_size| {
                let q = SharedQueue::with_arena(8, 256 * 1024 * 1024, 64 * 1024).unwrap();
                let payload = vec![0xabu8; payload_size];
                b.iter(|| {
                    q.put(Some(black_box(&payload)), &0u32, None).unwrap();
                    match q.get::<u32>(false).unwrap() {
                        Element::Data { payload, .. } => {
                            black_box(payload.into_bytes().unwrap());
                        }
                        Element::Control(_) => unreachable!(),
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_cross_thread_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_queue_cross_thread");
    group.sample_size(20);
    for &count in &[256usize, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let q = SharedQueue::with_arena(16, 64 * 1024 * 1024, 64 * 1024).unwrap();
                let producer = {
                    let q = q.clone();
                    std::thread::spawn(move || {
                        let payload = vec![0x5au8; 16 * 1024];
                        for i in 0..count {
                            q.put(Some(&payload), &(i as u64), None).unwrap();
                        }
                    })
                };
                for _ in 0..count {
                    match q.get::<u64>(false).unwrap() {
                        Element::Data { payload, .. } => {
                            black_box(payload.into_bytes().unwrap());
                        }
                        Element::Control(_) => unreachable!(),
                    }
                }
                producer.join().unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_put_get_roundtrip, bench_cross_thread_stream);
criterion_main!(benches);
