use rand::Rng;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use downlink::packet::{assemble, MAX_PAYLOAD, TYPE_COEFFICIENTS};
use downlink::pipeline::coefficients_payload;
use downlink::queue::{PacketQueue, QUEUE_CAPACITY};

fn bench_assemble(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let coefficients: Vec<i16> = (0..MAX_PAYLOAD / 2).map(|_| rng.gen()).collect();

    let mut group = c.benchmark_group("packet");
    group.throughput(Throughput::Bytes(MAX_PAYLOAD as u64));
    group.bench_function("assemble", |b| {
        b.iter(|| {
            let payload = coefficients_payload(&coefficients);
            assemble(&payload, TYPE_COEFFICIENTS).unwrap()
        });
    });
    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let packet = assemble(&[0u8; MAX_PAYLOAD], TYPE_COEFFICIENTS).unwrap();

    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(QUEUE_CAPACITY as u64));
    group.bench_function("fill_drain", |b| {
        let mut queue = PacketQueue::default();
        b.iter(|| {
            while queue.push(packet.clone()).is_ok() {}
            while queue.pop().is_ok() {}
        });
    });
    group.finish();
}

criterion_group!(benches, bench_assemble, bench_queue);
criterion_main!(benches);
