use criterion::{black_box, criterion_group, criterion_main, Criterion};
use photond::core::channels::{ChannelBuffer, ChannelHub};
use serde_json::json;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

// Performance benchmarks for the per-channel replay buffer
fn bench_buffer_push(c: &mut Criterion) {
    c.bench_function("buffer_push_at_capacity", |b| {
        let mut buffer = ChannelBuffer::new(30);
        for i in 0..30 {
            buffer.push(json!({ "idx": i }));
        }
        b.iter(|| {
            let event = buffer.push(black_box(json!({"event": "state-changed"})));
            black_box(event.id);
        });
    });
}

fn bench_buffer_since(c: &mut Criterion) {
    // Ten events already evicted
    let mut buffer = ChannelBuffer::new(30);
    for i in 0..40 {
        buffer.push(json!({ "idx": i }));
    }
    let newest = buffer.newest_id().unwrap_or(0);

    c.bench_function("buffer_since_tail", |b| {
        b.iter(|| black_box(buffer.since(black_box(newest - 5))));
    });

    c.bench_function("buffer_since_refresh", |b| {
        b.iter(|| black_box(buffer.since(black_box(1))));
    });
}

fn bench_hub_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let hub = ChannelHub::new(30);
    let mut receivers = Vec::new();

    rt.block_on(async {
        for conn in 0..32 {
            let (tx, rx) = mpsc::unbounded_channel();
            hub.subscribe("todo", conn, tx, None).await;
            receivers.push(rx);
        }
    });

    c.bench_function("hub_publish_32_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let id = hub.publish("todo", black_box(json!({"idx": 1})), Some(0)).await;
                black_box(id);
            });
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        });
    });
}

criterion_group!(benches, bench_buffer_push, bench_buffer_since, bench_hub_fanout);
criterion_main!(benches);
