use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use cohort_core::{ApplicationPart, GroupId, Message, MessagePart, NodeId};
use cohort_store::{CborSerializer, MessageLogCodec};

fn messages(count: usize) -> Vec<Message> {
    let source = NodeId::from_u128(1);
    (0..count)
        .map(|n| {
            Message::to_group(
                source,
                GroupId::new("bench"),
                MessagePart::Application(ApplicationPart::new("put", vec![n as u8; 256])),
            )
        })
        .collect()
}

fn bench_message_log(c: &mut Criterion) {
    let codec = MessageLogCodec::new(Arc::new(CborSerializer));
    let batch = messages(1_000);
    let image = codec.encode(&batch).unwrap_or_default();

    c.bench_function("encode_1000", |b| {
        b.iter(|| codec.encode(black_box(&batch)))
    });

    c.bench_function("decode_1000", |b| {
        b.iter_batched(|| image.clone(), |image| codec.decode(&image), BatchSize::SmallInput)
    });
}

criterion_group!(benches, bench_message_log);
criterion_main!(benches);
