use criterion::{black_box, criterion_group, criterion_main, Criterion};
use plc_gateway::{
    encode_commands, BroadcastFrame, CommandReader, MemoryBlock, Value, ValueKind, WriteCommand,
};

fn bench_broadcast_frame(c: &mut Criterion) {
    let blocks: Vec<MemoryBlock> = (0..16).map(|n| MemoryBlock::new(n, 256)).collect();
    c.bench_function("assemble_broadcast_16x256", |b| {
        b.iter(|| {
            let mut frame = BroadcastFrame::new();
            for block in &blocks {
                block.set_dirty();
                if let Some(bytes) = block.take_if_dirty() {
                    frame.push_chunk(block.num(), &bytes).unwrap();
                }
            }
            black_box(frame.finish())
        })
    });
}

fn bench_update_bytes(c: &mut Criterion) {
    let block = MemoryBlock::new(1, 1024);
    let same = vec![0u8; 1024];
    c.bench_function("update_bytes_unchanged_1k", |b| {
        b.iter(|| black_box(block.update_bytes(black_box(same.clone()))))
    });
}

fn bench_command_decode(c: &mut Criterion) {
    let commands: Vec<WriteCommand> = (0..64u32)
        .map(|i| match i % 4 {
            0 => WriteCommand::from_value(1, i * 16, &Value::Bool(true)),
            1 => WriteCommand::from_value(1, i * 16, &Value::Int16(i as i16)),
            2 => WriteCommand::from_value(2, i * 16, &Value::Int32(-(i as i32))),
            _ => WriteCommand::from_value(3, i * 16, &Value::Float32(i as f32 * 0.5)),
        })
        .collect();
    let frame = encode_commands(&commands);
    c.bench_function("decode_64_commands", |b| {
        b.iter(|| {
            CommandReader::new(black_box(&frame))
                .unwrap()
                .filter(Result::is_ok)
                .count()
        })
    });
}

fn bench_value_codec(c: &mut Criterion) {
    let block: Vec<u8> = (0..64).collect();
    c.bench_function("decode_float32", |b| {
        b.iter(|| Value::decode(ValueKind::Float32, black_box(&block), black_box(96)))
    });
}

criterion_group!(
    benches,
    bench_broadcast_frame,
    bench_update_bytes,
    bench_command_decode,
    bench_value_codec
);
criterion_main!(benches);
