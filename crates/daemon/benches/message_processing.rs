//! Performance benchmarks for the output path.
//!
//! These benchmarks measure the hot paths in the daemon:
//! - Control sequence stripping
//! - Chunked UTF-8 decoding
//! - Event encoding and hub fan-out

use std::sync::Arc;

use agentrelay::sanitize::{strip_control_sequences, OutputDecoder};
use agentrelay::EventHub;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use protocol::{Event, OutputEvent};

/// Typical agent output: colored text with cursor movement.
fn terminal_output(lines: usize) -> String {
    let mut out = String::new();
    for i in 0..lines {
        out.push_str("\x1b[2K\x1b[1G\x1b[1;34m●\x1b[0m Reading src/main.rs ");
        out.push_str(&format!("line {i} → “quoted” ✓\r\n"));
    }
    out.push_str("\x1b]0;claude\x07\x1b[?25h");
    out
}

/// Benchmark control sequence stripping.
fn bench_strip_control_sequences(c: &mut Criterion) {
    let mut group = c.benchmark_group("strip_control_sequences");

    for lines in [1usize, 64, 1024] {
        let input = terminal_output(lines);
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_function(format!("{lines}_lines"), |b| {
            b.iter(|| strip_control_sequences(black_box(&input)));
        });
    }

    let plain = "plain text without escapes\n".repeat(128);
    group.throughput(Throughput::Bytes(plain.len() as u64));
    group.bench_function("plain_text", |b| {
        b.iter(|| strip_control_sequences(black_box(&plain)));
    });

    group.finish();
}

/// Benchmark decoding reads that split multi-byte characters.
fn bench_output_decoder(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_decoder");

    let bytes = terminal_output(256).into_bytes();
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    for chunk_size in [7usize, 1024, 8192] {
        group.bench_function(format!("chunks_of_{chunk_size}"), |b| {
            b.iter(|| {
                let mut decoder = OutputDecoder::new();
                let mut total = 0;
                for chunk in bytes.chunks(chunk_size) {
                    total += decoder.push(black_box(chunk)).len();
                }
                total += decoder.finish().len();
                total
            });
        });
    }

    group.finish();
}

/// Benchmark event encoding and delivery to channel subscribers.
fn bench_hub_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("hub_publish");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let event = Event::from(OutputEvent::text("x".repeat(512)));

    group.bench_function("encode_frame", |b| {
        b.iter(|| black_box(&event).to_frame().unwrap());
    });

    for subscribers in [1usize, 8, 64] {
        let hub = Arc::new(EventHub::new());
        let mut receivers = runtime.block_on(async {
            let mut receivers = Vec::with_capacity(subscribers);
            for _ in 0..subscribers {
                let (_, rx) = hub.subscribe_channel().await;
                receivers.push(rx);
            }
            receivers
        });

        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_function(format!("{subscribers}_subscribers"), |b| {
            b.iter(|| {
                let delivered = runtime.block_on(hub.publish(black_box(&event)));
                for rx in &mut receivers {
                    while rx.try_recv().is_ok() {}
                }
                delivered
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_strip_control_sequences,
    bench_output_decoder,
    bench_hub_publish,
);

criterion_main!(benches);
