use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use netplay_engine::core::codec::StreamFramer;
use netplay_engine::core::packet::Packet;

fn wire(frames: usize, body: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for id in 0..frames {
        let mut packet = Packet::with_id(id as i32);
        packet.write_bytes(&vec![1u8; body]);
        packet.write_length();
        out.extend(packet.into_bytes());
    }
    out
}

#[allow(clippy::unwrap_used)]
fn bench_stream_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_framing");

    // many small frames per read, and frames split across reads
    for &(frames, body, read_size) in &[(256usize, 32usize, 4096usize), (16, 8192, 4096), (64, 100, 7)] {
        let data = wire(frames, body);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_function(format!("{frames}x{body}b_reads_of_{read_size}"), |b| {
            b.iter(|| {
                let mut framer = StreamFramer::new();
                let mut count = 0usize;
                for chunk in data.chunks(read_size) {
                    framer.push(chunk, |packet| {
                        count += 1;
                        black_box(packet);
                    })
                    .unwrap();
                }
                assert_eq!(count, frames);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_stream_framing);
criterion_main!(benches);
