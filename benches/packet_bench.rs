use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use peerwire::core::partial::PartialPacket;
use peerwire::protocol::handshake;
use peerwire::protocol::security::Security;
use peerwire::Packet;

#[allow(clippy::unwrap_used)]
fn built(size: usize) -> Packet {
    let mut packet = Packet::with_capacity(size + 64);
    packet
        .append("bench")
        .unwrap()
        .append(8_000_000_000i64)
        .unwrap()
        .append(vec![0xABu8; size])
        .unwrap();
    packet.finalize().unwrap();
    packet
}

#[allow(clippy::unwrap_used)]
fn bench_build_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_build_extract");
    let payload_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("build_{size}b"), |b| {
            b.iter_batched(
                || vec![0xABu8; size],
                |payload| {
                    let mut packet = Packet::with_capacity(size + 64);
                    packet
                        .append("bench")
                        .unwrap()
                        .append(8_000_000_000i64)
                        .unwrap()
                        .append(payload)
                        .unwrap();
                    packet.finalize().unwrap();
                    black_box(packet)
                },
                BatchSize::SmallInput,
            )
        });
        group.bench_function(format!("extract_{size}b"), |b| {
            let packet = built(size);
            b.iter(|| {
                let mut packet = packet.clone();
                let _: String = packet.extract().unwrap();
                let _: i64 = packet.extract().unwrap();
                black_box(packet.extract::<Vec<u8>>().unwrap())
            })
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");
    let frame = built(16 * 1024).as_bytes().to_vec();

    for &chunk in &[64usize, 1500, 65536] {
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_function(format!("chunks_of_{chunk}"), |b| {
            b.iter(|| {
                let mut partial = PartialPacket::new(1 << 20);
                for piece in frame.chunks(chunk) {
                    partial.feed(piece).unwrap();
                }
                black_box(partial.into_packet().unwrap())
            })
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_encryption(c: &mut Criterion) {
    let mut group = c.benchmark_group("encryption");

    let mut client = Security::new();
    let mut server = Security::new();
    let mut opening = handshake::opening_packet(&client).unwrap();
    let mut reply = handshake::respond(&mut server, &mut opening).unwrap();
    handshake::complete(&mut client, &mut reply).unwrap();

    group.bench_function("key_exchange", |b| {
        b.iter(|| {
            let mut client = Security::new();
            let mut server = Security::new();
            let mut opening = handshake::opening_packet(&client).unwrap();
            let mut reply = handshake::respond(&mut server, &mut opening).unwrap();
            handshake::complete(&mut client, &mut reply).unwrap();
        })
    });

    for &size in &[64usize, 4096, 65536] {
        let packet = built(size);
        let sealed = packet.to_encrypted(&client).unwrap();
        group.throughput(Throughput::Bytes(packet.len() as u64));
        group.bench_function(format!("seal_{size}b"), |b| {
            b.iter(|| black_box(packet.to_encrypted(&client).unwrap()))
        });
        group.bench_function(format!("open_{size}b"), |b| {
            b.iter(|| black_box(sealed.from_encrypted(&server).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_build_extract, bench_reassembly, bench_encryption);
criterion_main!(benches);
