use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tessera_core::codec::{ErasureConfig, FragmentCodec};

const SIZES: [usize; 2] = [1024 * 1024, 10 * 1024 * 1024];

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

fn bench_encode(c: &mut Criterion) {
    let codec = FragmentCodec::new(ErasureConfig::new(4, 2)).unwrap();
    let mut group = c.benchmark_group("encode_4_2");
    for size in SIZES {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| codec.encode(black_box(data)).unwrap())
        });
    }
    group.finish();
}

fn bench_decode_with_losses(c: &mut Criterion) {
    let codec = FragmentCodec::new(ErasureConfig::new(4, 2)).unwrap();
    let mut group = c.benchmark_group("decode_4_2_two_lost");
    for size in SIZES {
        let encoded = codec.encode(&payload(size)).unwrap();
        // drop one data and one parity fragment
        let survivors: Vec<_> = encoded
            .fragments
            .iter()
            .filter(|f| f.index != 1 && f.index != 5)
            .cloned()
            .collect();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &survivors, |b, survivors| {
            b.iter(|| codec.decode(&encoded.layout, black_box(survivors.clone())).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode_with_losses);
criterion_main!(benches);
