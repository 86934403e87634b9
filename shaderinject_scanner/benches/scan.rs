use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use shaderinject_scanner::*;

fn random(size: usize, needle: &[u8]) -> Vec<u8> {
    use rand::prelude::*;
    let mut rng = StdRng::seed_from_u64(0);
    let mut data: Vec<u8> = Vec::with_capacity(size);
    data.extend((0..size - needle.len()).map(|_| rng.gen::<u8>()));
    data.extend(needle);
    data
}

fn module(c: &mut Criterion) {
    let size = 64 * 1024 * 1024;
    let needle = b"\xf9\x82\xdb\xdb\x2d\x32\x6f\x15\x11\x44\x54\xf4\xc8\xaa\xd1\x72\x53\x96\xa5\x7b\x22\x24\x94\x7f\xec\x28\xc7\xe0\x5e\xd4\xae\x39";
    let data = random(size, needle);

    let pattern = pattern!("f9 82 db db 2d ?? 6f 15 ?? 44 54 f4 c8 aa d1 72 53 ?? a5 7b 22 24 94 7f ec 28 ?? e0 5e d4 ae 39");
    assert_eq!(scan(&pattern, &data), Some(size - needle.len()));

    c.bench_function("module scan", |b| b.iter(|| scan(&pattern, &data)));
}

fn anchor(c: &mut Criterion) {
    let size = 16 * 1024 * 1024;
    let needle = b"\xff\x90\x78\x01\x00\x00\x8b\xd8\x85\xc0\x0f\x89\x01\x02\x03\x04\x4c\x89\x6c\x24\x68";
    let data = random(size, needle);

    let mut group = c.benchmark_group("anchor");
    for p in [
        "FF ? ? ? ? ? ? ? ? ? ? ? ? ? ? ? ? ? ? ? 68",
        "FF 90 ? ? ? ? ? ? ? ? ? ? ? ? ? ? ? ? ? ? ?",
        "FF 90 78 01 00 00 8B D8 85 C0 0F 89 ? ? ? ? 4C 89 6C 24 68",
    ] {
        let pattern = Pattern::new(p).unwrap();
        group.bench_with_input(
            BenchmarkId::new("run", pattern.longest_run().len()),
            &pattern,
            |b, pattern| b.iter(|| scan(pattern, &data)),
        );
    }
    group.finish();
}

criterion_group! {
    name = bench1;
    config = Criterion::default().sample_size(30);
    targets = module
}
criterion_group!(bench2, anchor);

criterion_main!(bench1, bench2);
