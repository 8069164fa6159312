//! Scanner throughput benchmarks
//!
//! - **strings**: multi-encoding string extraction over mixed binary data,
//!   with the default encodings and with every encoding enabled.
//! - **signature**: anchored (literal prefix) and unanchored (leading
//!   wildcard) signature searches over the same buffer.
//!
//! ```bash
//! cargo bench --bench scan
//! cargo bench --bench scan -- signature
//! ```

use binprobe::{
    scan_signature, Device, MemoryMap, SignatureSet, StringScanOptions, StringScanner,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

const BUFFER_SIZE: usize = 1024 * 1024;

/// Pseudo-random bytes with an ASCII and a UTF-16 string every 4 KiB.
fn mixed_buffer() -> Vec<u8> {
    let mut data = Vec::with_capacity(BUFFER_SIZE);
    let mut state = 0x2545_F491_u32;
    while data.len() < BUFFER_SIZE {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        data.extend_from_slice(&state.to_le_bytes());
    }
    for block in (0..BUFFER_SIZE - 0x100).step_by(0x1000) {
        let ascii = b"\0kernel32.dll\0";
        data[block..block + ascii.len()].copy_from_slice(ascii);
        let wide: Vec<u8> = "\0GetProcAddress"
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        data[block + 0x40..block + 0x40 + wide.len()].copy_from_slice(&wide);
        data[block + 0x80..block + 0x84].copy_from_slice(&[0x55, 0x8B, 0xEC, 0x83]);
    }
    data
}

fn bench_strings(c: &mut Criterion) {
    let data = mixed_buffer();
    let mut group = c.benchmark_group("strings");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for (name, options) in [
        ("default", StringScanOptions::new()),
        ("all_encodings", StringScanOptions::all()),
    ] {
        let scanner = StringScanner::new(options);
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut src = data.as_slice();
                let mut device = Device::new(&mut src);
                black_box(scanner.collect(&mut device, 0, None, None).len())
            });
        });
    }
    group.finish();
}

fn bench_signature(c: &mut Criterion) {
    let data = mixed_buffer();
    let map = MemoryMap::flat(data.len() as u64);
    let mut group = c.benchmark_group("signature");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for (name, text) in [("anchored", "55 8B EC 83"), ("wildcard", ".. 8B EC 83")] {
        let Ok(signature) = SignatureSet::compile(text) else {
            continue;
        };
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut src = data.as_slice();
                let mut device = Device::new(&mut src);
                black_box(scan_signature(&mut device, &map, &signature, 0, None, "", 0, None).len())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_strings, bench_signature);
criterion_main!(benches);
